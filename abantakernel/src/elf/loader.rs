// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// src/elf/loader.rs
//! Validate an ELF64 image, place its PT_LOAD segments, relocate it.
//!
//! Every check that only needs the file runs before the first allocation.
//! After that, any failure hands every region of this attempt back.

use heapless::Vec as HVec;
use xmas_elf::{
    ElfFile,
    header::{Machine, Type as ElfType},
    program::Type as PhType,
};

use super::{
    DynamicInfo, EHDR_SIZE, FileView, ImageKind, MAX_SEGMENTS, PHDR_SIZE, Segment, SegmentFlags,
    SymbolResolver, read_u16, region_for, reloc,
};
use crate::error::{AllocationError, LoadError};
use crate::mem::{PAGE_SIZE, PageSource, Region, align_down, align_up};
use crate::module::LoadedModule;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

/// How segment addresses become memory addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Fixed for ET_EXEC, relocatable for ET_DYN.
    #[default]
    Auto,
    /// Claim exactly the declared addresses (bias 0).
    Fixed,
    /// One allocation anywhere; bias = base - page-aligned lowest vaddr.
    ///
    /// The whole page-aligned span must come from a single
    /// [`PageSource::allocate`] call. [`PhysPageAllocator`] hands out one
    /// frame per call, so after exit only images spanning at most 4 KiB load
    /// this way; larger ones fail with [`AllocationError::NotSupported`].
    ///
    /// [`PhysPageAllocator`]: crate::mem::frame::PhysPageAllocator
    Relocatable,
}

/// Where an image ended up: its bias and every region it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    bias: u64,
    regions: HVec<Region, MAX_SEGMENTS>,
}

impl Placement {
    pub fn new(bias: u64) -> Self {
        Self {
            bias,
            regions: HVec::new(),
        }
    }

    pub fn push(&mut self, region: Region) -> Result<(), Region> {
        self.regions.push(region)
    }

    pub fn bias(&self) -> u64 {
        self.bias
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region_for(&self, addr: u64, len: usize) -> Option<&Region> {
        region_for(&self.regions, addr, len)
    }

    pub fn footprint(&self) -> u64 {
        self.regions.iter().map(|r| r.len() as u64).sum()
    }

    fn release<M: PageSource + ?Sized>(self, mem: &mut M) {
        for r in self.regions {
            mem.release(r);
        }
    }
}

/// PT_LOAD segments (unbiased) plus the file view over them.
struct Layout<'a> {
    segments: HVec<Segment, MAX_SEGMENTS>,
    offsets: HVec<usize, MAX_SEGMENTS>,
    view: FileView<'a>,
    dynamic: Option<(usize, usize)>,
    lo: u64,
    hi: u64,
}

fn check_ident(image: &[u8]) -> Result<(), LoadError> {
    if image.len() < ELF_MAGIC.len() || image[..4] != ELF_MAGIC {
        return Err(LoadError::BadMagic);
    }
    if image.len() < EHDR_SIZE {
        return Err(LoadError::Malformed("truncated file header"));
    }
    if image[4] != ELFCLASS64 {
        return Err(LoadError::WrongClass(image[4]));
    }
    if image[5] != ELFDATA2LSB {
        return Err(LoadError::WrongEndian(image[5]));
    }
    // xmas-elf reads headers in place.
    if image.as_ptr() as usize % 8 != 0 {
        return Err(LoadError::Malformed("image buffer not 8-byte aligned"));
    }
    Ok(())
}

fn image_kind(image: &[u8], elf: &ElfFile<'_>) -> Result<ImageKind, LoadError> {
    if elf.header.pt2.machine().as_machine() != Machine::X86_64 {
        return Err(LoadError::UnsupportedMachine(read_u16(image, 18).unwrap_or(0)));
    }
    match elf.header.pt2.type_().as_type() {
        ElfType::Executable => Ok(ImageKind::Executable),
        ElfType::SharedObject => Ok(ImageKind::SharedObject),
        _ => Err(LoadError::UnsupportedImageType(read_u16(image, 16).unwrap_or(0))),
    }
}

fn file_range(image: &[u8], offset: u64, len: u64) -> Option<(usize, usize)> {
    let end = offset.checked_add(len)?;
    (end <= image.len() as u64).then_some((offset as usize, len as usize))
}

fn scan<'a>(image: &'a [u8], elf: &ElfFile<'a>) -> Result<Layout<'a>, LoadError> {
    let phoff = elf.header.pt2.ph_offset();
    let phnum = elf.header.pt2.ph_count() as u64;
    if phnum == 0 {
        return Err(LoadError::NoLoadableSegments);
    }
    if elf.header.pt2.ph_entry_size() as usize != PHDR_SIZE {
        return Err(LoadError::Malformed("program header entry size"));
    }
    if phoff % 8 != 0 || file_range(image, phoff, phnum * PHDR_SIZE as u64).is_none() {
        return Err(LoadError::ProgramHeadersOutOfBounds);
    }

    let mut layout = Layout {
        segments: HVec::new(),
        offsets: HVec::new(),
        view: FileView::new(image),
        dynamic: None,
        lo: u64::MAX,
        hi: 0,
    };

    for (index, ph) in elf.program_iter().enumerate() {
        match ph.get_type() {
            Ok(PhType::Load) => {
                let (vaddr, filesz, memsz) = (ph.virtual_addr(), ph.file_size(), ph.mem_size());
                if memsz == 0 {
                    continue;
                }
                let (off, len) = file_range(image, ph.offset(), filesz)
                    .ok_or(LoadError::SegmentOutOfBounds { index })?;
                let end = vaddr.checked_add(memsz).ok_or(LoadError::BadSegment { index })?;
                if filesz > memsz {
                    return Err(LoadError::BadSegment { index });
                }
                let mut flags = SegmentFlags::empty();
                flags.set(SegmentFlags::READ, ph.flags().is_read());
                flags.set(SegmentFlags::WRITE, ph.flags().is_write());
                flags.set(SegmentFlags::EXECUTE, ph.flags().is_execute());
                layout
                    .segments
                    .push(Segment {
                        vaddr,
                        file_size: filesz,
                        mem_size: memsz,
                        flags,
                    })
                    .map_err(|_| LoadError::TooManySegments)?;
                let _ = layout.offsets.push(off);
                if !layout.view.add_span(vaddr, off, len) {
                    return Err(LoadError::TooManySegments);
                }
                layout.lo = layout.lo.min(vaddr);
                layout.hi = layout.hi.max(end);
            }
            Ok(PhType::Dynamic) => {
                let range = file_range(image, ph.offset(), ph.file_size())
                    .ok_or(LoadError::DynamicOutOfBounds)?;
                ph.virtual_addr()
                    .checked_add(ph.file_size())
                    .ok_or(LoadError::DynamicOutOfBounds)?;
                if !layout.view.add_span(ph.virtual_addr(), range.0, range.1) {
                    return Err(LoadError::TooManySegments);
                }
                layout.dynamic = Some(range);
            }
            _ => {}
        }
    }

    if layout.segments.is_empty() {
        return Err(LoadError::NoLoadableSegments);
    }
    Ok(layout)
}

/// Page spans of all segments, sorted, overlapping spans merged.
fn fixed_spans(segments: &[Segment]) -> Result<HVec<(u64, u64), MAX_SEGMENTS>, LoadError> {
    let mut spans: HVec<(u64, u64), MAX_SEGMENTS> = HVec::new();
    for (index, s) in segments.iter().enumerate() {
        let start = align_down(s.vaddr, PAGE_SIZE as u64);
        let end = align_up(s.vaddr + s.mem_size, PAGE_SIZE as u64)
            .ok_or(LoadError::BadSegment { index })?;
        let _ = spans.push((start, end));
    }
    spans.sort_unstable();

    let mut merged: HVec<(u64, u64), MAX_SEGMENTS> = HVec::new();
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start < last.1 => last.1 = last.1.max(end),
            _ => {
                let _ = merged.push((start, end));
            }
        }
    }
    Ok(merged)
}

fn place<M: PageSource + ?Sized>(
    kind: ImageKind,
    policy: LoadPolicy,
    layout: &Layout<'_>,
    mem: &mut M,
) -> Result<Placement, LoadError> {
    let fixed = match (policy, kind) {
        (LoadPolicy::Fixed, _) | (LoadPolicy::Auto, ImageKind::Executable) => true,
        (LoadPolicy::Relocatable, ImageKind::Executable) => return Err(LoadError::PolicyMismatch),
        (_, ImageKind::SharedObject) => false,
    };

    if fixed {
        let mut placement = Placement::new(0);
        for (start, end) in fixed_spans(&layout.segments)? {
            match mem.allocate_at(start, (end - start) as usize) {
                Ok(r) => {
                    let _ = placement.push(r);
                }
                Err(e) => {
                    log::warn!("[elf] fixed span {:#x}..{:#x}: {}", start, end, e);
                    placement.release(mem);
                    return Err(e.into());
                }
            }
        }
        return Ok(placement);
    }

    let lo = align_down(layout.lo, PAGE_SIZE as u64);
    let hi = align_up(layout.hi, PAGE_SIZE as u64).ok_or(LoadError::BadSegment { index: 0 })?;
    let region = mem.allocate((hi - lo) as usize)?;
    let mut placement = Placement::new(region.base().wrapping_sub(lo));
    let _ = placement.push(region);
    Ok(placement)
}

fn populate<M: PageSource + ?Sized>(
    image: &[u8],
    layout: &Layout<'_>,
    placement: &Placement,
    mem: &mut M,
) -> Result<(), LoadError> {
    for r in placement.regions() {
        mem.bytes_mut(r)
            .ok_or(AllocationError::OutOfRange { addr: r.base() })?
            .fill(0);
    }

    for (index, (seg, &off)) in layout.segments.iter().zip(layout.offsets.iter()).enumerate() {
        let dst = placement.bias().wrapping_add(seg.vaddr);
        let region = placement
            .region_for(dst, seg.mem_size as usize)
            .ok_or(LoadError::SegmentOutOfBounds { index })?;
        let at = (dst - region.base()) as usize;
        let bytes = mem
            .bytes_mut(region)
            .ok_or(AllocationError::OutOfRange { addr: region.base() })?;
        let filesz = seg.file_size as usize;
        bytes[at..at + filesz].copy_from_slice(&image[off..off + filesz]);
        log::debug!(
            "[elf] PT_LOAD {:#x} file={:#x} mem={:#x} {:?}",
            dst,
            seg.file_size,
            seg.mem_size,
            seg.flags
        );
    }
    Ok(())
}

/// Load `image` as module `name`.
///
/// External symbols are resolved through `resolver`. The image stays
/// referenced by the returned module for symbol lookups.
pub fn load<M, R>(
    name: &'static str,
    image: &'static [u8],
    policy: LoadPolicy,
    mem: &mut M,
    resolver: &R,
) -> Result<LoadedModule, LoadError>
where
    M: PageSource + ?Sized,
    R: SymbolResolver + ?Sized,
{
    check_ident(image)?;
    let elf = ElfFile::new(image).map_err(LoadError::Malformed)?;
    let kind = image_kind(image, &elf)?;
    let layout = scan(image, &elf)?;
    let dynamic = match layout.dynamic {
        Some((off, len)) => DynamicInfo::parse(layout.view.clone(), &image[off..off + len], &elf)?,
        None => DynamicInfo::empty(layout.view.clone()),
    };

    let placement = place(kind, policy, &layout, mem)?;
    let applied = match populate(image, &layout, &placement, mem).and_then(|()| {
        if dynamic.has_relocations() {
            reloc::apply(&placement, mem, &dynamic, resolver).map_err(LoadError::from)
        } else {
            Ok(0)
        }
    }) {
        Ok(n) => n,
        Err(e) => {
            log::warn!("[elf] {}: {}", name, e);
            placement.release(mem);
            return Err(e);
        }
    };

    let bias = placement.bias();
    let entry = bias.wrapping_add(elf.header.pt2.entry_point());
    let mut segments = HVec::new();
    for s in &layout.segments {
        let _ = segments.push(Segment {
            vaddr: bias.wrapping_add(s.vaddr),
            ..*s
        });
    }
    let runnable = segments.iter().any(|s: &Segment| {
        s.flags.contains(SegmentFlags::EXECUTE) && entry.wrapping_sub(s.vaddr) < s.mem_size
    });
    if !runnable {
        log::warn!("[elf] {}: entry {:#x} is not in an executable segment", name, entry);
    }

    let base = placement.regions().iter().map(|r| r.base()).min().unwrap_or(0);
    log::info!(
        "[elf] {} loaded: base={:#x} bias={:#x} entry={:#x} footprint={:#x} relocs={}",
        name,
        base,
        bias,
        entry,
        placement.footprint(),
        applied
    );

    Ok(LoadedModule {
        name,
        base,
        footprint: placement.footprint(),
        bias,
        entry,
        kind,
        segments,
        placement,
        dynamic,
    })
}
