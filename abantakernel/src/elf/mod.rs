// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! ELF64 (x86_64, little-endian) modules: placement, dynamic tables, RELA.
//!
//! xmas-elf parses the file header and walks the header tables once their
//! bounds have been checked here. Dynamic entries, symbols and relocations
//! are decoded by hand from the file bytes.

pub mod dynamic;
pub mod loader;
pub mod reloc;

use bitflags::bitflags;
use heapless::Vec as HVec;

use crate::mem::Region;

pub use dynamic::{DynSymbols, DynamicInfo, RelaTable, Symbol};
pub use loader::{LoadPolicy, Placement, load};
pub use reloc::{SymbolResolver, apply};

/// PT_LOAD segments per image.
pub const MAX_SEGMENTS: usize = 8;

pub(crate) const EHDR_SIZE: usize = 64;
pub(crate) const PHDR_SIZE: usize = 56;
pub(crate) const SHDR_SIZE: usize = 64;
pub const SYM_SIZE: u64 = 24;
pub const RELA_SIZE: u64 = 24;

pub(crate) fn read_u16(buf: &[u8], off: usize) -> Option<u16> {
    let b = buf.get(off..off.checked_add(2)?)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    let b = buf.get(off..off.checked_add(4)?)?;
    let mut a = [0u8; 4];
    a.copy_from_slice(b);
    Some(u32::from_le_bytes(a))
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> Option<u64> {
    let b = buf.get(off..off.checked_add(8)?)?;
    let mut a = [0u8; 8];
    a.copy_from_slice(b);
    Some(u64::from_le_bytes(a))
}

bitflags! {
    /// p_flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

/// A PT_LOAD segment as placed in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Biased virtual (= physical) address.
    pub vaddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub flags: SegmentFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// ET_EXEC: addresses are absolute.
    Executable,
    /// ET_DYN: addresses are relative to wherever the image lands.
    SharedObject,
}

/// File-backed part of a program header: `[vaddr, vaddr + len)` lives at
/// `offset` in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSpan {
    vaddr: u64,
    offset: usize,
    len: usize,
}

/// Unbiased virtual addresses resolved against the file image.
///
/// Dynamic tables are read from here rather than from loaded memory, so a
/// relocation can never rewrite a table the relocator still has to read.
#[derive(Debug, Clone)]
pub struct FileView<'a> {
    bytes: &'a [u8],
    spans: HVec<FileSpan, { MAX_SEGMENTS + 1 }>,
}

impl<'a> FileView<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            spans: HVec::new(),
        }
    }

    /// Caller has already checked `offset + len` against the file.
    pub(crate) fn add_span(&mut self, vaddr: u64, offset: usize, len: usize) -> bool {
        len == 0 || self.spans.push(FileSpan { vaddr, offset, len }).is_ok()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// `len` bytes at `vaddr`, when one span holds all of them.
    pub fn slice(&self, vaddr: u64, len: usize) -> Option<&'a [u8]> {
        let end = vaddr.checked_add(len as u64)?;
        let span = self
            .spans
            .iter()
            .find(|s| vaddr >= s.vaddr && end <= s.vaddr + s.len as u64)?;
        let start = span.offset + (vaddr - span.vaddr) as usize;
        self.bytes.get(start..start + len)
    }

    /// Everything from `vaddr` to the end of its span.
    pub fn tail(&self, vaddr: u64) -> Option<&'a [u8]> {
        let span = self
            .spans
            .iter()
            .find(|s| vaddr >= s.vaddr && vaddr < s.vaddr + s.len as u64)?;
        let start = span.offset + (vaddr - span.vaddr) as usize;
        self.bytes.get(start..span.offset + span.len)
    }

    pub fn u32_at(&self, vaddr: u64) -> Option<u32> {
        read_u32(self.slice(vaddr, 4)?, 0)
    }

    pub fn u64_at(&self, vaddr: u64) -> Option<u64> {
        read_u64(self.slice(vaddr, 8)?, 0)
    }
}

/// The region of `regions` that holds all of `[addr, addr + len)`.
pub(crate) fn region_for(regions: &[Region], addr: u64, len: usize) -> Option<&Region> {
    regions.iter().find(|r| r.contains(addr, len))
}
