// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Host-side stand-ins: page-aligned scratch memory, an arena that pretends
//! to sit at a chosen physical address, and a small ELF64 image writer.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::vec::Vec;

use crate::error::AllocationError;
use crate::mem::{PAGE_SIZE, PageSource, Region, align_down, align_up};

/// Real, 4 KiB aligned heap pages whose addresses are used as "physical".
pub struct HostPages {
    ptr: *mut u8,
    layout: Layout,
}

impl HostPages {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages.max(1) * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    pub fn base(&self) -> u64 {
        self.ptr as u64
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HostPages {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

/// `PageSource` over a `Vec`, answering to addresses `[base, base + len)`.
///
/// Allocation is first-fit over pages and may span several of them, so
/// images larger than a frame can be placed.
pub struct Arena {
    base: u64,
    mem: Vec<u8>,
    used: Vec<bool>,
    calls: usize,
}

impl Arena {
    pub fn new(base: u64, pages: usize) -> Self {
        Self {
            base,
            mem: vec![0u8; pages * PAGE_SIZE],
            used: vec![false; pages],
            calls: 0,
        }
    }

    /// allocate/allocate_at calls, successful or not.
    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn pages_in_use(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let off = (addr - self.base) as usize;
        u64::from_le_bytes(self.mem[off..off + 8].try_into().unwrap())
    }

    pub fn read(&self, addr: u64, len: usize) -> &[u8] {
        let off = (addr - self.base) as usize;
        &self.mem[off..off + len]
    }

    fn page_index(&self, addr: u64) -> usize {
        ((addr - self.base) / PAGE_SIZE as u64) as usize
    }

    fn whole(&self) -> Region {
        Region::new(self.base, self.mem.len())
    }
}

impl PageSource for Arena {
    fn allocate(&mut self, size: usize) -> Result<Region, AllocationError> {
        self.calls += 1;
        if size == 0 {
            return Err(AllocationError::ZeroSize);
        }
        let pages = size.div_ceil(PAGE_SIZE);
        let mut run = 0;
        for i in 0..self.used.len() {
            run = if self.used[i] { 0 } else { run + 1 };
            if run == pages {
                let first = i + 1 - pages;
                self.used[first..=i].fill(true);
                return Ok(Region::new(
                    self.base + (first * PAGE_SIZE) as u64,
                    pages * PAGE_SIZE,
                ));
            }
        }
        Err(AllocationError::OutOfFrames)
    }

    fn allocate_at(&mut self, addr: u64, size: usize) -> Result<Region, AllocationError> {
        self.calls += 1;
        if size == 0 {
            return Err(AllocationError::ZeroSize);
        }
        let start = align_down(addr, PAGE_SIZE as u64);
        let end = align_up(addr + size as u64, PAGE_SIZE as u64).unwrap();
        let wanted = Region::new(start, (end - start) as usize);
        if !self.whole().contains(start, wanted.len()) {
            return Err(AllocationError::OutOfRange { addr: start });
        }
        if let Some(busy) = wanted.pages().find(|p| self.used[self.page_index(*p)]) {
            return Err(AllocationError::Conflict { addr: busy });
        }
        for p in wanted.pages() {
            let i = self.page_index(p);
            self.used[i] = true;
        }
        Ok(wanted)
    }

    fn release(&mut self, region: Region) {
        for p in region.pages() {
            let i = self.page_index(p);
            self.used[i] = false;
        }
    }

    fn bytes(&self, region: &Region) -> Option<&[u8]> {
        let off = self.whole().offset_of(region.base(), region.len())?;
        Some(&self.mem[off..off + region.len()])
    }

    fn bytes_mut(&mut self, region: &Region) -> Option<&mut [u8]> {
        let off = self.whole().offset_of(region.base(), region.len())?;
        Some(&mut self.mem[off..off + region.len()])
    }
}

/// Copy into 8-byte aligned storage that lives for the rest of the test run.
pub fn leak(bytes: Vec<u8>) -> &'static [u8] {
    let words: Vec<u64> = vec![0u64; bytes.len().div_ceil(8).max(1)];
    let words: &'static mut [u64] = Box::leak(words.into_boxed_slice());
    let out = unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, bytes.len()) };
    out.copy_from_slice(&bytes);
    out
}

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const SHT_DYNSYM: u32 = 11;

/// Where the builder puts the non-loaded dynamic area (dynamic array and
/// every table it points at).
pub const META_VADDR: u64 = 0x10_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStyle {
    Sysv,
    Gnu,
    Section,
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct Sym {
    name: &'static str,
    value: u64,
    shndx: u16,
    weak: bool,
}

impl Sym {
    pub fn defined(name: &'static str, value: u64) -> Self {
        Self {
            name,
            value,
            shndx: 1,
            weak: false,
        }
    }

    pub fn absolute(name: &'static str, value: u64) -> Self {
        Self {
            name,
            value,
            shndx: 0xfff1,
            weak: false,
        }
    }

    pub fn undefined(name: &'static str) -> Self {
        Self {
            name,
            value: 0,
            shndx: 0,
            weak: false,
        }
    }

    pub fn weak_undefined(name: &'static str) -> Self {
        Self {
            weak: true,
            ..Self::undefined(name)
        }
    }
}

struct Seg {
    vaddr: u64,
    data: Vec<u8>,
    mem_size: u64,
    flags: u32,
}

#[derive(Clone, Copy)]
struct RelaSpec {
    offset: u64,
    kind: u32,
    sym: u32,
    addend: i64,
}

/// Writes minimal but well-formed x86_64 ELF64 images.
///
/// Layout: header, program headers, segment bytes, then the dynamic area at
/// [`META_VADDR`] covered only by PT_DYNAMIC, then section headers when the
/// symbol count must come from SHT_DYNSYM.
pub struct ElfBuilder {
    kind: u16,
    class: u8,
    data: u8,
    machine: u16,
    entry: u64,
    segments: Vec<Seg>,
    rela: Vec<RelaSpec>,
    plt: Vec<RelaSpec>,
    symbols: Vec<Sym>,
    hash: HashStyle,
    relaent: u64,
    nchain: Option<u32>,
}

impl ElfBuilder {
    fn new(kind: u16) -> Self {
        Self {
            kind,
            class: 2,
            data: 1,
            machine: 62,
            entry: 0,
            segments: Vec::new(),
            rela: Vec::new(),
            plt: Vec::new(),
            symbols: Vec::new(),
            hash: HashStyle::Sysv,
            relaent: 24,
            nchain: None,
        }
    }

    pub fn shared() -> Self {
        Self::new(ET_DYN)
    }

    pub fn executable() -> Self {
        Self::new(ET_EXEC)
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kind = kind;
        self
    }

    pub fn class(mut self, class: u8) -> Self {
        self.class = class;
        self
    }

    pub fn data(mut self, data: u8) -> Self {
        self.data = data;
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    pub fn segment(mut self, vaddr: u64, data: &[u8], mem_size: u64) -> Self {
        self.segments.push(Seg {
            vaddr,
            data: data.to_vec(),
            mem_size,
            flags: 7,
        });
        self
    }

    pub fn rela(mut self, offset: u64, kind: u32, sym: u32, addend: i64) -> Self {
        self.rela.push(RelaSpec {
            offset,
            kind,
            sym,
            addend,
        });
        self
    }

    pub fn relative(self, offset: u64, addend: i64) -> Self {
        self.rela(offset, 8, 0, addend)
    }

    pub fn jump_slot(mut self, offset: u64, sym: u32) -> Self {
        self.plt.push(RelaSpec {
            offset,
            kind: 7,
            sym,
            addend: 0,
        });
        self
    }

    /// Symbol index `n` is the n-th call (index 0 is the null symbol).
    pub fn symbol(mut self, sym: Sym) -> Self {
        self.symbols.push(sym);
        self
    }

    pub fn hash(mut self, style: HashStyle) -> Self {
        self.hash = style;
        self
    }

    pub fn rela_entry_size(mut self, size: u64) -> Self {
        self.relaent = size;
        self
    }

    /// Override the DT_HASH chain count the image claims.
    pub fn nchain(mut self, n: u32) -> Self {
        self.nchain = Some(n);
        self
    }

    pub fn leak(self) -> &'static [u8] {
        leak(self.build())
    }

    pub fn build(self) -> Vec<u8> {
        let has_dynamic = !self.rela.is_empty() || !self.plt.is_empty() || !self.symbols.is_empty();
        let phnum = self.segments.len() + has_dynamic as usize;
        let mut out = vec![0u8; 64 + phnum * 56];

        let mut seg_offsets = Vec::new();
        for s in &self.segments {
            pad_to(&mut out, 16);
            seg_offsets.push(out.len() as u64);
            out.extend_from_slice(&s.data);
        }

        let mut dyn_span = (0u64, 0u64);
        let mut dynsym = None;
        if has_dynamic {
            pad_to(&mut out, 8);
            let (meta, symtab_off, symtab_len) = self.dynamic_area();
            dyn_span = (out.len() as u64, meta.len() as u64);
            dynsym = Some((dyn_span.0 + symtab_off, symtab_len));
            out.extend_from_slice(&meta);
        }

        let (mut shoff, mut shnum) = (0u64, 0u16);
        if let (HashStyle::Section, Some((off, len))) = (self.hash, dynsym)
            && !self.symbols.is_empty()
        {
            pad_to(&mut out, 8);
            shoff = out.len() as u64;
            shnum = 2;
            out.extend_from_slice(&[0u8; 64]);
            let mut sh = [0u8; 64];
            put32(&mut sh, 4, SHT_DYNSYM);
            put64(&mut sh, 16, META_VADDR + off - dyn_span.0);
            put64(&mut sh, 24, off);
            put64(&mut sh, 32, len);
            put64(&mut sh, 56, 24);
            out.extend_from_slice(&sh);
        }

        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = self.class;
        out[5] = self.data;
        out[6] = 1;
        put16(&mut out, 16, self.kind);
        put16(&mut out, 18, self.machine);
        put32(&mut out, 20, 1);
        put64(&mut out, 24, self.entry);
        put64(&mut out, 32, 64);
        put64(&mut out, 40, shoff);
        put16(&mut out, 52, 64);
        put16(&mut out, 54, 56);
        put16(&mut out, 56, phnum as u16);
        put16(&mut out, 58, 64);
        put16(&mut out, 60, shnum);

        for (i, s) in self.segments.iter().enumerate() {
            let ph = 64 + i * 56;
            put32(&mut out, ph, PT_LOAD);
            put32(&mut out, ph + 4, s.flags);
            put64(&mut out, ph + 8, seg_offsets[i]);
            put64(&mut out, ph + 16, s.vaddr);
            put64(&mut out, ph + 24, s.vaddr);
            put64(&mut out, ph + 32, s.data.len() as u64);
            put64(&mut out, ph + 40, s.mem_size);
            put64(&mut out, ph + 48, 0x1000);
        }
        if has_dynamic {
            let ph = 64 + self.segments.len() * 56;
            put32(&mut out, ph, PT_DYNAMIC);
            put32(&mut out, ph + 4, 6);
            put64(&mut out, ph + 8, dyn_span.0);
            put64(&mut out, ph + 16, META_VADDR);
            put64(&mut out, ph + 24, META_VADDR);
            put64(&mut out, ph + 32, dyn_span.1);
            put64(&mut out, ph + 40, dyn_span.1);
            put64(&mut out, ph + 48, 8);
        }
        out
    }

    /// Dynamic array first, then the tables. Returns the bytes plus the
    /// symtab's offset and length inside them.
    fn dynamic_area(&self) -> (Vec<u8>, u64, u64) {
        let nsyms = if self.symbols.is_empty() { 0 } else { self.symbols.len() + 1 };

        let mut strtab = vec![0u8];
        let mut name_offs = Vec::new();
        for s in &self.symbols {
            name_offs.push(strtab.len() as u32);
            strtab.extend_from_slice(s.name.as_bytes());
            strtab.push(0);
        }

        let mut symtab = vec![0u8; 24];
        for (s, name) in self.symbols.iter().zip(&name_offs) {
            let mut e = [0u8; 24];
            put32(&mut e, 0, *name);
            e[4] = (if s.weak { 2 } else { 1 }) << 4 | 2;
            put16(&mut e, 6, s.shndx);
            put64(&mut e, 8, s.value);
            symtab.extend_from_slice(&e);
        }
        if nsyms == 0 {
            symtab.clear();
        }

        let hash = match self.hash {
            HashStyle::Sysv if nsyms > 0 => {
                let mut h = Vec::new();
                h.extend_from_slice(&1u32.to_le_bytes());
                h.extend_from_slice(&self.nchain.unwrap_or(nsyms as u32).to_le_bytes());
                h.extend_from_slice(&vec![0u8; 4 + 4 * nsyms]);
                Some((4u64, h))
            }
            HashStyle::Gnu if nsyms > 0 => {
                let mut h = Vec::new();
                for w in [1u32, 1, 1, 0] {
                    h.extend_from_slice(&w.to_le_bytes());
                }
                h.extend_from_slice(&0u64.to_le_bytes());
                h.extend_from_slice(&1u32.to_le_bytes());
                for i in 1..nsyms {
                    let last = (i == nsyms - 1) as u32;
                    h.extend_from_slice(&last.to_le_bytes());
                }
                Some((0x6fff_fef5u64, h))
            }
            _ => None,
        };

        let encode = |list: &[RelaSpec]| {
            let mut v = Vec::new();
            for r in list {
                v.extend_from_slice(&r.offset.to_le_bytes());
                v.extend_from_slice(&((r.sym as u64) << 32 | r.kind as u64).to_le_bytes());
                v.extend_from_slice(&r.addend.to_le_bytes());
            }
            v
        };
        let rela = encode(&self.rela);
        let plt = encode(&self.plt);

        let mut tags: Vec<(u64, u64)> = Vec::new();
        let dyn_len = |n: usize| (n as u64 + 1) * 16;
        let ntags = (!rela.is_empty()) as usize * 3
            + (!plt.is_empty()) as usize * 3
            + (nsyms > 0) as usize * 4
            + hash.is_some() as usize;
        let table_base = META_VADDR + dyn_len(ntags);
        let mut tables = Vec::new();
        let place = |bytes: &[u8], tables: &mut Vec<u8>| {
            let at = table_base + tables.len() as u64;
            tables.extend_from_slice(bytes);
            pad_to(tables, 8);
            at
        };

        if !rela.is_empty() {
            let at = place(&rela, &mut tables);
            tags.extend([(7, at), (8, rela.len() as u64), (9, self.relaent)]);
        }
        if !plt.is_empty() {
            let at = place(&plt, &mut tables);
            tags.extend([(23, at), (2, plt.len() as u64), (20, 7)]);
        }
        let mut symtab_at = 0;
        if nsyms > 0 {
            symtab_at = place(&symtab, &mut tables);
            let str_at = place(&strtab, &mut tables);
            tags.extend([(6, symtab_at), (11, 24), (5, str_at), (10, strtab.len() as u64)]);
        }
        if let Some((tag, h)) = &hash {
            let at = place(h, &mut tables);
            tags.push((*tag, at));
        }

        let mut area = Vec::new();
        for (t, v) in tags.iter().chain([(0u64, 0u64)].iter()) {
            area.extend_from_slice(&t.to_le_bytes());
            area.extend_from_slice(&v.to_le_bytes());
        }
        area.extend_from_slice(&tables);
        let symtab_off = if nsyms > 0 { symtab_at - META_VADDR } else { 0 };
        (area, symtab_off, symtab.len() as u64)
    }
}

fn pad_to(out: &mut Vec<u8>, align: usize) {
    while out.len() % align != 0 {
        out.push(0);
    }
}

fn put16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(b: &mut [u8], off: usize, v: u64) {
    b[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
