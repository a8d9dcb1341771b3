// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// src/elf/dynamic.rs
//! PT_DYNAMIC: relocation tables, dynamic symbols and their count.

use xmas_elf::{ElfFile, sections::ShType};

use super::{FileView, RELA_SIZE, SHDR_SIZE, SYM_SIZE, read_u16, read_u32, read_u64};
use crate::error::{LoadError, RelocationError};

const DT_NULL: u64 = 0;
const DT_PLTRELSZ: u64 = 2;
const DT_HASH: u64 = 4;
const DT_STRTAB: u64 = 5;
const DT_SYMTAB: u64 = 6;
const DT_RELA: u64 = 7;
const DT_RELASZ: u64 = 8;
const DT_RELAENT: u64 = 9;
const DT_STRSZ: u64 = 10;
const DT_SYMENT: u64 = 11;
const DT_PLTREL: u64 = 20;
const DT_JMPREL: u64 = 23;
const DT_GNU_HASH: u64 = 0x6fff_fef5;

const DYN_SIZE: usize = 16;

/// Tag values as found, unbiased.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RawDynamic {
    rela: Option<u64>,
    relasz: Option<u64>,
    relaent: Option<u64>,
    jmprel: Option<u64>,
    pltrelsz: Option<u64>,
    pltrel: Option<u64>,
    symtab: Option<u64>,
    syment: Option<u64>,
    strtab: Option<u64>,
    strsz: Option<u64>,
    hash: Option<u64>,
    gnu_hash: Option<u64>,
}

impl RawDynamic {
    /// Walk `(tag, value)` pairs up to DT_NULL or the end of the segment.
    fn parse(bytes: &[u8]) -> Self {
        let mut raw = Self::default();
        for entry in bytes.chunks_exact(DYN_SIZE) {
            let (Some(tag), Some(val)) = (read_u64(entry, 0), read_u64(entry, 8)) else {
                break;
            };
            let slot = match tag {
                DT_NULL => break,
                DT_RELA => &mut raw.rela,
                DT_RELASZ => &mut raw.relasz,
                DT_RELAENT => &mut raw.relaent,
                DT_JMPREL => &mut raw.jmprel,
                DT_PLTRELSZ => &mut raw.pltrelsz,
                DT_PLTREL => &mut raw.pltrel,
                DT_SYMTAB => &mut raw.symtab,
                DT_SYMENT => &mut raw.syment,
                DT_STRTAB => &mut raw.strtab,
                DT_STRSZ => &mut raw.strsz,
                DT_HASH => &mut raw.hash,
                DT_GNU_HASH => &mut raw.gnu_hash,
                _ => continue,
            };
            *slot = Some(val);
        }
        raw
    }
}

/// Elf64_Rela.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rela {
    pub offset: u64,
    pub info: u64,
    pub addend: i64,
}

impl Rela {
    pub fn kind(&self) -> u32 {
        self.info as u32
    }

    pub fn symbol(&self) -> u32 {
        (self.info >> 32) as u32
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        Some(Self {
            offset: read_u64(raw, 0)?,
            info: read_u64(raw, 8)?,
            addend: read_u64(raw, 16)? as i64,
        })
    }
}

/// A RELA array: `size` bytes at unbiased `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaTable {
    pub addr: u64,
    pub size: u64,
}

impl RelaTable {
    pub fn len(&self) -> usize {
        (self.size / RELA_SIZE) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries<'v>(
        &self,
        view: &FileView<'v>,
    ) -> Result<impl Iterator<Item = Rela> + 'v, RelocationError> {
        let bytes = view
            .slice(self.addr, self.size as usize)
            .ok_or(RelocationError::TableOutOfBounds { addr: self.addr })?;
        Ok(bytes.chunks_exact(RELA_SIZE as usize).filter_map(Rela::decode))
    }
}

const SHN_UNDEF: u16 = 0;
const SHN_ABS: u16 = 0xfff1;
const SHN_LORESERVE: u64 = 0xff00;
const STB_WEAK: u8 = 2;

/// Elf64_Sym.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub name: u32,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

impl Symbol {
    fn decode(raw: &[u8]) -> Option<Self> {
        Some(Self {
            name: read_u32(raw, 0)?,
            info: *raw.get(4)?,
            other: *raw.get(5)?,
            shndx: read_u16(raw, 6)?,
            value: read_u64(raw, 8)?,
            size: read_u64(raw, 16)?,
        })
    }

    pub fn is_defined(&self) -> bool {
        self.shndx != SHN_UNDEF
    }

    pub fn is_weak(&self) -> bool {
        self.info >> 4 == STB_WEAK
    }

    /// Run-time address of a defined symbol in an image loaded at `bias`.
    pub fn address(&self, bias: u64) -> u64 {
        if self.shndx == SHN_ABS {
            self.value
        } else {
            bias.wrapping_add(self.value)
        }
    }
}

/// DT_SYMTAB with a known length and its string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynSymbols {
    pub symtab: u64,
    pub strtab: u64,
    pub strsz: u64,
    pub count: usize,
}

impl DynSymbols {
    pub fn symbol(&self, view: &FileView<'_>, index: u32) -> Result<Symbol, RelocationError> {
        if index as usize >= self.count {
            return Err(RelocationError::SymbolOutOfRange {
                index,
                count: self.count,
            });
        }
        let addr = self.symtab.wrapping_add(index as u64 * SYM_SIZE);
        view.slice(addr, SYM_SIZE as usize)
            .and_then(Symbol::decode)
            .ok_or(RelocationError::TableOutOfBounds { addr })
    }

    /// NUL-terminated name, bounded by DT_STRSZ.
    pub fn name<'v>(&self, view: &FileView<'v>, sym: &Symbol) -> Option<&'v [u8]> {
        let off = sym.name as u64;
        if off >= self.strsz {
            return None;
        }
        let room = view.tail(self.strtab.wrapping_add(off))?;
        let room = &room[..room.len().min((self.strsz - off) as usize)];
        let nul = room.iter().position(|&b| b == 0)?;
        Some(&room[..nul])
    }

    /// First defined symbol called `name`. Index 0 is the null symbol.
    pub fn find(&self, view: &FileView<'_>, name: &[u8]) -> Option<Symbol> {
        (1..self.count as u32)
            .filter_map(|i| self.symbol(view, i).ok())
            .filter(|s| s.is_defined())
            .find(|s| self.name(view, s) == Some(name))
    }
}

/// Everything the relocator and the registry need from PT_DYNAMIC.
#[derive(Debug, Clone)]
pub struct DynamicInfo<'a> {
    pub view: FileView<'a>,
    pub rela: Option<RelaTable>,
    pub jmprel: Option<RelaTable>,
    pub symbols: Option<DynSymbols>,
}

impl<'a> DynamicInfo<'a> {
    /// No PT_DYNAMIC: nothing to relocate, nothing to export.
    pub fn empty(view: FileView<'a>) -> Self {
        Self {
            view,
            rela: None,
            jmprel: None,
            symbols: None,
        }
    }

    /// Decode the PT_DYNAMIC bytes `dynamic` of `elf`.
    pub fn parse(view: FileView<'a>, dynamic: &[u8], elf: &ElfFile<'_>) -> Result<Self, LoadError> {
        let raw = RawDynamic::parse(dynamic);

        if let Some(ent) = raw.relaent
            && ent != RELA_SIZE
        {
            return Err(RelocationError::BadEntrySize(ent).into());
        }
        if let Some(ent) = raw.syment
            && ent != SYM_SIZE
        {
            return Err(RelocationError::BadEntrySize(ent).into());
        }
        if raw.pltrel.is_some_and(|t| t != DT_RELA) {
            return Err(LoadError::Malformed("DT_PLTREL is not DT_RELA"));
        }

        let rela = match (raw.rela, raw.relasz) {
            (Some(addr), Some(size)) => Some(table(addr, size)?),
            (Some(_), None) => return Err(LoadError::Malformed("DT_RELA without DT_RELASZ")),
            _ => None,
        };
        let jmprel = match (raw.jmprel, raw.pltrelsz) {
            (Some(addr), Some(size)) => Some(table(addr, size)?),
            (Some(_), None) => return Err(LoadError::Malformed("DT_JMPREL without DT_PLTRELSZ")),
            _ => None,
        };

        let symbols = match raw.symtab {
            None => None,
            Some(symtab) => {
                let (Some(strtab), Some(strsz)) = (raw.strtab, raw.strsz) else {
                    return Err(LoadError::Malformed("DT_SYMTAB without DT_STRTAB/DT_STRSZ"));
                };
                let count = symbol_count(&view, &raw, elf).ok_or(LoadError::SymbolCountUnknown)?;
                // Lookups walk all `count` entries, so every one must be in the file.
                (count as u64)
                    .checked_mul(SYM_SIZE)
                    .and_then(|len| view.slice(symtab, usize::try_from(len).ok()?))
                    .ok_or(LoadError::DynamicOutOfBounds)?;
                log::debug!("[elf] {} dynamic symbols at {:#x}", count, symtab);
                Some(DynSymbols {
                    symtab,
                    strtab,
                    strsz,
                    count,
                })
            }
        };

        Ok(Self {
            view,
            rela,
            jmprel,
            symbols,
        })
    }

    pub fn has_relocations(&self) -> bool {
        self.rela.is_some_and(|t| !t.is_empty()) || self.jmprel.is_some_and(|t| !t.is_empty())
    }
}

fn table(addr: u64, size: u64) -> Result<RelaTable, LoadError> {
    if size % RELA_SIZE != 0 {
        return Err(RelocationError::BadEntrySize(size).into());
    }
    Ok(RelaTable { addr, size })
}

/// DT_HASH nchain, else a DT_GNU_HASH chain walk, else the SHT_DYNSYM header.
fn symbol_count(view: &FileView<'_>, raw: &RawDynamic, elf: &ElfFile<'_>) -> Option<usize> {
    if let Some(n) = raw.hash.and_then(|h| view.u32_at(h.checked_add(4)?)) {
        return Some(n as usize);
    }
    if let Some(n) = raw.gnu_hash.and_then(|h| gnu_hash_count(view, h)) {
        return Some(n);
    }
    dynsym_section_count(elf, view.bytes().len())
}

/// One past the highest symbol index any bucket chain reaches.
fn gnu_hash_count(view: &FileView<'_>, addr: u64) -> Option<usize> {
    let nbuckets = view.u32_at(addr)? as u64;
    let symoffset = view.u32_at(addr.checked_add(4)?)?;
    let bloom_size = view.u32_at(addr.checked_add(8)?)? as u64;
    let buckets = addr.checked_add(16)?.checked_add(bloom_size * 8)?;

    let mut last = 0u32;
    for i in 0..nbuckets {
        last = last.max(view.u32_at(buckets.checked_add(i * 4)?)?);
    }
    if last < symoffset {
        return Some(symoffset as usize);
    }

    let chain = buckets.checked_add(nbuckets * 4)?;
    let mut index = last;
    loop {
        let word = view.u32_at(chain.checked_add((index - symoffset) as u64 * 4)?)?;
        index = index.checked_add(1)?;
        if word & 1 != 0 {
            return Some(index as usize);
        }
    }
}

fn dynsym_section_count(elf: &ElfFile<'_>, file_len: usize) -> Option<usize> {
    let shoff = elf.header.pt2.sh_offset();
    let shnum = elf.header.pt2.sh_count() as u64;
    // xmas-elf asserts on indices in the reserved range.
    if shnum == 0
        || shnum >= SHN_LORESERVE
        || elf.header.pt2.sh_entry_size() as usize != SHDR_SIZE
        || shoff % 8 != 0
    {
        return None;
    }
    let end = shoff.checked_add(shnum * SHDR_SIZE as u64)?;
    if end > file_len as u64 {
        return None;
    }
    let sh = elf
        .section_iter()
        .find(|s| matches!(s.get_type(), Ok(ShType::DynSym)))?;
    (sh.entry_size() as u64 == SYM_SIZE).then(|| (sh.size() / SYM_SIZE) as usize)
}
