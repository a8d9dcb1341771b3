// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Error taxonomy of the core.
//!
//! Every failure returns a distinguishable value to its immediate caller.
//! Nothing in here retries on its own except the bounded ExitBootServices
//! loop in [`crate::boot`].

use core::fmt;

use crate::firmware::FirmwareStatus;

/// Firmware query, allocation or transition failures. Fatal to the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootServiceError {
    /// GetMemoryMap failed with something other than "buffer too small".
    Query(FirmwareStatus),
    /// The sizing query succeeded with an empty buffer, which no firmware does.
    UnexpectedMapSize,
    /// Pool or page allocation while firmware was live.
    Allocate(FirmwareStatus),
    /// ExitBootServices kept failing.
    Transition { status: FirmwareStatus, attempts: u32 },
    /// The exit policy allows zero attempts.
    InvalidPolicy,
    /// Page-table and allocator reservations would overlap.
    Overlap,
}

impl fmt::Display for BootServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query(s) => write!(f, "GetMemoryMap failed: {s}"),
            Self::UnexpectedMapSize => f.write_str("GetMemoryMap sizing call did not report BUFFER_TOO_SMALL"),
            Self::Allocate(s) => write!(f, "firmware allocation failed: {s}"),
            Self::Transition { status, attempts } => {
                write!(f, "ExitBootServices failed after {attempts} attempt(s): {status}")
            }
            Self::InvalidPolicy => f.write_str("exit policy allows no attempts"),
            Self::Overlap => f.write_str("page-table and allocator reservations overlap"),
        }
    }
}

/// Identity map construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// Requested extent exceeds one PDPT fan-out.
    RangeTooLarge { requested: u64, limit: u64 },
    /// Not enough reserved pages for the directories the extent needs.
    ReservationTooSmall { needed: usize, reserved: usize },
    /// Reserved table memory is not 4 KiB aligned.
    Misaligned(u64),
    /// Nothing to map.
    EmptyRange,
}

impl fmt::Display for PagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RangeTooLarge { requested, limit } => {
                write!(f, "identity range {requested:#x} exceeds limit {limit:#x}")
            }
            Self::ReservationTooSmall { needed, reserved } => {
                write!(f, "need {needed} table pages, {reserved} reserved")
            }
            Self::Misaligned(a) => write!(f, "table memory {a:#x} not page aligned"),
            Self::EmptyRange => f.write_str("empty identity range"),
        }
    }
}

/// Physical page allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// Free list is empty.
    OutOfFrames,
    /// Zero-byte request.
    ZeroSize,
    /// Request larger than one frame; contiguous multi-frame allocation is not implemented.
    NotSupported { requested: usize },
    /// A fixed-address request hit a frame that is not free.
    Conflict { addr: u64 },
    /// A fixed-address request lies outside the managed region.
    OutOfRange { addr: u64 },
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => f.write_str("out of physical frames"),
            Self::ZeroSize => f.write_str("zero-sized allocation"),
            Self::NotSupported { requested } => {
                write!(f, "{requested} bytes needs contiguous frames (not supported)")
            }
            Self::Conflict { addr } => write!(f, "frame {addr:#x} already in use"),
            Self::OutOfRange { addr } => write!(f, "address {addr:#x} outside managed memory"),
        }
    }
}

/// Relocation processing. Any of these aborts the whole load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationError {
    UnsupportedType(u32),
    /// External symbol with no definition in the host table or any module.
    UnresolvedSymbol { index: u32 },
    SymbolOutOfRange { index: u32, count: usize },
    /// Entry references a symbol but the image has no DT_SYMTAB.
    MissingSymbolTable,
    TargetOutOfBounds { addr: u64 },
    /// Relocation, symbol or string table not inside the loaded image.
    TableOutOfBounds { addr: u64 },
    BadEntrySize(u64),
}

impl fmt::Display for RelocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedType(t) => write!(f, "unsupported relocation type {t}"),
            Self::UnresolvedSymbol { index } => write!(f, "unresolved symbol #{index}"),
            Self::SymbolOutOfRange { index, count } => {
                write!(f, "symbol #{index} out of range ({count} symbols)")
            }
            Self::MissingSymbolTable => f.write_str("symbol reference without DT_SYMTAB"),
            Self::TargetOutOfBounds { addr } => write!(f, "relocation target {addr:#x} outside image"),
            Self::TableOutOfBounds { addr } => write!(f, "table at {addr:#x} outside image"),
            Self::BadEntrySize(s) => write!(f, "unexpected table entry size {s}"),
        }
    }
}

/// Module table and host capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    TableFull,
    UnknownModule,
    /// The host API table has not been published yet.
    NotPublished,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableFull => f.write_str("table full"),
            Self::UnknownModule => f.write_str("no module by that name"),
            Self::NotPublished => f.write_str("host API not published"),
        }
    }
}

/// Malformed image or failed placement. Aborts only this load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    BadMagic,
    WrongClass(u8),
    WrongEndian(u8),
    UnsupportedMachine(u16),
    /// Neither ET_EXEC nor ET_DYN.
    UnsupportedImageType(u16),
    Malformed(&'static str),
    ProgramHeadersOutOfBounds,
    NoLoadableSegments,
    SegmentOutOfBounds { index: usize },
    /// p_filesz > p_memsz, or an address range wraps.
    BadSegment { index: usize },
    TooManySegments,
    DynamicOutOfBounds,
    /// DT_SYMTAB present but no DT_HASH, DT_GNU_HASH or SHT_DYNSYM gives its length.
    SymbolCountUnknown,
    /// Relocatable placement asked for an ET_EXEC image, whose addresses are absolute.
    PolicyMismatch,
    Allocation(AllocationError),
    Relocation(RelocationError),
    Registry(RegistryError),
}

impl From<AllocationError> for LoadError {
    fn from(e: AllocationError) -> Self {
        Self::Allocation(e)
    }
}

impl From<RelocationError> for LoadError {
    fn from(e: RelocationError) -> Self {
        Self::Relocation(e)
    }
}

impl From<RegistryError> for LoadError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => f.write_str("not an ELF image"),
            Self::WrongClass(c) => write!(f, "ELF class {c} is not ELF64"),
            Self::WrongEndian(d) => write!(f, "ELF data encoding {d} is not little-endian"),
            Self::UnsupportedMachine(m) => write!(f, "machine {m:#x} is not x86_64"),
            Self::UnsupportedImageType(t) => write!(f, "ELF type {t} is neither EXEC nor DYN"),
            Self::Malformed(why) => write!(f, "malformed ELF: {why}"),
            Self::ProgramHeadersOutOfBounds => f.write_str("program header table outside image"),
            Self::NoLoadableSegments => f.write_str("no PT_LOAD segments"),
            Self::SegmentOutOfBounds { index } => write!(f, "segment {index} outside image"),
            Self::BadSegment { index } => write!(f, "segment {index} has inconsistent sizes"),
            Self::TooManySegments => f.write_str("too many PT_LOAD segments"),
            Self::DynamicOutOfBounds => f.write_str("PT_DYNAMIC outside image"),
            Self::SymbolCountUnknown => f.write_str("cannot derive dynamic symbol count"),
            Self::PolicyMismatch => f.write_str("load policy does not fit image type"),
            Self::Allocation(e) => write!(f, "allocation: {e}"),
            Self::Relocation(e) => write!(f, "relocation: {e}"),
            Self::Registry(e) => write!(f, "registry: {e}"),
        }
    }
}
