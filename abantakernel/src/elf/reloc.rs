// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// src/elf/reloc.rs
//! x86_64 RELA processing.
//!
//! Two passes over DT_RELA then DT_JMPREL: the first computes and checks every
//! entry, the second writes. A bad entry anywhere means nothing was written.

use super::dynamic::{DynamicInfo, Rela};
use super::loader::Placement;
use crate::error::RelocationError;
use crate::mem::PageSource;

pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_GLOB_DAT: u32 = 6;
pub const R_X86_64_JUMP_SLOT: u32 = 7;
pub const R_X86_64_RELATIVE: u32 = 8;

/// Answers "where does symbol `name` live" for undefined references.
pub trait SymbolResolver {
    fn resolve(&self, name: &[u8]) -> Option<u64>;
}

impl<F> SymbolResolver for F
where
    F: Fn(&[u8]) -> Option<u64>,
{
    fn resolve(&self, name: &[u8]) -> Option<u64> {
        self(name)
    }
}

/// Apply every relocation of `dynamic` to the image at `placement`.
/// Returns the number of entries written.
pub fn apply<M, R>(
    placement: &Placement,
    mem: &mut M,
    dynamic: &DynamicInfo<'_>,
    resolver: &R,
) -> Result<usize, RelocationError>
where
    M: PageSource + ?Sized,
    R: SymbolResolver + ?Sized,
{
    let tables = [dynamic.rela, dynamic.jmprel];

    let mut pending = 0usize;
    for table in tables.iter().flatten() {
        for rela in table.entries(&dynamic.view)? {
            if evaluate(&rela, placement, &*mem, dynamic, resolver)?.is_some() {
                pending += 1;
            }
        }
    }

    let mut applied = 0usize;
    for table in tables.iter().flatten() {
        for rela in table.entries(&dynamic.view)? {
            let Some((target, value)) = evaluate(&rela, placement, &*mem, dynamic, resolver)? else {
                continue;
            };
            write_u64(placement, mem, target, value)?;
            applied += 1;
        }
    }
    debug_assert_eq!(pending, applied);
    log::debug!("[reloc] {} entries applied, bias {:#x}", applied, placement.bias());
    Ok(applied)
}

/// `(target, value)` for one entry, or `None` for R_X86_64_NONE.
fn evaluate<M, R>(
    rela: &Rela,
    placement: &Placement,
    mem: &M,
    dynamic: &DynamicInfo<'_>,
    resolver: &R,
) -> Result<Option<(u64, u64)>, RelocationError>
where
    M: PageSource + ?Sized,
    R: SymbolResolver + ?Sized,
{
    let bias = placement.bias();
    let addend = rela.addend as u64;
    let value = match rela.kind() {
        R_X86_64_NONE => return Ok(None),
        R_X86_64_RELATIVE => bias.wrapping_add(addend),
        R_X86_64_64 => symbol_value(rela.symbol(), bias, dynamic, resolver)?.wrapping_add(addend),
        R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => symbol_value(rela.symbol(), bias, dynamic, resolver)?,
        other => {
            log::warn!("[reloc] type {} at {:#x} unsupported", other, rela.offset);
            return Err(RelocationError::UnsupportedType(other));
        }
    };

    let target = bias.wrapping_add(rela.offset);
    let region = placement
        .region_for(target, 8)
        .ok_or(RelocationError::TargetOutOfBounds { addr: target })?;
    if mem.bytes(region).is_none() {
        return Err(RelocationError::TargetOutOfBounds { addr: target });
    }
    Ok(Some((target, value)))
}

fn symbol_value<R: SymbolResolver + ?Sized>(
    index: u32,
    bias: u64,
    dynamic: &DynamicInfo<'_>,
    resolver: &R,
) -> Result<u64, RelocationError> {
    if index == 0 {
        return Ok(0);
    }
    let symbols = dynamic.symbols.ok_or(RelocationError::MissingSymbolTable)?;
    let sym = symbols.symbol(&dynamic.view, index)?;
    if sym.is_defined() {
        return Ok(sym.address(bias));
    }

    let name = symbols
        .name(&dynamic.view, &sym)
        .ok_or(RelocationError::TableOutOfBounds {
            addr: symbols.strtab.wrapping_add(sym.name as u64),
        })?;
    match resolver.resolve(name) {
        Some(addr) => Ok(addr),
        None if sym.is_weak() => Ok(0),
        None => {
            log::warn!(
                "[reloc] unresolved symbol #{} '{}'",
                index,
                core::str::from_utf8(name).unwrap_or("?")
            );
            Err(RelocationError::UnresolvedSymbol { index })
        }
    }
}

fn write_u64<M: PageSource + ?Sized>(
    placement: &Placement,
    mem: &mut M,
    target: u64,
    value: u64,
) -> Result<(), RelocationError> {
    let oob = RelocationError::TargetOutOfBounds { addr: target };
    let region = placement.region_for(target, 8).ok_or(oob)?;
    let at = (target - region.base()) as usize;
    let bytes = mem.bytes_mut(region).ok_or(oob)?;
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}
