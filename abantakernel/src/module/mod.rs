// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Loaded modules, the registry that tracks them, and the host side of the
//! module ABI.

pub mod host;
pub mod registry;

use heapless::Vec as HVec;

use crate::elf::{DynamicInfo, ImageKind, MAX_SEGMENTS, Placement, Segment};

pub use host::{Console, EntryConvention, Host, HostApi, HostServices};
pub use registry::{HostSymbols, ModuleRegistry};

/// A module that made it through load and relocation. Never unloaded.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub name: &'static str,
    /// Lowest address the module owns.
    pub base: u64,
    pub footprint: u64,
    pub bias: u64,
    pub entry: u64,
    pub kind: ImageKind,
    pub segments: HVec<Segment, MAX_SEGMENTS>,
    pub placement: Placement,
    /// Relocation and symbol tables, read from the retained file image.
    pub dynamic: DynamicInfo<'static>,
}

impl LoadedModule {
    /// The ELF file this module was loaded from; starts with its header.
    pub fn image(&self) -> &'static [u8] {
        self.dynamic.view.bytes()
    }

    pub fn symbol_count(&self) -> usize {
        self.dynamic.symbols.map_or(0, |s| s.count)
    }

    /// Run-time address of the defined dynamic symbol `name`.
    pub fn lookup(&self, name: &[u8]) -> Option<u64> {
        let symbols = self.dynamic.symbols?;
        symbols
            .find(&self.dynamic.view, name)
            .map(|s| s.address(self.bias))
    }
}
