// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// src/module/registry.rs
//! Fixed-capacity module table and dlsym.
//!
//! Lookup order: host symbols, then modules in registration order. The first
//! match wins, so a module can never shadow a host capability or an export of
//! a module registered before it.

use heapless::Vec as HVec;

use super::LoadedModule;
use crate::elf::SymbolResolver;
use crate::error::RegistryError;

pub const MAX_MODULES: usize = 8;
pub const MAX_HOST_SYMBOLS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HostSymbol {
    name: &'static str,
    addr: u64,
}

/// Capabilities the host exports by name.
#[derive(Debug, Default)]
pub struct HostSymbols {
    table: HVec<HostSymbol, MAX_HOST_SYMBOLS>,
}

impl HostSymbols {
    pub const fn new() -> Self {
        Self { table: HVec::new() }
    }

    /// Add `name`, or repoint it if it is already there.
    pub fn register(&mut self, name: &'static str, addr: u64) -> Result<(), RegistryError> {
        if let Some(s) = self.table.iter_mut().find(|s| s.name == name) {
            s.addr = addr;
            return Ok(());
        }
        self.table
            .push(HostSymbol { name, addr })
            .map_err(|_| RegistryError::TableFull)
    }

    pub fn lookup(&self, name: &[u8]) -> Option<u64> {
        self.table
            .iter()
            .find(|s| s.name.as_bytes() == name)
            .map(|s| s.addr)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    host: HostSymbols,
    modules: HVec<LoadedModule, MAX_MODULES>,
}

impl ModuleRegistry {
    pub const fn new() -> Self {
        Self {
            host: HostSymbols::new(),
            modules: HVec::new(),
        }
    }

    pub fn register_host(&mut self, name: &'static str, addr: u64) -> Result<(), RegistryError> {
        self.host.register(name, addr)
    }

    pub fn host_symbols(&self) -> &HostSymbols {
        &self.host
    }

    pub fn is_full(&self) -> bool {
        self.modules.is_full()
    }

    pub fn register(&mut self, module: LoadedModule) -> Result<&LoadedModule, RegistryError> {
        let name = module.name;
        let exports = module.symbol_count();
        self.modules.push(module).map_err(|m| {
            log::error!("[modules] table full, {} not registered", m.name);
            RegistryError::TableFull
        })?;
        log::info!("[modules] #{} {} ({} dynamic symbols)", self.modules.len() - 1, name, exports);
        Ok(&self.modules[self.modules.len() - 1])
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    pub fn get(&self, name: &str) -> Option<&LoadedModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn dlsym(&self, name: &[u8]) -> Option<u64> {
        self.host
            .lookup(name)
            .or_else(|| self.modules.iter().find_map(|m| m.lookup(name)))
    }
}

impl SymbolResolver for ModuleRegistry {
    fn resolve(&self, name: &[u8]) -> Option<u64> {
        self.dlsym(name)
    }
}
