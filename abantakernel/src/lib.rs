// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Abanta core: everything that has to keep working once UEFI boot services
//! are gone.
//!
//! Order of use, strictly:
//! 1. [`boot::reserve`] while firmware is live,
//! 2. [`boot::capture_and_exit`],
//! 3. [`mem::paging::PageTableBuilder`] over the reserved table pages,
//! 4. [`mem::frame::PhysPageAllocator::init`] over the reserved pool,
//! 5. [`module::host::Host`] to load, relocate, register and run modules.
#![cfg_attr(not(test), no_std)]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod boot;
pub mod bootinfo;
pub mod elf;
pub mod error;
pub mod firmware;
pub mod mem;
pub mod module;

#[cfg(test)]
mod testutil;

pub use error::{AllocationError, BootServiceError, LoadError, PagingError, RegistryError, RelocationError};
