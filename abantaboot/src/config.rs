// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// abantaboot/src/config.rs
//! Build-time configuration.

use abanta_kernel::elf::LoadPolicy;
use abanta_kernel::module::EntryConvention;
use log::LevelFilter;
use uefi::{CStr16, cstr16};

pub struct ModuleSpec {
    /// Path on the boot volume.
    pub path: &'static CStr16,
    /// Registry name; also what other modules' diagnostics print.
    pub name: &'static str,
    pub policy: LoadPolicy,
    pub entry: EntryConvention,
}

/// Loaded, registered and run in this order.
///
/// Modules load after ExitBootServices, from single frames. A relocatable
/// module whose PT_LOAD span exceeds 4 KiB is refused with `NotSupported`.
/// Fixed placement only succeeds where the declared addresses fall inside
/// the frame pool, which firmware places.
pub const MODULES: &[ModuleSpec] = &[
    ModuleSpec {
        path: cstr16!(r"\ABANTA\HELLO.SO"),
        name: "hello",
        policy: LoadPolicy::Auto,
        entry: EntryConvention::WithHostApi,
    },
];

/// Frames handed to the post-exit allocator.
pub const POOL_PAGES: usize = 1024;

/// The identity map always covers at least this much, and never more than
/// the ceiling, whatever the memory map reports.
pub const IDENTITY_FLOOR: u64 = 4 << 30;
pub const IDENTITY_CEILING: u64 = 64 << 30;

pub const EXIT_ATTEMPTS: u32 = 3;

pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;
