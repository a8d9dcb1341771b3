// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
#![no_std]
#![no_main]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod config;
mod firmware;
mod serial;

use alloc::vec::Vec;
use core::fmt;

use abanta_kernel::boot::{ExitPolicy, Reservation, ReservationPlan, capture_and_exit, reserve};
use abanta_kernel::mem::frame::PhysPageAllocator;
use abanta_kernel::mem::paging::PageTableBuilder;
use abanta_kernel::module::Host;
use log::{error, info, warn};
use spin::Once;
use uefi::fs::{FileSystem, Path};
use uefi::prelude::*;
use uefi::boot;

use config::ModuleSpec;
use firmware::UefiFirmware;
use serial::SerialConsole;

#[global_allocator]
static ALLOCATOR: uefi::allocator::Allocator = uefi::allocator::Allocator;

static HOST: Once<Host<SerialConsole, PhysPageAllocator>> = Once::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    error!("[panic] {}", info);
    halt()
}

/* =================================== Entry =================================== */
#[entry]
fn main() -> Status {
    serial::init(config::LOG_LEVEL);
    if uefi::helpers::init().is_err() {
        die(&format_args!("helpers::init failed"));
    }
    log_step("abantaboot start");

    // ---- read modules while the file system is still there ----
    let staged = stage_modules();
    log_step("modules staged");

    // ---- reserve, then leave boot services ----
    let plan = ReservationPlan::for_identity(config::IDENTITY_CEILING, config::POOL_PAGES);
    let reservation: Reservation = {
        let mut fw = unsafe { UefiFirmware::new() };
        match reserve(&mut fw, plan) {
            Ok(r) => r,
            Err(e) => die(&format_args!("reserve: {e}")),
        }
    };
    let snapshot = match capture_and_exit(
        unsafe { UefiFirmware::new() },
        boot::image_handle(),
        ExitPolicy::new(config::EXIT_ATTEMPTS),
    ) {
        Ok(s) => s,
        Err(e) => die(&format_args!("boot transition: {e}")),
    };
    x86_64::instructions::interrupts::disable();
    log_step("boot services exited");
    snapshot.log_summary();

    // ---- identity map ----
    let highest = snapshot.highest_ram_address();
    let identity = highest.clamp(config::IDENTITY_FLOOR, config::IDENTITY_CEILING);
    if highest > config::IDENTITY_CEILING {
        warn!("[step] RAM up to {:#x}, mapping only {:#x}", highest, identity);
    }
    let root = match PageTableBuilder::new(reservation.page_tables)
        .and_then(|b| unsafe { b.build_identity(identity) })
    {
        Ok(r) => r,
        Err(e) => die(&format_args!("paging: {e}")),
    };
    unsafe { root.install() };
    log_step("paging ready");

    // ---- allocator and host ----
    let frames = unsafe { PhysPageAllocator::init(reservation.pool.base(), reservation.pool.len() as u64) };
    let host = HOST.call_once(|| Host::new(SerialConsole, frames, snapshot));
    if let Err(e) = host.publish() {
        die(&format_args!("host API: {e}"));
    }
    log_step("host ready");

    // ---- modules ----
    for &(module, image) in staged {
        match host.load_module(module.name, image, module.policy) {
            Ok(entry) => info!("[step] {} at {:#x}", module.name, entry),
            Err(e) => {
                error!("[step] {} not loaded: {}", module.name, e);
                continue;
            }
        }
        if let Err(e) = unsafe { host.run_module(module.name, module.entry) } {
            error!("[step] {} not run: {}", module.name, e);
        }
    }
    log_step("all modules done");
    halt()
}

/// Read every configured module into LOADER_DATA pool memory that outlives
/// boot services. Missing files are skipped.
fn stage_modules() -> &'static [(&'static ModuleSpec, &'static [u8])] {
    let image = boot::image_handle();
    let mut fs: FileSystem = match boot::get_image_file_system(image) {
        Ok(p) => p.into(),
        Err(e) => die(&format_args!("get_image_file_system failed: {:?}", e)),
    };

    let mut staged = Vec::with_capacity(config::MODULES.len());
    for module in config::MODULES {
        match fs.read(Path::new(module.path)) {
            Ok(bytes) => {
                info!("[step] read {} ({} bytes)", module.name, bytes.len());
                staged.push((module, leak_aligned(&bytes)));
            }
            Err(e) => warn!("[step] {} unreadable: {:?}", module.name, e),
        }
    }
    staged.leak()
}

/// Copy into 8-byte aligned memory that is never freed.
fn leak_aligned(bytes: &[u8]) -> &'static [u8] {
    let words: &'static mut [u64] = alloc::vec![0u64; bytes.len().div_ceil(8)].leak();
    let out = unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), bytes.len()) };
    out.copy_from_slice(bytes);
    out
}

/* ================== Logging & helpers ================== */
#[inline(always)]
fn log_step(msg: &str) {
    info!("[step] {msg}");
}

#[cold]
fn die(msg: &fmt::Arguments) -> ! {
    error!("[fatal] {}", msg);
    halt()
}

fn halt() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}
