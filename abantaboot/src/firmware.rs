// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// abantaboot/src/firmware.rs
//! `BootServices` over the live UEFI system table.
//!
//! Pool and page allocation go through the `uefi` crate. GetMemoryMap and
//! ExitBootServices are called through the raw table because the core drives
//! the buffer and the map key itself.

use core::ptr::{self, NonNull};

use abanta_kernel::firmware::{BootServices, FirmwareStatus, MapInfo, MapKey, MapQueryError};
use uefi::boot::{self, AllocateType, MemoryType};
use uefi::{Handle, Status};

pub struct UefiFirmware {
    _private: (),
}

impl UefiFirmware {
    /// # Safety
    /// Boot services must be active, and only one value may exist, since the
    /// transition consumes it.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

fn status(s: Status) -> FirmwareStatus {
    FirmwareStatus(s.0)
}

impl BootServices for UefiFirmware {
    type Handle = Handle;

    fn memory_map(&mut self, buf: &mut [u8]) -> Result<MapInfo, MapQueryError> {
        let st = uefi::table::system_table_raw()
            .ok_or(MapQueryError::Failed(FirmwareStatus::NOT_FOUND))?;
        let mut size = buf.len();
        let mut key = 0usize;
        let mut desc_size = 0usize;
        let mut desc_version = 0u32;
        let map = if buf.is_empty() {
            ptr::null_mut()
        } else {
            buf.as_mut_ptr().cast()
        };
        let s = unsafe {
            let bs = st.as_ref().boot_services;
            ((*bs).get_memory_map)(&mut size, map, &mut key, &mut desc_size, &mut desc_version)
        };
        match s {
            Status::SUCCESS => Ok(MapInfo {
                map_size: size,
                key: MapKey(key),
                descriptor_size: desc_size,
                descriptor_version: desc_version,
            }),
            Status::BUFFER_TOO_SMALL => Err(MapQueryError::TooSmall {
                required: size,
                descriptor_size: desc_size,
            }),
            other => Err(MapQueryError::Failed(status(other))),
        }
    }

    fn allocate_pool(&mut self, size: usize) -> Result<&'static mut [u8], FirmwareStatus> {
        let p = boot::allocate_pool(MemoryType::LOADER_DATA, size).map_err(|e| status(e.status()))?;
        Ok(unsafe { core::slice::from_raw_parts_mut(p.as_ptr(), size) })
    }

    fn free_pool(&mut self, buf: &'static mut [u8]) {
        let p = NonNull::from(buf).cast::<u8>();
        if let Err(e) = unsafe { boot::free_pool(p) } {
            log::warn!("[firmware] FreePool failed: {:?}", e.status());
        }
    }

    fn allocate_pages(&mut self, pages: usize) -> Result<u64, FirmwareStatus> {
        boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, pages)
            .map(|p| p.as_ptr() as u64)
            .map_err(|e| status(e.status()))
    }

    unsafe fn exit_boot_services(&mut self, image: Handle, key: MapKey) -> Result<(), FirmwareStatus> {
        let st = uefi::table::system_table_raw().ok_or(FirmwareStatus::NOT_FOUND)?;
        let s = unsafe {
            let bs = st.as_ref().boot_services;
            ((*bs).exit_boot_services)(image.as_ptr(), key.0)
        };
        if s != Status::SUCCESS {
            return Err(status(s));
        }
        // The uefi crate must stop treating boot services as live; its
        // allocator checks this before every call.
        unsafe { uefi::table::set_system_table(ptr::null()) };
        Ok(())
    }
}
