// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! The slice of UEFI boot services the core needs, as a trait.
//!
//! `abantaboot` implements it over the real system table; tests implement it
//! over a scripted mock. Anything that takes `&mut impl BootServices` must run
//! before [`crate::boot::capture_and_exit`] consumes the firmware handle.

use core::fmt;

/// Raw EFI_STATUS value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareStatus(pub usize);

const ERROR_BIT: usize = 1 << (usize::BITS - 1);

impl FirmwareStatus {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_PARAMETER: Self = Self(ERROR_BIT | 2);
    pub const BUFFER_TOO_SMALL: Self = Self(ERROR_BIT | 5);
    pub const OUT_OF_RESOURCES: Self = Self(ERROR_BIT | 9);
    pub const NOT_FOUND: Self = Self(ERROR_BIT | 14);

    pub const fn is_error(self) -> bool {
        self.0 & ERROR_BIT != 0
    }
}

impl fmt::Display for FirmwareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SUCCESS => f.write_str("SUCCESS"),
            Self::INVALID_PARAMETER => f.write_str("INVALID_PARAMETER"),
            Self::BUFFER_TOO_SMALL => f.write_str("BUFFER_TOO_SMALL"),
            Self::OUT_OF_RESOURCES => f.write_str("OUT_OF_RESOURCES"),
            Self::NOT_FOUND => f.write_str("NOT_FOUND"),
            Self(raw) if raw & ERROR_BIT != 0 => write!(f, "EFI error {}", raw & !ERROR_BIT),
            Self(raw) => write!(f, "EFI warning {raw}"),
        }
    }
}

/// Opaque GetMemoryMap key. Only valid until the next firmware allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapKey(pub usize);

/// What a successful GetMemoryMap call reports alongside the filled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapInfo {
    /// Bytes of the buffer actually written.
    pub map_size: usize,
    pub key: MapKey,
    pub descriptor_size: usize,
    pub descriptor_version: u32,
}

/// Why a GetMemoryMap call did not fill the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapQueryError {
    /// The buffer must be at least `required` bytes.
    TooSmall { required: usize, descriptor_size: usize },
    Failed(FirmwareStatus),
}

pub trait BootServices {
    type Handle: Copy;

    /// GetMemoryMap into `buf`.
    fn memory_map(&mut self, buf: &mut [u8]) -> Result<MapInfo, MapQueryError>;

    /// AllocatePool(LOADER_DATA). The memory outlives boot services.
    fn allocate_pool(&mut self, size: usize) -> Result<&'static mut [u8], FirmwareStatus>;

    /// FreePool. Only for buffers from [`BootServices::allocate_pool`].
    fn free_pool(&mut self, buf: &'static mut [u8]);

    /// AllocatePages(AnyPages, LOADER_DATA). Returns the physical base.
    fn allocate_pages(&mut self, pages: usize) -> Result<u64, FirmwareStatus>;

    /// ExitBootServices with `key`.
    ///
    /// # Safety
    /// On success every boot-service pointer is dead. The caller must not touch
    /// firmware again except through another exit attempt after a failure.
    unsafe fn exit_boot_services(&mut self, image: Self::Handle, key: MapKey) -> Result<(), FirmwareStatus>;
}
