// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// src/bootinfo.rs

use bitflags::bitflags;

use crate::firmware::MapKey;
use crate::mem::PAGE_SIZE;

/// UEFI memory type, as stored in the descriptor's first field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    Reserved,
    LoaderCode,
    LoaderData,
    BootServicesCode,
    BootServicesData,
    RuntimeServicesCode,
    RuntimeServicesData,
    Conventional,
    Unusable,
    AcpiReclaimable,
    AcpiNvs,
    Mmio,
    MmioPortSpace,
    PalCode,
    Persistent,
    Unaccepted,
    Other(u32),
}

impl MemoryKind {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Reserved,
            1 => Self::LoaderCode,
            2 => Self::LoaderData,
            3 => Self::BootServicesCode,
            4 => Self::BootServicesData,
            5 => Self::RuntimeServicesCode,
            6 => Self::RuntimeServicesData,
            7 => Self::Conventional,
            8 => Self::Unusable,
            9 => Self::AcpiReclaimable,
            10 => Self::AcpiNvs,
            11 => Self::Mmio,
            12 => Self::MmioPortSpace,
            13 => Self::PalCode,
            14 => Self::Persistent,
            15 => Self::Unaccepted,
            other => Self::Other(other),
        }
    }

    /// Backed by DRAM (as opposed to device space or holes).
    pub fn is_ram(self) -> bool {
        matches!(
            self,
            Self::LoaderCode
                | Self::LoaderData
                | Self::BootServicesCode
                | Self::BootServicesData
                | Self::RuntimeServicesCode
                | Self::RuntimeServicesData
                | Self::Conventional
                | Self::AcpiReclaimable
                | Self::AcpiNvs
                | Self::Persistent
        )
    }

    /// Free for the taking once boot services are gone.
    pub fn is_usable_after_exit(self) -> bool {
        matches!(
            self,
            Self::Conventional | Self::BootServicesCode | Self::BootServicesData
        )
    }
}

bitflags! {
    /// EFI_MEMORY_* attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAttributes: u64 {
        const UC = 0x1;
        const WC = 0x2;
        const WT = 0x4;
        const WB = 0x8;
        const UCE = 0x10;
        const WP = 0x1000;
        const RP = 0x2000;
        const XP = 0x4000;
        const NV = 0x8000;
        const MORE_RELIABLE = 0x1_0000;
        const RO = 0x2_0000;
        const SP = 0x4_0000;
        const CPU_CRYPTO = 0x8_0000;
        const RUNTIME = 1 << 63;
        const _ = !0;
    }
}

/// One decoded firmware descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub kind: MemoryKind,
    pub phys_start: u64,
    pub virt_start: u64,
    pub page_count: u64,
    pub attributes: MemoryAttributes,
}

impl MemoryDescriptor {
    /// Bytes of the EFI_MEMORY_DESCRIPTOR fields we read. Firmware strides are
    /// at least this and usually larger.
    pub const RAW_SIZE: usize = 40;

    pub fn len(&self) -> u64 {
        self.page_count.saturating_mul(PAGE_SIZE as u64)
    }

    pub fn end(&self) -> u64 {
        self.phys_start.saturating_add(self.len())
    }

    fn decode(raw: &[u8]) -> Self {
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[off..off + 8]);
            u64::from_le_bytes(b)
        };
        let mut ty = [0u8; 4];
        ty.copy_from_slice(&raw[0..4]);
        Self {
            kind: MemoryKind::from_raw(u32::from_le_bytes(ty)),
            phys_start: u64_at(8),
            virt_start: u64_at(16),
            page_count: u64_at(24),
            attributes: MemoryAttributes::from_bits_retain(u64_at(32)),
        }
    }

    /// Inverse of `decode`, for building synthetic maps.
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&kind_to_raw(self.kind).to_le_bytes());
        out[4..8].fill(0);
        out[8..16].copy_from_slice(&self.phys_start.to_le_bytes());
        out[16..24].copy_from_slice(&self.virt_start.to_le_bytes());
        out[24..32].copy_from_slice(&self.page_count.to_le_bytes());
        out[32..40].copy_from_slice(&self.attributes.bits().to_le_bytes());
    }
}

fn kind_to_raw(k: MemoryKind) -> u32 {
    match k {
        MemoryKind::Reserved => 0,
        MemoryKind::LoaderCode => 1,
        MemoryKind::LoaderData => 2,
        MemoryKind::BootServicesCode => 3,
        MemoryKind::BootServicesData => 4,
        MemoryKind::RuntimeServicesCode => 5,
        MemoryKind::RuntimeServicesData => 6,
        MemoryKind::Conventional => 7,
        MemoryKind::Unusable => 8,
        MemoryKind::AcpiReclaimable => 9,
        MemoryKind::AcpiNvs => 10,
        MemoryKind::Mmio => 11,
        MemoryKind::MmioPortSpace => 12,
        MemoryKind::PalCode => 13,
        MemoryKind::Persistent => 14,
        MemoryKind::Unaccepted => 15,
        MemoryKind::Other(v) => v,
    }
}

/// The firmware memory map as it was at the moment of ExitBootServices.
///
/// Captured once and never modified. The backing buffer is LOADER_DATA pool
/// memory, which stays valid after the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapSnapshot {
    buf: &'static [u8],
    descriptor_size: usize,
    descriptor_version: u32,
    key: MapKey,
}

impl MemoryMapSnapshot {
    /// `buf` must hold whole descriptors at `descriptor_size` stride.
    pub fn new(buf: &'static [u8], descriptor_size: usize, descriptor_version: u32, key: MapKey) -> Self {
        let stride = descriptor_size.max(MemoryDescriptor::RAW_SIZE);
        let whole = buf.len() - buf.len() % stride;
        Self {
            buf: &buf[..whole],
            descriptor_size: stride,
            descriptor_version,
            key,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len() / self.descriptor_size
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn descriptor_size(&self) -> usize {
        self.descriptor_size
    }

    pub fn descriptor_version(&self) -> u32 {
        self.descriptor_version
    }

    pub fn key(&self) -> MapKey {
        self.key
    }

    /// The raw descriptor array, as handed out through the host API.
    pub fn as_bytes(&self) -> &'static [u8] {
        self.buf
    }

    pub fn get(&self, index: usize) -> Option<MemoryDescriptor> {
        let off = index.checked_mul(self.descriptor_size)?;
        let raw = self.buf.get(off..off.checked_add(MemoryDescriptor::RAW_SIZE)?)?;
        Some(MemoryDescriptor::decode(raw))
    }

    pub fn iter(&self) -> impl Iterator<Item = MemoryDescriptor> + '_ {
        self.buf
            .chunks_exact(self.descriptor_size)
            .map(|c| MemoryDescriptor::decode(&c[..MemoryDescriptor::RAW_SIZE]))
    }

    /// Firmware page counts are untrusted; totals saturate at `u64::MAX`.
    pub fn total_pages(&self) -> u64 {
        self.iter().fold(0u64, |acc, d| acc.saturating_add(d.page_count))
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_pages().saturating_mul(PAGE_SIZE as u64)
    }

    pub fn pages_of(&self, kind: MemoryKind) -> u64 {
        self.iter()
            .filter(|d| d.kind == kind)
            .fold(0u64, |acc, d| acc.saturating_add(d.page_count))
    }

    /// End of the highest RAM-backed descriptor; sizes the identity map.
    pub fn highest_ram_address(&self) -> u64 {
        self.iter()
            .filter(|d| d.kind.is_ram())
            .map(|d| d.end())
            .max()
            .unwrap_or(0)
    }

    pub fn log_summary(&self) {
        log::info!(
            "[mmap] {} descriptors (stride {}, v{}), {} pages total, {} reclaimable",
            self.len(),
            self.descriptor_size,
            self.descriptor_version,
            self.total_pages(),
            self.iter()
                .filter(|d| d.kind.is_usable_after_exit())
                .fold(0u64, |acc, d| acc.saturating_add(d.page_count))
        );
        for d in self.iter() {
            log::debug!(
                "[mmap] {:#014x}..{:#014x} {:?} attr={:#x}",
                d.phys_start,
                d.end(),
                d.kind,
                d.attributes.bits()
            );
        }
    }
}
