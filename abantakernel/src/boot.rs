// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// src/boot.rs
//! Leaving UEFI boot services.
//!
//! [`reserve`] grabs the memory the core needs while firmware can still hand
//! it out. [`capture_and_exit`] then takes the final memory map and calls
//! ExitBootServices, consuming the firmware handle so nothing can call into
//! boot services afterwards.

use crate::bootinfo::MemoryMapSnapshot;
use crate::error::BootServiceError;
use crate::firmware::{BootServices, FirmwareStatus, MapQueryError};
use crate::mem::paging::PageTableBuilder;
use crate::mem::{PAGE_SIZE, Region};

/// How often ExitBootServices is tried before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPolicy {
    pub attempts: u32,
}

impl ExitPolicy {
    pub const fn new(attempts: u32) -> Self {
        Self { attempts }
    }
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Page counts to take from firmware before the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationPlan {
    pub table_pages: usize,
    pub pool_pages: usize,
}

impl ReservationPlan {
    /// Enough table pages to identity-map up to `identity_limit` bytes.
    pub fn for_identity(identity_limit: u64, pool_pages: usize) -> Self {
        Self {
            table_pages: PageTableBuilder::pages_needed(identity_limit),
            pool_pages,
        }
    }
}

/// LOADER_DATA pages that survive ExitBootServices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub page_tables: Region,
    pub pool: Region,
}

pub fn reserve<F: BootServices + ?Sized>(
    fw: &mut F,
    plan: ReservationPlan,
) -> Result<Reservation, BootServiceError> {
    if plan.table_pages == 0 || plan.pool_pages == 0 {
        return Err(BootServiceError::InvalidPolicy);
    }
    let tables = fw
        .allocate_pages(plan.table_pages)
        .map_err(BootServiceError::Allocate)?;
    let pool = fw
        .allocate_pages(plan.pool_pages)
        .map_err(BootServiceError::Allocate)?;

    let r = Reservation {
        page_tables: Region::new(tables, plan.table_pages * PAGE_SIZE),
        pool: Region::new(pool, plan.pool_pages * PAGE_SIZE),
    };
    if r.page_tables.overlaps(&r.pool) {
        log::error!("[boot] reservations overlap: {:?} / {:?}", r.page_tables, r.pool);
        return Err(BootServiceError::Overlap);
    }
    log::info!(
        "[boot] reserved {} table pages at {:#x}, {} pool pages at {:#x}",
        plan.table_pages,
        tables,
        plan.pool_pages,
        pool
    );
    Ok(r)
}

/// Capture the memory map and exit boot services.
///
/// The buffer comes from AllocatePool (LOADER_DATA) with room for two extra
/// descriptors, since the allocation itself may split a map entry. A failed
/// exit is retried with a fresh map in the same buffer, because allocation
/// services may already be gone at that point.
pub fn capture_and_exit<F: BootServices>(
    mut fw: F,
    image: F::Handle,
    policy: ExitPolicy,
) -> Result<MemoryMapSnapshot, BootServiceError> {
    if policy.attempts == 0 {
        return Err(BootServiceError::InvalidPolicy);
    }

    let (required, desc_size) = match fw.memory_map(&mut []) {
        Err(MapQueryError::TooSmall { required, descriptor_size }) => (required, descriptor_size),
        Err(MapQueryError::Failed(status)) => return Err(BootServiceError::Query(status)),
        Ok(_) => return Err(BootServiceError::UnexpectedMapSize),
    };
    let capacity = desc_size
        .checked_mul(2)
        .and_then(|slack| slack.checked_add(required))
        .ok_or(BootServiceError::UnexpectedMapSize)?;
    let buf = fw.allocate_pool(capacity).map_err(BootServiceError::Allocate)?;
    log::debug!("[boot] map buffer {} bytes (descriptor size {})", capacity, desc_size);

    let mut last = FirmwareStatus::SUCCESS;
    for attempt in 1..=policy.attempts {
        let info = match fw.memory_map(&mut *buf) {
            Ok(info) => info,
            Err(e) => {
                let status = match e {
                    MapQueryError::TooSmall { .. } => FirmwareStatus::BUFFER_TOO_SMALL,
                    MapQueryError::Failed(s) => s,
                };
                log::error!("[boot] GetMemoryMap failed on attempt {}: {}", attempt, status);
                // Pool services are only known to be alive before the first exit call.
                if attempt == 1 {
                    fw.free_pool(buf);
                }
                return Err(BootServiceError::Query(status));
            }
        };

        match unsafe { fw.exit_boot_services(image, info.key) } {
            Ok(()) => {
                let bytes: &'static [u8] = buf;
                let snapshot = MemoryMapSnapshot::new(
                    &bytes[..info.map_size.min(bytes.len())],
                    info.descriptor_size,
                    info.descriptor_version,
                    info.key,
                );
                log::info!("[boot] boot services exited after {} attempt(s)", attempt);
                return Ok(snapshot);
            }
            Err(status) => {
                log::warn!("[boot] ExitBootServices attempt {} failed: {}", attempt, status);
                last = status;
            }
        }
    }

    Err(BootServiceError::Transition {
        status: last,
        attempts: policy.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootinfo::{MemoryAttributes, MemoryDescriptor, MemoryKind};
    use crate::firmware::{MapInfo, MapKey};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    const STRIDE: usize = 48;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Map(usize),
        Pool(usize),
        Free,
        Pages(usize),
        Exit(usize),
    }

    #[derive(Default)]
    struct Script {
        descriptors: usize,
        /// Each exit call pops one; an empty queue means success.
        exits: VecDeque<FirmwareStatus>,
        map_failure: Option<FirmwareStatus>,
        sizing_succeeds: bool,
        /// Descriptors added by the pool allocation.
        growth_on_alloc: usize,
        next_pages: u64,
        overlapping_pages: bool,
        key: usize,
        calls: Vec<Call>,
    }

    #[derive(Clone)]
    struct Mock(Rc<RefCell<Script>>);

    impl Mock {
        fn new(descriptors: usize) -> Self {
            Self(Rc::new(RefCell::new(Script {
                descriptors,
                next_pages: 0x100_0000,
                key: 7,
                ..Script::default()
            })))
        }

        fn calls(&self) -> Vec<Call> {
            self.0.borrow().calls.clone()
        }
    }

    impl BootServices for Mock {
        type Handle = ();

        fn memory_map(&mut self, buf: &mut [u8]) -> Result<MapInfo, MapQueryError> {
            let mut s = self.0.borrow_mut();
            s.calls.push(Call::Map(buf.len()));
            if let Some(status) = s.map_failure {
                if !(buf.is_empty() && !s.sizing_succeeds) {
                    return Err(MapQueryError::Failed(status));
                }
            }
            let required = s.descriptors * STRIDE;
            if buf.len() < required && !(buf.is_empty() && s.sizing_succeeds) {
                return Err(MapQueryError::TooSmall { required, descriptor_size: STRIDE });
            }
            for i in 0..s.descriptors.min(buf.len() / STRIDE) {
                MemoryDescriptor {
                    kind: MemoryKind::Conventional,
                    phys_start: (i as u64) << 20,
                    virt_start: 0,
                    page_count: 256,
                    attributes: MemoryAttributes::WB,
                }
                .encode(&mut buf[i * STRIDE..]);
            }
            Ok(MapInfo {
                map_size: required.min(buf.len()),
                key: MapKey(s.key),
                descriptor_size: STRIDE,
                descriptor_version: 1,
            })
        }

        fn allocate_pool(&mut self, size: usize) -> Result<&'static mut [u8], FirmwareStatus> {
            let mut s = self.0.borrow_mut();
            s.calls.push(Call::Pool(size));
            s.descriptors += s.growth_on_alloc;
            Ok(Box::leak(vec![0u8; size].into_boxed_slice()))
        }

        fn free_pool(&mut self, _buf: &'static mut [u8]) {
            self.0.borrow_mut().calls.push(Call::Free);
        }

        fn allocate_pages(&mut self, pages: usize) -> Result<u64, FirmwareStatus> {
            let mut s = self.0.borrow_mut();
            s.calls.push(Call::Pages(pages));
            let base = s.next_pages;
            if !s.overlapping_pages {
                s.next_pages += (pages * PAGE_SIZE) as u64;
            }
            Ok(base)
        }

        unsafe fn exit_boot_services(&mut self, _image: (), key: MapKey) -> Result<(), FirmwareStatus> {
            let mut s = self.0.borrow_mut();
            s.calls.push(Call::Exit(key.0));
            match s.exits.pop_front() {
                Some(status) => {
                    // A failed exit usually means the map moved under us.
                    s.key += 1;
                    Err(status)
                }
                None if key.0 == s.key => Ok(()),
                None => Err(FirmwareStatus::INVALID_PARAMETER),
            }
        }
    }

    #[test]
    fn follows_the_exit_protocol() {
        let fw = Mock::new(4);
        let snap = capture_and_exit(fw.clone(), (), ExitPolicy::default()).unwrap();
        assert_eq!(
            fw.calls(),
            vec![
                Call::Map(0),
                Call::Pool(4 * STRIDE + 2 * STRIDE),
                Call::Map(6 * STRIDE),
                Call::Exit(7),
            ]
        );
        assert_eq!(snap.len(), 4);
        assert_eq!(snap.key(), MapKey(7));
        assert_eq!(snap.descriptor_size(), STRIDE);
        assert_eq!(snap.total_pages(), 4 * 256);
    }

    #[test]
    fn slack_absorbs_the_pool_allocation() {
        let fw = Mock::new(4);
        fw.0.borrow_mut().growth_on_alloc = 2;
        let snap = capture_and_exit(fw, (), ExitPolicy::default()).unwrap();
        assert_eq!(snap.len(), 6);
    }

    #[test]
    fn retries_with_a_fresh_key_in_the_same_buffer() {
        let fw = Mock::new(3);
        fw.0.borrow_mut().exits.push_back(FirmwareStatus::INVALID_PARAMETER);
        let snap = capture_and_exit(fw.clone(), (), ExitPolicy::new(2)).unwrap();
        let calls = fw.calls();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Pool(_))).count(), 1);
        assert_eq!(&calls[calls.len() - 4..], &[
            Call::Map(5 * STRIDE),
            Call::Exit(7),
            Call::Map(5 * STRIDE),
            Call::Exit(8),
        ]);
        assert_eq!(snap.key(), MapKey(8));
    }

    #[test]
    fn gives_up_after_the_budget() {
        let fw = Mock::new(3);
        fw.0.borrow_mut().exits.extend([FirmwareStatus::INVALID_PARAMETER; 3]);
        assert_eq!(
            capture_and_exit(fw.clone(), (), ExitPolicy::new(3)),
            Err(BootServiceError::Transition {
                status: FirmwareStatus::INVALID_PARAMETER,
                attempts: 3
            })
        );
        assert_eq!(fw.calls().iter().filter(|c| matches!(c, Call::Exit(_))).count(), 3);
    }

    #[test]
    fn zero_attempts_touch_nothing() {
        let fw = Mock::new(3);
        assert_eq!(
            capture_and_exit(fw.clone(), (), ExitPolicy::new(0)),
            Err(BootServiceError::InvalidPolicy)
        );
        assert!(fw.calls().is_empty());
    }

    #[test]
    fn sizing_query_must_report_too_small() {
        let fw = Mock::new(0);
        fw.0.borrow_mut().sizing_succeeds = true;
        assert_eq!(
            capture_and_exit(fw.clone(), (), ExitPolicy::default()),
            Err(BootServiceError::UnexpectedMapSize)
        );
        assert_eq!(fw.calls(), vec![Call::Map(0)]);
    }

    #[test]
    fn failed_fill_frees_the_buffer() {
        let fw = Mock::new(3);
        fw.0.borrow_mut().map_failure = Some(FirmwareStatus::NOT_FOUND);
        assert_eq!(
            capture_and_exit(fw.clone(), (), ExitPolicy::default()),
            Err(BootServiceError::Query(FirmwareStatus::NOT_FOUND))
        );
        assert_eq!(fw.calls().last(), Some(&Call::Free));
        assert!(!fw.calls().iter().any(|c| matches!(c, Call::Exit(_))));
    }

    #[test]
    fn reserve_takes_two_spans() {
        let mut fw = Mock::new(1);
        let plan = ReservationPlan::for_identity(4 << 30, 64);
        assert_eq!(plan.table_pages, 6);
        let r = reserve(&mut fw, plan).unwrap();
        assert_eq!(r.page_tables, Region::new(0x100_0000, 6 * PAGE_SIZE));
        assert_eq!(r.pool, Region::new(0x100_6000, 64 * PAGE_SIZE));
        assert_eq!(fw.calls(), vec![Call::Pages(6), Call::Pages(64)]);
    }

    #[test]
    fn reserve_refuses_overlap() {
        let mut fw = Mock::new(1);
        fw.0.borrow_mut().overlapping_pages = true;
        assert_eq!(
            reserve(&mut fw, ReservationPlan::for_identity(1 << 30, 8)),
            Err(BootServiceError::Overlap)
        );
        assert_eq!(
            reserve(&mut fw, ReservationPlan { table_pages: 3, pool_pages: 0 }),
            Err(BootServiceError::InvalidPolicy)
        );
    }
}
