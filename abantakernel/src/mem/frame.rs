// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// src/mem/frame.rs
//! The only allocator left after ExitBootServices: a LIFO free list of 4 KiB
//! frames threaded through the frames themselves.
//!
//! Each free frame's first 8 bytes hold the address of the next free frame.
//! No side table, no double-free detection, no foreign-frame detection: the
//! caller of [`PhysPageAllocator::free_page`] is trusted.

use x86_64::{
    PhysAddr,
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
};

use super::{PAGE_SIZE, PageSource, Region, align_down, align_up};
use crate::error::AllocationError;

pub const FRAME_SIZE: usize = PAGE_SIZE;

// Frame 0 is a legal physical frame, so the list end cannot be 0.
const LIST_END: u64 = u64::MAX;

pub struct PhysPageAllocator {
    managed: Region,
    head: u64,
    free: usize,
}

impl PhysPageAllocator {
    pub const fn empty() -> Self {
        Self {
            managed: Region::new(0, 0),
            head: LIST_END,
            free: 0,
        }
    }

    /// Take over `[base, base + length)`, shrunk inward to whole frames.
    ///
    /// # Safety
    /// The range must be identity-mapped RAM that nothing else uses for as
    /// long as the allocator lives. It must not overlap the page tables.
    pub unsafe fn init(base: u64, length: u64) -> Self {
        let mut this = Self::empty();
        let Some(start) = align_up(base, FRAME_SIZE as u64) else {
            return this;
        };
        let end = align_down(base.saturating_add(length), FRAME_SIZE as u64);
        if end <= start {
            log::warn!("[frame] pool {:#x}+{:#x} holds no whole frame", base, length);
            return this;
        }
        this.managed = Region::new(start, (end - start) as usize);

        // Ascending pushes leave the highest frame at the head.
        let mut p = start;
        while p + FRAME_SIZE as u64 <= end {
            unsafe { this.push(p) };
            p += FRAME_SIZE as u64;
        }
        log::info!(
            "[frame] pool {:#x}..{:#x}, {} frames",
            start,
            end,
            this.free
        );
        this
    }

    pub fn managed(&self) -> Region {
        self.managed
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn alloc_page(&mut self) -> Option<PhysFrame> {
        if self.head == LIST_END {
            return None;
        }
        let frame = self.head;
        self.head = unsafe { Self::next_of(frame) };
        self.free -= 1;
        Some(PhysFrame::containing_address(PhysAddr::new(frame)))
    }

    /// Push `frame` back on the list.
    ///
    /// # Safety
    /// `frame` must have come from this allocator and must not already be
    /// free. Neither condition is checked.
    pub unsafe fn free_page(&mut self, frame: PhysFrame) {
        unsafe { self.push(frame.start_address().as_u64()) };
    }

    /// Page-granular allocation. Anything above one frame is refused: frames
    /// come off the list in no particular order and nothing coalesces them.
    pub fn allocate(&mut self, size: usize) -> Result<Region, AllocationError> {
        match size {
            0 => Err(AllocationError::ZeroSize),
            s if s > FRAME_SIZE => Err(AllocationError::NotSupported { requested: s }),
            _ => {
                let frame = self.alloc_page().ok_or(AllocationError::OutOfFrames)?;
                Ok(Region::new(frame.start_address().as_u64(), FRAME_SIZE))
            }
        }
    }

    /// Pull the frames covering `[addr, addr + len)` off the free list.
    ///
    /// On failure every frame taken by this call goes back on the list.
    pub fn claim(&mut self, addr: u64, len: usize) -> Result<Region, AllocationError> {
        if len == 0 {
            return Err(AllocationError::ZeroSize);
        }
        let start = align_down(addr, FRAME_SIZE as u64);
        let end = addr
            .checked_add(len as u64)
            .and_then(|e| align_up(e, FRAME_SIZE as u64))
            .ok_or(AllocationError::OutOfRange { addr })?;
        let wanted = Region::new(start, (end - start) as usize);
        if !self.managed.contains(start, wanted.len()) {
            return Err(AllocationError::OutOfRange { addr: start });
        }

        for (taken, page) in wanted.pages().enumerate() {
            if !self.unlink(page) {
                for back in wanted.pages().take(taken) {
                    unsafe { self.push(back) };
                }
                return Err(AllocationError::Conflict { addr: page });
            }
        }
        Ok(wanted)
    }

    fn unlink(&mut self, target: u64) -> bool {
        let mut prev = LIST_END;
        let mut cur = self.head;
        while cur != LIST_END {
            let next = unsafe { Self::next_of(cur) };
            if cur == target {
                if prev == LIST_END {
                    self.head = next;
                } else {
                    unsafe { Self::set_next(prev, next) };
                }
                self.free -= 1;
                return true;
            }
            prev = cur;
            cur = next;
        }
        false
    }

    unsafe fn push(&mut self, frame: u64) {
        unsafe { Self::set_next(frame, self.head) };
        self.head = frame;
        self.free += 1;
    }

    unsafe fn next_of(frame: u64) -> u64 {
        unsafe { core::ptr::read(frame as *const u64) }
    }

    unsafe fn set_next(frame: u64, next: u64) {
        unsafe { core::ptr::write(frame as *mut u64, next) }
    }
}

impl PageSource for PhysPageAllocator {
    fn allocate(&mut self, size: usize) -> Result<Region, AllocationError> {
        PhysPageAllocator::allocate(self, size)
    }

    fn allocate_at(&mut self, addr: u64, size: usize) -> Result<Region, AllocationError> {
        self.claim(addr, size)
    }

    fn release(&mut self, region: Region) {
        for page in region.pages() {
            if !self.managed.contains(page, FRAME_SIZE) {
                log::warn!("[frame] release of foreign page {:#x} ignored", page);
                continue;
            }
            unsafe { self.push(page) };
        }
    }

    fn bytes(&self, region: &Region) -> Option<&[u8]> {
        if !self.managed.contains(region.base(), region.len()) {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts(region.base() as *const u8, region.len()) })
    }

    fn bytes_mut(&mut self, region: &Region) -> Option<&mut [u8]> {
        if !self.managed.contains(region.base(), region.len()) {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts_mut(region.base() as *mut u8, region.len()) })
    }
}

unsafe impl FrameAllocator<Size4KiB> for PhysPageAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.alloc_page()
    }
}

impl FrameDeallocator<Size4KiB> for PhysPageAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        unsafe { self.free_page(frame) }
    }
}
