// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// src/module/host.rs
//! The host side of the module ABI.
//!
//! Modules see one `#[repr(C)]` table of `sysv64` function pointers. Every
//! function takes the table's `context` as its first argument. The same
//! functions are exported by name, and `abanta_host_api` names a slot that
//! holds the table's address.

use core::ffi::{CStr, c_char, c_void};
use core::mem::size_of;
use core::ptr;

use spin::{Mutex, MutexGuard, Once};

use super::registry::ModuleRegistry;
use crate::bootinfo::MemoryMapSnapshot;
use crate::elf::{self, LoadPolicy};
use crate::error::{LoadError, RegistryError};
use crate::mem::{PAGE_SIZE, PageSource, Region, is_page_aligned};

pub const HOST_API_VERSION: u32 = 1;

/// Line-oriented text sink.
pub trait Console {
    fn write_line(&self, line: &str);
}

/// What a module may ask of the host.
pub trait HostServices {
    fn print_line(&self, line: &str);
    /// At most one page; `None` when that is not available.
    fn allocate(&self, size: usize) -> Option<u64>;
    /// A page previously returned by `allocate`.
    fn free(&self, addr: u64);
    fn lookup(&self, name: &[u8]) -> Option<u64>;
    /// Raw descriptors and the firmware descriptor stride.
    fn memory_map(&self) -> (&'static [u8], usize);
}

pub type PrintLineFn = unsafe extern "sysv64" fn(*const c_void, *const u8, usize);
pub type AllocateFn = unsafe extern "sysv64" fn(*const c_void, usize) -> *mut u8;
pub type FreeFn = unsafe extern "sysv64" fn(*const c_void, *mut u8);
pub type LookupFn = unsafe extern "sysv64" fn(*const c_void, *const c_char) -> *const c_void;
pub type MemoryMapFn = unsafe extern "sysv64" fn(*const c_void, *mut usize, *mut usize) -> *const u8;

/// Field order is ABI.
#[repr(C)]
pub struct HostApi {
    pub version: u32,
    /// `size_of::<HostApi>()`, for forward compatibility checks.
    pub size: u32,
    pub context: *const c_void,
    pub print_line: PrintLineFn,
    pub allocate: AllocateFn,
    pub free: FreeFn,
    pub lookup: LookupFn,
    pub memory_map: MemoryMapFn,
}

// The context is a `&'static` host whose state sits behind spin locks.
unsafe impl Send for HostApi {}
unsafe impl Sync for HostApi {}

impl HostApi {
    pub fn new<S: HostServices>(services: &'static S) -> Self {
        Self {
            version: HOST_API_VERSION,
            size: size_of::<Self>() as u32,
            context: services as *const S as *const c_void,
            print_line: print_line_raw::<S>,
            allocate: allocate_raw::<S>,
            free: free_raw::<S>,
            lookup: lookup_raw::<S>,
            memory_map: memory_map_raw::<S>,
        }
    }
}

unsafe extern "sysv64" fn print_line_raw<S: HostServices>(ctx: *const c_void, text: *const u8, len: usize) {
    if ctx.is_null() || (text.is_null() && len != 0) {
        return;
    }
    let s = unsafe { &*(ctx as *const S) };
    let bytes = if len == 0 {
        &[][..]
    } else {
        unsafe { core::slice::from_raw_parts(text, len) }
    };
    match core::str::from_utf8(bytes) {
        Ok(line) => s.print_line(line),
        Err(e) => s.print_line(core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or("")),
    }
}

unsafe extern "sysv64" fn allocate_raw<S: HostServices>(ctx: *const c_void, size: usize) -> *mut u8 {
    if ctx.is_null() {
        return ptr::null_mut();
    }
    let s = unsafe { &*(ctx as *const S) };
    s.allocate(size).map_or(ptr::null_mut(), |a| a as *mut u8)
}

unsafe extern "sysv64" fn free_raw<S: HostServices>(ctx: *const c_void, p: *mut u8) {
    if ctx.is_null() || p.is_null() {
        return;
    }
    unsafe { &*(ctx as *const S) }.free(p as u64);
}

unsafe extern "sysv64" fn lookup_raw<S: HostServices>(ctx: *const c_void, name: *const c_char) -> *const c_void {
    if ctx.is_null() || name.is_null() {
        return ptr::null();
    }
    let s = unsafe { &*(ctx as *const S) };
    let name = unsafe { CStr::from_ptr(name) };
    s.lookup(name.to_bytes()).map_or(ptr::null(), |a| a as *const c_void)
}

unsafe extern "sysv64" fn memory_map_raw<S: HostServices>(
    ctx: *const c_void,
    count: *mut usize,
    descriptor_size: *mut usize,
) -> *const u8 {
    if ctx.is_null() {
        return ptr::null();
    }
    let (bytes, stride) = unsafe { &*(ctx as *const S) }.memory_map();
    unsafe {
        if !count.is_null() {
            *count = bytes.len() / stride.max(1);
        }
        if !descriptor_size.is_null() {
            *descriptor_size = stride;
        }
    }
    bytes.as_ptr()
}

/// How a module's entry point is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryConvention {
    /// `extern "sysv64" fn(*const HostApi)`.
    WithHostApi,
    /// `extern "sysv64" fn()`; the module reaches the table via `abanta_host_api`.
    NoArgs,
}

/// Everything the loaded modules share: the page source, the registry and
/// the captured memory map.
pub struct Host<C: Console, M: PageSource> {
    console: C,
    memory: Mutex<M>,
    registry: Mutex<ModuleRegistry>,
    snapshot: MemoryMapSnapshot,
    api: Once<HostApi>,
    api_slot: Once<u64>,
}

impl<C, M> Host<C, M>
where
    C: Console + Sync + 'static,
    M: PageSource + Send + 'static,
{
    pub fn new(console: C, memory: M, snapshot: MemoryMapSnapshot) -> Self {
        Self {
            console,
            memory: Mutex::new(memory),
            registry: Mutex::new(ModuleRegistry::new()),
            snapshot,
            api: Once::new(),
            api_slot: Once::new(),
        }
    }

    /// Build the table and export the host symbols. Call once, before the
    /// first module is loaded.
    ///
    /// The exported `abanta_*` functions are the table's entries, so each
    /// takes the table's `context` as its first argument. A module that
    /// imports them by name reads `context` from the table whose address is
    /// stored at `abanta_host_api`.
    pub fn publish(&'static self) -> Result<&'static HostApi, RegistryError> {
        let api: &'static HostApi = self.api.call_once(|| HostApi::new(self));
        let slot = self.api_slot.call_once(|| api as *const HostApi as u64);

        let mut reg = self.registry.lock();
        reg.register_host("abanta_print_line", api.print_line as usize as u64)?;
        reg.register_host("abanta_alloc", api.allocate as usize as u64)?;
        reg.register_host("abanta_free", api.free as usize as u64)?;
        reg.register_host("abanta_dlsym", api.lookup as usize as u64)?;
        reg.register_host("abanta_memory_map", api.memory_map as usize as u64)?;
        reg.register_host("abanta_host_api", slot as *const u64 as u64)?;
        log::info!(
            "[host] API v{} at {:p}, {} host symbols",
            api.version,
            api,
            reg.host_symbols().len()
        );
        Ok(api)
    }

    pub fn api(&self) -> Option<&HostApi> {
        self.api.get()
    }

    /// Export an extra capability.
    pub fn register_host(&self, name: &'static str, addr: u64) -> Result<(), RegistryError> {
        self.registry.lock().register_host(name, addr)
    }

    pub fn registry(&self) -> MutexGuard<'_, ModuleRegistry> {
        self.registry.lock()
    }

    pub fn with_memory<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        f(&mut self.memory.lock())
    }

    pub fn snapshot(&self) -> &MemoryMapSnapshot {
        &self.snapshot
    }

    /// Load, relocate and register `image`. Returns the entry address.
    pub fn load_module(
        &self,
        name: &'static str,
        image: &'static [u8],
        policy: LoadPolicy,
    ) -> Result<u64, LoadError> {
        let mut reg = self.registry.lock();
        if reg.is_full() {
            return Err(RegistryError::TableFull.into());
        }
        let module = {
            let mut mem = self.memory.lock();
            elf::load(name, image, policy, &mut *mem, &*reg)?
        };
        let entry = module.entry;
        reg.register(module)?;
        Ok(entry)
    }

    /// Call the entry point of module `name`.
    ///
    /// # Safety
    /// Jumps into module code. A bad entry point is not recoverable.
    pub unsafe fn run_module(&self, name: &str, convention: EntryConvention) -> Result<(), RegistryError> {
        let entry = self
            .registry
            .lock()
            .get(name)
            .map(|m| m.entry)
            .ok_or(RegistryError::UnknownModule)?;
        log::info!("[host] running {} at {:#x} ({:?})", name, entry, convention);

        match convention {
            EntryConvention::WithHostApi => {
                let api = self.api.get().ok_or(RegistryError::NotPublished)?;
                let f: extern "sysv64" fn(*const HostApi) =
                    unsafe { core::mem::transmute(entry as usize) };
                f(api);
            }
            EntryConvention::NoArgs => {
                let f: extern "sysv64" fn() = unsafe { core::mem::transmute(entry as usize) };
                f();
            }
        }
        log::info!("[host] {} returned", name);
        Ok(())
    }
}

impl<C, M> HostServices for Host<C, M>
where
    C: Console + Sync + 'static,
    M: PageSource + Send + 'static,
{
    fn print_line(&self, line: &str) {
        self.console.write_line(line);
    }

    fn allocate(&self, size: usize) -> Option<u64> {
        if size == 0 || size > PAGE_SIZE {
            log::debug!("[host] allocate({}) refused", size);
            return None;
        }
        self.memory.lock().allocate(size).ok().map(|r| r.base())
    }

    fn free(&self, addr: u64) {
        if !is_page_aligned(addr) {
            log::warn!("[host] free({:#x}) not a page, ignored", addr);
            return;
        }
        self.memory.lock().release(Region::new(addr, PAGE_SIZE));
    }

    fn lookup(&self, name: &[u8]) -> Option<u64> {
        self.registry.lock().dlsym(name)
    }

    fn memory_map(&self) -> (&'static [u8], usize) {
        (self.snapshot.as_bytes(), self.snapshot.descriptor_size())
    }
}
