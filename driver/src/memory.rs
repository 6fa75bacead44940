//! Cross-process memory engine.
//!
//! Reads and writes go through `MmCopyVirtualMemory`, resolved at driver
//! entry. Writes that the copy routine rejects (read-only pages, typically
//! code sections) fall back to remapping the locked pages into system space
//! through an MDL and lifting the mapping protection to read/write.
//!
//! Every resource taken on the way in is released on every way out: the
//! process reference, the address-space attach and the MDL lifetime are all
//! modeled as drop guards, so an early error return cannot leak a step.

use crate::nt::include::{
    IoAllocateMdl, IoFreeMdl, IoGetCurrentProcess, KeStackAttachProcess, KeUnstackDetachProcess,
    MmGetSystemRoutineAddress, MmHighestUserAddress, MmIsAddressValid,
    MmMapLockedPagesSpecifyCache, MmProbeAndLockPages, MmProtectMdlSystemAddress, MmUnlockPages,
    MmUnmapLockedPages, ObfDereferenceObject, PsLookupProcessByProcessId, RtlInitUnicodeString,
    KAPC_STATE, KERNEL_MODE, KPROCESSOR_MODE, LOCK_OPERATION, MEMORY_CACHING_TYPE,
    NORMAL_PAGE_PRIORITY, PAGE_READWRITE, PEPROCESS, PMDL,
};
use alloc::boxed::Box;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};
use obfstr::wide;
use snafu::prelude::*;
use winapi::shared::ntdef::{HANDLE, NTSTATUS, PVOID, UNICODE_STRING};
use winapi::shared::ntstatus::{
    STATUS_ACCESS_VIOLATION, STATUS_INSUFFICIENT_RESOURCES, STATUS_NOT_FOUND,
    STATUS_NOT_IMPLEMENTED, STATUS_SUCCESS,
};

pub const PAGE_SIZE: u64 = 0x1000;
const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

type MmCopyVirtualMemoryFn = unsafe extern "system" fn(
    source_process: PEPROCESS,
    source_address: PVOID,
    target_process: PEPROCESS,
    target_address: PVOID,
    buffer_size: usize,
    previous_mode: KPROCESSOR_MODE,
    return_size: *mut usize,
) -> NTSTATUS;

type PsGetProcessSectionBaseAddressFn = unsafe extern "system" fn(process: PEPROCESS) -> PVOID;

// Resolved once in `DriverEntry`, before the device exists; read-only from
// then on.
static MM_COPY_VIRTUAL_MEMORY: AtomicUsize = AtomicUsize::new(0);
static PS_GET_PROCESS_SECTION_BASE_ADDRESS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Snafu)]
pub enum MemoryError {
    #[snafu(display("Required system routine is not exported by this kernel"))]
    RoutineNotAvailable,

    #[snafu(display("No process with id {pid}"))]
    ProcessNotFound { pid: u32 },

    #[snafu(display("Requested range is not valid user memory"))]
    RangeNotUserMemory,

    #[snafu(display("Cross-process copy failed with {status:#x}"))]
    CopyFailed { status: NTSTATUS },

    #[snafu(display("Failed to allocate the page descriptor"))]
    MdlAllocationFailed,

    #[snafu(display("Failed to map the locked pages into system space"))]
    MappingFailed,

    #[snafu(display("Failed to lift the mapping protection: {status:#x}"))]
    ProtectionChangeFailed { status: NTSTATUS },
}

impl MemoryError {
    pub fn to_ntstatus(&self) -> NTSTATUS {
        match self {
            Self::RoutineNotAvailable => STATUS_NOT_IMPLEMENTED,
            Self::ProcessNotFound { .. } => STATUS_NOT_FOUND,
            Self::RangeNotUserMemory => STATUS_ACCESS_VIOLATION,
            Self::CopyFailed { status } => *status,
            Self::MdlAllocationFailed | Self::MappingFailed => STATUS_INSUFFICIENT_RESOURCES,
            Self::ProtectionChangeFailed { status } => *status,
        }
    }
}

/// Resolves the undocumented routines the engine depends on. Missing exports
/// are tolerated here; the affected operations fail with `not implemented`.
pub fn resolve_routines() {
    let copy = resolve(wide!("MmCopyVirtualMemory\0"));
    let base = resolve(wide!("PsGetProcessSectionBaseAddress\0"));

    if copy.is_null() {
        log::warn!("MmCopyVirtualMemory is not exported; read/write will be unavailable");
    }
    if base.is_null() {
        log::warn!("PsGetProcessSectionBaseAddress is not exported; base lookup unavailable");
    }

    MM_COPY_VIRTUAL_MEMORY.store(copy as usize, Ordering::Relaxed);
    PS_GET_PROCESS_SECTION_BASE_ADDRESS.store(base as usize, Ordering::Relaxed);
}

fn resolve(name: impl AsRef<[u16]>) -> PVOID {
    let mut routine_name = MaybeUninit::<UNICODE_STRING>::uninit();

    unsafe {
        RtlInitUnicodeString(routine_name.as_mut_ptr(), name.as_ref().as_ptr());
        MmGetSystemRoutineAddress(routine_name.as_mut_ptr())
    }
}

fn copy_routine() -> Result<MmCopyVirtualMemoryFn, MemoryError> {
    let routine = MM_COPY_VIRTUAL_MEMORY.load(Ordering::Relaxed);
    ensure!(routine != 0, RoutineNotAvailableSnafu);

    Ok(unsafe { core::mem::transmute::<usize, MmCopyVirtualMemoryFn>(routine) })
}

fn base_routine() -> Result<PsGetProcessSectionBaseAddressFn, MemoryError> {
    let routine = PS_GET_PROCESS_SECTION_BASE_ADDRESS.load(Ordering::Relaxed);
    ensure!(routine != 0, RoutineNotAvailableSnafu);

    Ok(unsafe { core::mem::transmute::<usize, PsGetProcessSectionBaseAddressFn>(routine) })
}

/// Referenced process object. Dereferenced on drop, so every exit path of a
/// handler releases the reference taken for the request.
struct ProcessGuard(PEPROCESS);

impl ProcessGuard {
    fn lookup(pid: u32) -> Result<Self, MemoryError> {
        let mut process: PEPROCESS = core::ptr::null_mut();
        let status =
            unsafe { PsLookupProcessByProcessId(pid as usize as HANDLE, &mut process) };

        ensure!(status == STATUS_SUCCESS, ProcessNotFoundSnafu { pid });

        Ok(Self(process))
    }

    const fn process(&self) -> PEPROCESS {
        self.0
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        unsafe { ObfDereferenceObject(self.0) };
    }
}

/// Stack attach to another address space, detached on drop. The APC state is
/// boxed so the kernel-owned record never moves while attached.
struct AttachGuard {
    apc_state: Box<KAPC_STATE>,
}

impl AttachGuard {
    fn attach(process: PEPROCESS) -> Self {
        let mut apc_state: Box<KAPC_STATE> = unsafe { Box::new(core::mem::zeroed()) };

        unsafe { KeStackAttachProcess(process, &mut *apc_state) };

        Self { apc_state }
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        unsafe { KeUnstackDetachProcess(&mut *self.apc_state) };
    }
}

/// MDL over the target range. Unwinds exactly the steps that completed:
/// unmap, unlock, free, in that order.
struct MdlGuard {
    mdl: PMDL,
    locked: bool,
    mapping: PVOID,
}

impl MdlGuard {
    fn allocate(address: u64, size: u32) -> Result<Self, MemoryError> {
        let mdl = unsafe {
            IoAllocateMdl(address as usize as PVOID, size, 0, 0, core::ptr::null_mut())
        };

        ensure!(!mdl.is_null(), MdlAllocationFailedSnafu);

        Ok(Self {
            mdl,
            locked: false,
            mapping: core::ptr::null_mut(),
        })
    }
}

impl Drop for MdlGuard {
    fn drop(&mut self) {
        unsafe {
            if !self.mapping.is_null() {
                MmUnmapLockedPages(self.mapping, self.mdl);
            }
            if self.locked {
                MmUnlockPages(self.mdl);
            }
            IoFreeMdl(self.mdl);
        }
    }
}

/// Checks that `[address, address + size)` lies below the highest user-mode
/// address. Kernel Rust has no structured exception handling, so the probe is
/// an explicit bounds check rather than a guarded touch; the copy routine
/// performs its own guarded access on top of this.
fn probe_user_range(address: u64, size: usize) -> Result<(), MemoryError> {
    ensure!(address != 0 && size != 0, RangeNotUserMemorySnafu);

    let highest = unsafe { MmHighestUserAddress } as u64;
    let end = address
        .checked_add(size as u64)
        .context(RangeNotUserMemorySnafu)?;

    ensure!(end <= highest + 1, RangeNotUserMemorySnafu);

    Ok(())
}

/// Copies `size` bytes at `address` in the target process into `buffer`.
pub fn read_process_memory(
    pid: u32,
    address: u64,
    buffer: *mut u8,
    size: usize,
) -> Result<usize, MemoryError> {
    let copy = copy_routine()?;
    let target = ProcessGuard::lookup(pid)?;

    probe_user_range(address, size)?;

    let mut bytes_read = 0usize;
    let status = unsafe {
        copy(
            target.process(),
            address as usize as PVOID,
            IoGetCurrentProcess(),
            buffer as PVOID,
            size,
            KERNEL_MODE,
            &mut bytes_read,
        )
    };

    ensure!(status == STATUS_SUCCESS, CopyFailedSnafu { status });

    Ok(bytes_read)
}

/// Writes `size` bytes from `buffer` to `address` in the target process.
///
/// The direct copy path handles writable pages. When it fails, the range is
/// assumed to be write-protected and the engine switches to the MDL path:
/// attach, lock, remap into system space, lift the protection, copy.
pub fn write_process_memory(
    pid: u32,
    address: u64,
    buffer: *const u8,
    size: usize,
) -> Result<usize, MemoryError> {
    let copy = copy_routine()?;
    let target = ProcessGuard::lookup(pid)?;

    probe_user_range(address, size)?;

    let mut bytes_written = 0usize;
    let status = unsafe {
        copy(
            IoGetCurrentProcess(),
            buffer as PVOID,
            target.process(),
            address as usize as PVOID,
            size,
            KERNEL_MODE,
            &mut bytes_written,
        )
    };

    if status == STATUS_SUCCESS {
        return Ok(bytes_written);
    }

    log::trace!(
        "Direct copy to {:#x} failed with {:#x}, switching to locked-page remap",
        address,
        status
    );

    write_via_mdl(&target, address, buffer, size)
}

fn write_via_mdl(
    target: &ProcessGuard,
    address: u64,
    buffer: *const u8,
    size: usize,
) -> Result<usize, MemoryError> {
    let _attach = AttachGuard::attach(target.process());

    // `MmProbeAndLockPages` raises on an invalid address instead of returning
    // a status, which nothing in this crate can catch. Reject ranges that are
    // not resident in the attached space up front.
    let first_page = address & PAGE_MASK;
    let last_page = (address + size as u64 - 1) & PAGE_MASK;
    let mut page = first_page;
    while page <= last_page {
        ensure!(
            unsafe { MmIsAddressValid(page as usize as PVOID) } != 0,
            RangeNotUserMemorySnafu
        );
        page += PAGE_SIZE;
    }

    let mut mdl = MdlGuard::allocate(address, size as u32)?;

    unsafe {
        MmProbeAndLockPages(mdl.mdl, KERNEL_MODE, LOCK_OPERATION::IoReadAccess);
    }
    mdl.locked = true;

    let mapping = unsafe {
        MmMapLockedPagesSpecifyCache(
            mdl.mdl,
            KERNEL_MODE,
            MEMORY_CACHING_TYPE::MmNonCached,
            core::ptr::null_mut(),
            0,
            NORMAL_PAGE_PRIORITY,
        )
    };
    ensure!(!mapping.is_null(), MappingFailedSnafu);
    mdl.mapping = mapping;

    let status = unsafe { MmProtectMdlSystemAddress(mdl.mdl, PAGE_READWRITE) };
    ensure!(
        status == STATUS_SUCCESS,
        ProtectionChangeFailedSnafu { status }
    );

    unsafe { core::ptr::copy_nonoverlapping(buffer, mapping as *mut u8, size) };

    Ok(size)
}

/// Resolves the image base of the target process.
pub fn process_base_address(pid: u32) -> Result<u64, MemoryError> {
    let base = base_routine()?;
    let target = ProcessGuard::lookup(pid)?;

    Ok(unsafe { base(target.process()) } as u64)
}
