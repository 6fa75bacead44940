//! Controller side of the memory-access monitor.
//!
//! The controller owns the shared region: it creates the named mapping,
//! stamps the configuration, flips `active`, drains the hit ring and runs
//! the teardown protocol. The injected DLL only ever reacts to what is
//! written here.
//!
//! Arming and disarming the actual debug registers happens inside the target
//! through the DLL exports; driving those is the injector's job and sits
//! outside this type.

use crate::ControllerError;
use shared::veh::{SharedHeader, MAX_HITS, SHARED_MEM_MAGIC};
use std::io;
use std::mem::size_of;
use std::ptr::{self, addr_of, addr_of_mut, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use widestring::U16CString;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, VirtualProtectEx, VirtualQueryEx,
    FILE_MAP_ALL_ACCESS,
};
use winapi::um::processthreadsapi::OpenProcess;
use winapi::um::winnt::{
    HANDLE, MEMORY_BASIC_INFORMATION, PAGE_GUARD, PAGE_READWRITE, PROCESS_QUERY_INFORMATION,
    PROCESS_VM_OPERATION,
};

/// Bound on the quiescence wait before teardown gives up and leaks the
/// region instead of unmapping under a live handler.
const TEARDOWN_WAIT: Duration = Duration::from_secs(5);

/// One drained hit site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub address: u64,
    pub thread_id: u32,
}

/// Consumer-cursor advance for one drain pass.
///
/// Returns the first index to read and how many slots are readable. When the
/// producer has lapped the ring, everything older than one full ring is
/// unrecoverable and is skipped; that loss is by design.
fn plan_drain(cursor: u32, produced: u32) -> (u32, u32) {
    let available = produced.wrapping_sub(cursor);

    if available as usize > MAX_HITS {
        let skipped = available - MAX_HITS as u32;
        (cursor.wrapping_add(skipped), MAX_HITS as u32)
    } else {
        (cursor, available)
    }
}

/// Spins until `counter` reaches zero or the deadline passes.
fn wait_for_quiescence(counter: &AtomicU32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    while counter.load(Ordering::Relaxed) != 0 {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::yield_now();
    }

    true
}

struct ProcessHandle(HANDLE);

impl ProcessHandle {
    fn open(process_id: u32) -> Result<Self, ControllerError> {
        let handle = unsafe {
            OpenProcess(
                PROCESS_VM_OPERATION | PROCESS_QUERY_INFORMATION,
                0,
                process_id,
            )
        };
        if handle.is_null() {
            return Err(ControllerError::OpenTarget {
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self(handle))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// Applies `PAGE_GUARD` on top of the watched page's current protection in
/// the target and returns the protection that was in place, which belongs in
/// the header as `orig_protection`.
pub fn arm_guard_page(process_id: u32, address: u64) -> Result<u32, ControllerError> {
    let process = ProcessHandle::open(process_id)?;
    let page_base = (address & !0xfff) as usize as *mut _;

    let mut info = std::mem::MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();
    let len = unsafe {
        VirtualQueryEx(
            process.0,
            page_base,
            info.as_mut_ptr(),
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if len == 0 {
        return Err(ControllerError::GuardProtect {
            source: io::Error::last_os_error(),
        });
    }
    let original = unsafe { info.assume_init() }.Protect;

    let mut previous = 0;
    let ok = unsafe {
        VirtualProtectEx(
            process.0,
            page_base,
            0x1000,
            original | PAGE_GUARD,
            &mut previous,
        )
    };
    if ok == 0 {
        return Err(ControllerError::GuardProtect {
            source: io::Error::last_os_error(),
        });
    }

    Ok(original)
}

/// Restores the protection recorded by [`arm_guard_page`], dropping the
/// guard bit for good.
pub fn disarm_guard_page(
    process_id: u32,
    address: u64,
    original: u32,
) -> Result<(), ControllerError> {
    let process = ProcessHandle::open(process_id)?;
    let page_base = (address & !0xfff) as usize as *mut _;

    let mut previous = 0;
    let ok = unsafe { VirtualProtectEx(process.0, page_base, 0x1000, original, &mut previous) };
    if ok == 0 {
        return Err(ControllerError::GuardProtect {
            source: io::Error::last_os_error(),
        });
    }

    Ok(())
}

pub struct MonitorSession {
    handle: HANDLE,
    header: NonNull<SharedHeader>,
}

macro_rules! atomic_u32_field {
    ($name:ident) => {
        fn $name(&self) -> &AtomicU32 {
            unsafe { &*(addr_of!((*self.header.as_ptr()).$name) as *const AtomicU32) }
        }
    };
}

impl MonitorSession {
    /// Creates and maps the named shared region, zeroed, with the magic
    /// stamped last so the DLL never sees a half-built header.
    pub fn create(name: &str) -> Result<Self, ControllerError> {
        let wide = U16CString::from_str(name).map_err(|_| ControllerError::BadRegionName)?;

        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null_mut(),
                PAGE_READWRITE,
                0,
                size_of::<SharedHeader>() as u32,
                wide.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(ControllerError::CreateRegion {
                source: io::Error::last_os_error(),
            });
        }

        let view = unsafe {
            MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size_of::<SharedHeader>())
        };
        if view.is_null() {
            let source = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(ControllerError::CreateRegion { source });
        }

        unsafe { ptr::write_bytes(view as *mut u8, 0, size_of::<SharedHeader>()) };

        let session = Self {
            handle,
            header: unsafe { NonNull::new_unchecked(view as *mut SharedHeader) },
        };
        session.magic().store(SHARED_MEM_MAGIC, Ordering::Release);

        Ok(session)
    }

    atomic_u32_field!(magic);
    atomic_u32_field!(active);
    atomic_u32_field!(hit_count);
    atomic_u32_field!(bp_size);
    atomic_u32_field!(bp_type);
    atomic_u32_field!(bp_slot);
    atomic_u32_field!(write_index);
    atomic_u32_field!(read_index);
    atomic_u32_field!(use_guard);
    atomic_u32_field!(page_size);
    atomic_u32_field!(orig_protection);
    atomic_u32_field!(active_handlers);
    atomic_u32_field!(shutdown_requested);

    fn set_watch_address(&self, address: u64) {
        unsafe { addr_of_mut!((*self.header.as_ptr()).watch_address).write_unaligned(address) };
    }

    fn set_page_base(&self, base: u64) {
        unsafe { addr_of_mut!((*self.header.as_ptr()).page_base).write_unaligned(base) };
    }

    /// Stamps a hardware-breakpoint configuration. The injector still has to
    /// call the DLL's arm export (or `RefreshBreakpoints`) for threads to
    /// pick it up.
    pub fn configure_hardware(&self, slot: u32, address: u64, bp_type: u32, size: u32) {
        self.set_watch_address(address);
        self.bp_slot().store(slot.min(3), Ordering::Relaxed);
        self.bp_type().store(bp_type, Ordering::Relaxed);
        self.bp_size().store(size, Ordering::Relaxed);
        self.use_guard().store(0, Ordering::Relaxed);
    }

    /// Stamps a guard-page configuration. `orig_protection` is the page
    /// protection observed when the guard bit was first applied; the DLL
    /// re-arms with `orig_protection | PAGE_GUARD` after every consumed
    /// fault.
    pub fn configure_guard(&self, address: u64, size: u32, orig_protection: u32) {
        self.set_watch_address(address);
        self.bp_size().store(size, Ordering::Relaxed);
        self.set_page_base(address & !0xfff);
        self.page_size().store(0x1000, Ordering::Relaxed);
        self.orig_protection().store(orig_protection, Ordering::Relaxed);
        self.use_guard().store(1, Ordering::Relaxed);
    }

    pub fn activate(&self) {
        self.active().store(1, Ordering::Release);
    }

    pub fn deactivate(&self) {
        self.active().store(0, Ordering::Release);
    }

    pub fn total_hits(&self) -> u32 {
        self.hit_count().load(Ordering::Relaxed)
    }

    /// Drains every hit recorded since the last call. Slots overwritten by a
    /// lapping producer are silently skipped.
    pub fn drain(&self) -> Vec<Hit> {
        let produced = self.write_index().load(Ordering::Relaxed);
        let cursor = self.read_index().load(Ordering::Relaxed);

        let (mut cursor, count) = plan_drain(cursor, produced);

        let mut hits = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let slot = SharedHeader::slot(cursor);
            let header = self.header.as_ptr();

            hits.push(Hit {
                address: unsafe { addr_of!((*header).hit_addresses[slot]).read_volatile() },
                thread_id: unsafe { addr_of!((*header).hit_thread_ids[slot]).read_volatile() },
            });

            cursor = cursor.wrapping_add(1);
        }

        self.read_index().store(produced, Ordering::Relaxed);

        hits
    }

    /// Teardown protocol: latch shutdown, deactivate, wait for handler
    /// quiescence, then unmap. If handlers are still inside after the bound,
    /// the region is leaked on purpose; unmapping under a live handler
    /// trades a leak for a crash.
    ///
    /// The debug registers and page protection are restored through the DLL
    /// exports before this is called.
    pub fn shutdown(self) -> Result<(), ControllerError> {
        self.shutdown_requested().store(1, Ordering::Release);
        self.active().store(0, Ordering::Release);

        if !wait_for_quiescence(self.active_handlers(), TEARDOWN_WAIT) {
            let live = self.active_handlers().load(Ordering::Relaxed);
            eprintln!(
                "monitor teardown: {live} handler(s) still live after {TEARDOWN_WAIT:?}, leaking region"
            );
            std::mem::forget(self);
            return Err(ControllerError::TeardownTimedOut);
        }

        Ok(())
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(self.header.as_ptr() as _);
            CloseHandle(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_plan_drain_simple() {
        assert_eq!(plan_drain(0, 3), (0, 3));
        assert_eq!(plan_drain(3, 3), (3, 0));
    }

    #[test]
    fn test_plan_drain_skips_lapped_slots() {
        let produced = MAX_HITS as u32 + 100;
        let (cursor, count) = plan_drain(0, produced);

        assert_eq!(count, MAX_HITS as u32);
        assert_eq!(cursor, 100);
    }

    #[test]
    fn test_plan_drain_wrapping_counter() {
        // Producer counter wrapped around u32::MAX: slots MAX-1, MAX, 0, 1.
        let (cursor, count) = plan_drain(u32::MAX - 1, 2);

        assert_eq!(cursor, u32::MAX - 1);
        assert_eq!(count, 4);
    }

    #[test]
    fn test_wait_for_quiescence_immediate() {
        let counter = AtomicU32::new(0);
        assert!(wait_for_quiescence(&counter, Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_for_quiescence_times_out() {
        let counter = AtomicU32::new(1);
        assert!(!wait_for_quiescence(&counter, Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_for_quiescence_observes_release() {
        let counter = Arc::new(AtomicU32::new(2));

        let releaser = {
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                counter.store(0, Ordering::Relaxed);
            })
        };

        assert!(wait_for_quiescence(&counter, Duration::from_secs(5)));
        releaser.join().unwrap();
    }
}
