//! Shared-region transport: the mapping itself and a typed view over the
//! header.
//!
//! The controller owns the region; this side only opens the named mapping
//! and addresses it through [`HeaderView`]. All fields the two processes race
//! on are touched through atomics with relaxed ordering; the values carry no
//! dependent data beyond themselves.

use crate::MonitorError;
use core::mem::size_of;
use core::ptr::{addr_of, addr_of_mut, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};
use shared::veh::{SharedHeader, SHARED_MEM_MAGIC};
use widestring::U16CStr;
use winapi::shared::minwindef::FALSE;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::CloseHandle;
use winapi::um::memoryapi::{
    MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery, FILE_MAP_ALL_ACCESS,
};
use winapi::um::winnt::{HANDLE, MEMORY_BASIC_INFORMATION, MEM_COMMIT};

/// Open handle plus mapped view of the monitor region. Unmaps and closes on
/// drop.
pub struct SharedMapping {
    handle: HANDLE,
    view: NonNull<SharedHeader>,
}

// The mapping is shared state by construction; the header view enforces the
// access discipline.
unsafe impl Send for SharedMapping {}

impl SharedMapping {
    /// Opens the named mapping read/write and maps the full region.
    pub fn open(name: &U16CStr) -> Result<Self, MonitorError> {
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, FALSE, name.as_ptr()) };
        if handle.is_null() {
            return Err(MonitorError::OpenMapping {
                name: name.to_string_lossy(),
                code: unsafe { GetLastError() },
            });
        }

        let view = unsafe {
            MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size_of::<SharedHeader>())
        };
        if view.is_null() {
            let code = unsafe { GetLastError() };
            unsafe { CloseHandle(handle) };
            return Err(MonitorError::MapView { code });
        }

        Ok(Self {
            handle,
            view: unsafe { NonNull::new_unchecked(view as *mut SharedHeader) },
        })
    }

    pub fn header_ptr(&self) -> *mut SharedHeader {
        self.view.as_ptr()
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(self.view.as_ptr() as _);
            CloseHandle(self.handle);
        }
    }
}

/// Checks that the page backing the header is still committed. The teardown
/// protocol keeps the region mapped while handlers are inside, but a handler
/// that races initialization must not dereference a stale pointer.
pub fn region_committed(header: *const SharedHeader) -> bool {
    let mut info = core::mem::MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();

    let len = unsafe {
        VirtualQuery(
            header as _,
            info.as_mut_ptr(),
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if len == 0 {
        return false;
    }

    unsafe { info.assume_init() }.State == MEM_COMMIT
}

/// Typed accessor over a mapped [`SharedHeader`].
///
/// The struct is packed, but every atomically-accessed field sits on a
/// 4-byte boundary and the mapping is page aligned, so casting field
/// addresses to atomics is sound. The two `u64` configuration fields are not
/// naturally aligned and are read with unaligned loads; they are written
/// before activation and never while armed.
#[derive(Clone, Copy)]
pub struct HeaderView {
    ptr: *mut SharedHeader,
}

macro_rules! atomic_u32_field {
    ($name:ident) => {
        pub fn $name(&self) -> &AtomicU32 {
            unsafe { &*(addr_of!((*self.ptr).$name) as *const AtomicU32) }
        }
    };
}

impl HeaderView {
    /// Caller guarantees `ptr` is a live mapping of the shared region.
    pub unsafe fn new(ptr: *mut SharedHeader) -> Self {
        Self { ptr }
    }

    atomic_u32_field!(magic);
    atomic_u32_field!(active);
    atomic_u32_field!(hit_count);
    atomic_u32_field!(bp_size);
    atomic_u32_field!(bp_type);
    atomic_u32_field!(bp_slot);
    atomic_u32_field!(write_index);
    atomic_u32_field!(use_guard);
    atomic_u32_field!(page_size);
    atomic_u32_field!(orig_protection);
    atomic_u32_field!(active_handlers);
    atomic_u32_field!(shutdown_requested);

    pub fn magic_valid(&self) -> bool {
        self.magic().load(Ordering::Relaxed) == SHARED_MEM_MAGIC
    }

    pub fn watch_address(&self) -> u64 {
        unsafe { addr_of!((*self.ptr).watch_address).read_unaligned() }
    }

    pub fn page_base(&self) -> u64 {
        unsafe { addr_of!((*self.ptr).page_base).read_unaligned() }
    }

    /// Records one hit: claim a slot with an atomic increment, fill both
    /// parallel arrays, then bump the total. Wrap-around overwrites are
    /// accepted data loss.
    pub fn record_hit(&self, rip: u64, thread_id: u32) {
        let index = self.write_index().fetch_add(1, Ordering::Relaxed);
        let slot = SharedHeader::slot(index);

        unsafe {
            addr_of_mut!((*self.ptr).hit_addresses[slot]).write_volatile(rip);
            addr_of_mut!((*self.ptr).hit_thread_ids[slot]).write_volatile(thread_id);
        }

        self.hit_count().fetch_add(1, Ordering::Relaxed);
    }

    pub fn enter_handler(&self) {
        self.active_handlers().fetch_add(1, Ordering::Relaxed);
    }

    pub fn leave_handler(&self) {
        self.active_handlers().fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::veh::MAX_HITS;

    fn boxed_header() -> Box<SharedHeader> {
        // All-zero is a valid idle header.
        unsafe { Box::new(core::mem::zeroed()) }
    }

    #[test]
    fn test_record_hit_fills_parallel_slots() {
        let mut header = boxed_header();
        let view = unsafe { HeaderView::new(&mut *header) };

        view.record_hit(0xdead_beef, 42);
        view.record_hit(0xcafe_f00d, 43);

        assert_eq!({ header.write_index }, 2);
        assert_eq!({ header.hit_count }, 2);
        assert_eq!({ header.hit_addresses[0] }, 0xdead_beef);
        assert_eq!({ header.hit_thread_ids[0] }, 42);
        assert_eq!({ header.hit_addresses[1] }, 0xcafe_f00d);
        assert_eq!({ header.hit_thread_ids[1] }, 43);
    }

    #[test]
    fn test_record_hit_wraps_at_capacity() {
        let mut header = boxed_header();
        header.write_index = MAX_HITS as u32 - 1;
        let view = unsafe { HeaderView::new(&mut *header) };

        view.record_hit(1, 1);
        view.record_hit(2, 2);

        assert_eq!({ header.hit_addresses[MAX_HITS - 1] }, 1);
        assert_eq!({ header.hit_addresses[0] }, 2);
        assert_eq!({ header.write_index }, MAX_HITS as u32 + 1);
    }

    #[test]
    fn test_hit_count_never_exceeds_write_index() {
        let mut header = boxed_header();
        let view = unsafe { HeaderView::new(&mut *header) };

        for i in 0..100u64 {
            view.record_hit(i, i as u32);
            let hits = view.hit_count().load(Ordering::Relaxed);
            let produced = view.write_index().load(Ordering::Relaxed);
            assert!(hits <= produced);
        }
    }

    #[test]
    fn test_handler_tracking_balances() {
        let mut header = boxed_header();
        let view = unsafe { HeaderView::new(&mut *header) };

        view.enter_handler();
        view.enter_handler();
        assert_eq!({ header.active_handlers }, 2);

        view.leave_handler();
        view.leave_handler();
        assert_eq!({ header.active_handlers }, 0);
    }

    #[test]
    fn test_magic_validation() {
        let mut header = boxed_header();
        let view = unsafe { HeaderView::new(&mut *header) };
        assert!(!view.magic_valid());

        header.magic = SHARED_MEM_MAGIC;
        assert!(view.magic_valid());
    }
}
