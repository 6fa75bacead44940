//! Non-paged pool allocator for the gateway.
//!
//! Every allocation is tagged so pool tooling can attribute it to this
//! driver; rather than a second hard-coded literal, the tag is the `CrxS`
//! run of the decoded device name, so renaming the device renames the tag
//! with it. A live-allocation counter feeds the unload-time leak check and
//! the panic report.

use crate::nt::include::{ExAllocatePoolWithTag, ExFreePool, NON_PAGED_POOL};
use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicUsize, Ordering};
use shared::obf::{DEVICE_NAME_OBF, XOR_KEY};

/// The four characters after `\Device\` in the decoded device name.
const POOL_TAG: u32 = u32::from_le_bytes([
    DEVICE_NAME_OBF[8] ^ XOR_KEY,
    DEVICE_NAME_OBF[9] ^ XOR_KEY,
    DEVICE_NAME_OBF[10] ^ XOR_KEY,
    DEVICE_NAME_OBF[11] ^ XOR_KEY,
]);

static LIVE_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

/// Allocations not yet returned to the pool. Nonzero at unload means some
/// request path leaked.
pub fn live_allocations() -> usize {
    LIVE_ALLOCATIONS.load(Ordering::Relaxed)
}

/// Tagged non-paged pool behind `alloc`.
pub struct GatewayAlloc;

unsafe impl GlobalAlloc for GatewayAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let pool = ExAllocatePoolWithTag(NON_PAGED_POOL, layout.size(), POOL_TAG);

        // Exhaustion surfaces through `handle_alloc_error` below; callers
        // that can degrade (fallible lookups, logging) keep running.
        if !pool.is_null() {
            LIVE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }

        pool as _
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        LIVE_ALLOCATIONS.fetch_sub(1, Ordering::Relaxed);
        ExFreePool(ptr as _);
    }
}

#[alloc_error_handler]
fn out_of_pool(layout: Layout) -> ! {
    panic!("non-paged pool exhausted requesting {} bytes", layout.size());
}
