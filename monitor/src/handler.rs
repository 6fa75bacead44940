//! First-chance vectored exception handler.
//!
//! Three cases, in strict precedence: the post-access single-step that
//! re-arms the guard page, guard-page faults on the watched page, and
//! hardware debug faults for the configured slot. Everything else is passed
//! on with `EXCEPTION_CONTINUE_SEARCH`.
//!
//! The handler runs inside exception dispatch: it never takes locks, never
//! allocates and never logs. Shared-memory access is bracketed by a
//! commit-state check and the magic sentinel instead of a structured
//! exception guard, and the teardown protocol guarantees the region stays
//! mapped while `active_handlers` is nonzero.

use crate::transport::{region_committed, HeaderView};
use crate::{INITIALIZED, SHARED};
use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};
use winapi::um::memoryapi::VirtualProtect;
use winapi::um::processthreadsapi::GetCurrentThreadId;
use winapi::um::sysinfoapi::GetTickCount;
use winapi::um::winnt::{CONTEXT, EXCEPTION_POINTERS, EXCEPTION_RECORD, PAGE_GUARD};

const STATUS_GUARD_PAGE_VIOLATION: u32 = 0x8000_0001;
const STATUS_SINGLE_STEP: u32 = 0x8000_0004;
const STATUS_WX86_SINGLE_STEP: u32 = 0x4000_001e;

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

const TRAP_FLAG: u32 = 0x100;
const RESUME_FLAG: u32 = 0x1_0000;

/// The fault address reports where the access started, not how wide it was;
/// assume the widest plain load/store.
const ASSUMED_ACCESS_SIZE: u64 = 8;

/// Minimum spacing between recorded hardware hits. A tight loop over the
/// watched address would otherwise starve the host process in exception
/// dispatch.
const RATE_LIMIT_MS: u32 = 5;

// Process-wide; parallel writers within the window lose their hits.
static LAST_HIT_TIME_MS: AtomicU32 = AtomicU32::new(0);

thread_local! {
    /// Set between consuming a guard-page fault and the single-step that
    /// re-arms the guard on this thread.
    static PENDING_GUARD_REAPPLY: Cell<bool> = const { Cell::new(false) };
}

/// Balances `active_handlers` on every return path.
struct HandlerGuard(HeaderView);

impl HandlerGuard {
    fn enter(view: HeaderView) -> Self {
        view.enter_handler();
        Self(view)
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.0.leave_handler();
    }
}

/// Swallowing is only safe for guard-page faults, where the guard bit is
/// already consumed; everything else keeps searching.
fn bail(code: u32) -> i32 {
    if code == STATUS_GUARD_PAGE_VIOLATION {
        EXCEPTION_CONTINUE_EXECUTION
    } else {
        EXCEPTION_CONTINUE_SEARCH
    }
}

pub unsafe extern "system" fn vectored_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
    let record = &*(*info).ExceptionRecord;
    let code = record.ExceptionCode;
    let ctx = &mut *(*info).ContextRecord;

    // The pending single-step is serviced first, before any shutdown or
    // validity check: if the trap flag stays set the thread faults forever.
    // This branch deliberately skips the handler tracking so it stays safe
    // after shutdown is latched.
    if (code == STATUS_SINGLE_STEP || code == STATUS_WX86_SINGLE_STEP)
        && PENDING_GUARD_REAPPLY.with(|pending| pending.replace(false))
    {
        return reapply_guard(ctx);
    }

    let header = SHARED.load(Ordering::Acquire);
    if !INITIALIZED.load(Ordering::Relaxed) || header.is_null() {
        return bail(code);
    }

    if !region_committed(header) {
        return bail(code);
    }

    let view = HeaderView::new(header);
    let _guard = HandlerGuard::enter(view);

    if !view.magic_valid() || view.shutdown_requested().load(Ordering::Relaxed) != 0 {
        return bail(code);
    }

    if code == STATUS_GUARD_PAGE_VIOLATION {
        return handle_guard_fault(record, ctx, view);
    }

    if view.active().load(Ordering::Relaxed) == 0 {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    handle_debug_fault(ctx, view)
}

fn reapply_guard(ctx: &mut CONTEXT) -> i32 {
    ctx.EFlags &= !TRAP_FLAG;

    let header = SHARED.load(Ordering::Acquire);
    if INITIALIZED.load(Ordering::Relaxed) && !header.is_null() && region_committed(header) {
        let view = unsafe { HeaderView::new(header) };

        if view.magic_valid()
            && view.shutdown_requested().load(Ordering::Relaxed) == 0
            && view.active().load(Ordering::Relaxed) != 0
            && view.use_guard().load(Ordering::Relaxed) != 0
        {
            let page_base = view.page_base();
            let page_size = view.page_size().load(Ordering::Relaxed);
            let protection = view.orig_protection().load(Ordering::Relaxed);

            if page_base != 0 && page_size != 0 && protection != 0 {
                let mut old_protection = 0;
                unsafe {
                    VirtualProtect(
                        page_base as usize as _,
                        page_size as usize,
                        protection | PAGE_GUARD,
                        &mut old_protection,
                    );
                }
            }
        }
    }

    EXCEPTION_CONTINUE_EXECUTION
}

/// Two half-open ranges overlap iff each starts before the other ends.
fn ranges_overlap(a: u64, a_len: u64, b: u64, b_len: u64) -> bool {
    a < b.wrapping_add(b_len) && b < a.wrapping_add(a_len)
}

fn handle_guard_fault(record: &EXCEPTION_RECORD, ctx: &mut CONTEXT, view: HeaderView) -> i32 {
    // Index 0 is the read/write flag, index 1 the accessed address.
    let fault_address = record.ExceptionInformation[1] as u64;

    let page_base = view.page_base();
    let page_size = view.page_size().load(Ordering::Relaxed) as u64;

    // Not configured yet. The guard bit is consumed regardless, so the only
    // safe disposition is to let the access proceed unrecorded.
    if page_base == 0 || page_size == 0 {
        return EXCEPTION_CONTINUE_EXECUTION;
    }

    // Faults outside the watched page belong to someone else (stack growth
    // uses guard pages too).
    if fault_address < page_base || fault_address >= page_base + page_size {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    // Our page, so the fault is ours to consume even when idle.
    if view.active().load(Ordering::Relaxed) == 0 || view.use_guard().load(Ordering::Relaxed) == 0 {
        return EXCEPTION_CONTINUE_EXECUTION;
    }

    let watch_address = view.watch_address();
    let watch_size = match view.bp_size().load(Ordering::Relaxed) {
        0 => 4,
        size => size,
    } as u64;

    if ranges_overlap(fault_address, ASSUMED_ACCESS_SIZE, watch_address, watch_size) {
        view.record_hit(ctx.Rip, unsafe { GetCurrentThreadId() });
    }

    // Single-step over the retried instruction, then re-arm the guard in the
    // single-step branch. This must happen for every access to the page, not
    // just watched ones, or the guard would stay disarmed.
    ctx.EFlags |= TRAP_FLAG;
    PENDING_GUARD_REAPPLY.with(|pending| pending.set(true));

    EXCEPTION_CONTINUE_EXECUTION
}

fn handle_debug_fault(ctx: &mut CONTEXT, view: HeaderView) -> i32 {
    // DR6 bits 0..=3 report which slot fired.
    if ctx.Dr6 & 0xf == 0 {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let slot = view.bp_slot().load(Ordering::Relaxed).min(3);
    if ctx.Dr6 & (1 << slot) == 0 {
        // A different slot fired; not ours to consume.
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let now = unsafe { GetTickCount() };
    let last = LAST_HIT_TIME_MS.load(Ordering::Relaxed);
    if now.wrapping_sub(last) < RATE_LIMIT_MS {
        // Skip the record but still acknowledge the fault, or the retried
        // instruction faults again immediately.
        ctx.Dr6 = 0;
        ctx.EFlags |= RESUME_FLAG;
        return EXCEPTION_CONTINUE_EXECUTION;
    }
    LAST_HIT_TIME_MS.swap(now, Ordering::Relaxed);

    view.record_hit(ctx.Rip, unsafe { GetCurrentThreadId() });

    ctx.Dr6 = 0;
    ctx.EFlags |= RESUME_FLAG;

    EXCEPTION_CONTINUE_EXECUTION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_inside_watch() {
        // 4-byte watch at 0x1000, 8-byte assumed access at 0x0ffc..0x1004.
        assert!(ranges_overlap(0x0ffc, 8, 0x1000, 4));
    }

    #[test]
    fn test_overlap_exact() {
        assert!(ranges_overlap(0x1000, 8, 0x1000, 1));
    }

    #[test]
    fn test_no_overlap_below() {
        assert!(!ranges_overlap(0x0ff0, 8, 0x1000, 4));
    }

    #[test]
    fn test_no_overlap_above() {
        assert!(!ranges_overlap(0x1004, 8, 0x1000, 4));
    }

    #[test]
    fn test_overlap_is_half_open() {
        // Access ends exactly where the watch begins: no overlap.
        assert!(!ranges_overlap(0x0ff8, 8, 0x1000, 4));
        // One byte further does overlap.
        assert!(ranges_overlap(0x0ff9, 8, 0x1000, 4));
    }
}
