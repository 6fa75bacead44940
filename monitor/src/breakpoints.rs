//! Debug-register management across every thread of the process.
//!
//! Arming walks a thread snapshot and rewrites each thread's DR state with a
//! debug-registers-only context; newly created threads are covered by the
//! thread-attach hook, which applies the active configuration from inside
//! the new thread itself.

use crate::transport::{region_committed, HeaderView};
use crate::SHARED;
use core::mem::size_of;
use core::sync::atomic::Ordering;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::processthreadsapi::{
    GetCurrentProcessId, GetCurrentThread, GetCurrentThreadId, GetThreadContext, OpenThread,
    ResumeThread, SetThreadContext, SuspendThread,
};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use winapi::um::winnt::{
    CONTEXT, CONTEXT_DEBUG_REGISTERS, HANDLE, THREAD_GET_CONTEXT, THREAD_SET_CONTEXT,
    THREAD_SUSPEND_RESUME,
};

/// DR7 length encoding. 8-byte watchpoints are only valid on 64-bit.
fn size_code(size: u32) -> u64 {
    match size {
        1 => 0,
        2 => 1,
        4 => 3,
        8 => 2,
        _ => 3,
    }
}

/// Rewrites the DR7 fields of one slot.
///
/// Layout per slot `s`: local-enable at bit `2s`, condition at bits
/// `16+4s..=17+4s`, length at bits `18+4s..=19+4s`. Both enable and disable
/// clear all three fields first.
pub fn dr7_configure(dr7: u64, slot: usize, bp_type: u32, size: u32, enable: bool) -> u64 {
    let enable_bit = slot * 2;
    let condition_bits = 16 + slot * 4;
    let length_bits = 18 + slot * 4;

    let mut dr7 = dr7;
    dr7 &= !(3u64 << enable_bit);
    dr7 &= !(3u64 << condition_bits);
    dr7 &= !(3u64 << length_bits);

    if enable {
        dr7 |= 1u64 << enable_bit;
        dr7 |= (bp_type as u64 & 3) << condition_bits;
        dr7 |= size_code(size) << length_bits;
    }

    dr7
}

/// Applies one slot configuration to a captured context.
pub fn apply_to_context(
    ctx: &mut CONTEXT,
    slot: usize,
    address: u64,
    bp_type: u32,
    size: u32,
    enable: bool,
) {
    let address = if enable { address } else { 0 };
    match slot {
        0 => ctx.Dr0 = address,
        1 => ctx.Dr1 = address,
        2 => ctx.Dr2 = address,
        _ => ctx.Dr3 = address,
    }

    ctx.Dr7 = dr7_configure(ctx.Dr7, slot, bp_type, size, enable);
    ctx.Dr6 = 0;
}

struct HandleGuard(HANDLE);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// Reconfigures one slot on every thread of the current process.
///
/// Threads that cannot be opened are skipped; a thread whose context cannot
/// be read or written counts as a failure but does not stop the sweep. The
/// return value is true only if every reachable thread was updated.
fn fanout(slot: usize, address: u64, bp_type: u32, size: u32, enable: bool) -> bool {
    let process_id = unsafe { GetCurrentProcessId() };
    let current_thread_id = unsafe { GetCurrentThreadId() };

    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        return false;
    }
    let snapshot = HandleGuard(snapshot);

    let mut entry: THREADENTRY32 = unsafe { core::mem::zeroed() };
    entry.dwSize = size_of::<THREADENTRY32>() as u32;

    if unsafe { Thread32First(snapshot.0, &mut entry) } == 0 {
        return false;
    }

    let mut all_ok = true;
    loop {
        if entry.th32OwnerProcessID == process_id
            && !update_thread(
                entry.th32ThreadID,
                current_thread_id,
                slot,
                address,
                bp_type,
                size,
                enable,
            )
        {
            all_ok = false;
        }

        entry.dwSize = size_of::<THREADENTRY32>() as u32;
        if unsafe { Thread32Next(snapshot.0, &mut entry) } == 0 {
            break;
        }
    }

    all_ok
}

fn update_thread(
    thread_id: u32,
    current_thread_id: u32,
    slot: usize,
    address: u64,
    bp_type: u32,
    size: u32,
    enable: bool,
) -> bool {
    let handle = unsafe {
        OpenThread(
            THREAD_GET_CONTEXT | THREAD_SET_CONTEXT | THREAD_SUSPEND_RESUME,
            0,
            thread_id,
        )
    };
    if handle.is_null() {
        // Thread may already be gone; nothing to update.
        return true;
    }
    let handle = HandleGuard(handle);

    // The current thread cannot be suspended while it runs this code.
    let suspended = thread_id != current_thread_id;
    if suspended {
        unsafe { SuspendThread(handle.0) };
    }

    let mut ctx: CONTEXT = unsafe { core::mem::zeroed() };
    ctx.ContextFlags = CONTEXT_DEBUG_REGISTERS;

    let ok = if unsafe { GetThreadContext(handle.0, &mut ctx) } != 0 {
        apply_to_context(&mut ctx, slot, address, bp_type, size, enable);
        unsafe { SetThreadContext(handle.0, &ctx) != 0 }
    } else {
        false
    };

    if suspended {
        unsafe { ResumeThread(handle.0) };
    }

    ok
}

pub fn set_on_all_threads(slot: usize, address: u64, bp_type: u32, size: u32) -> bool {
    fanout(slot, address, bp_type, size, true)
}

pub fn clear_on_all_threads(slot: usize) -> bool {
    fanout(slot, 0, 0, 0, false)
}

/// Thread-attach path: arms the active configuration on the calling thread.
/// Runs inside the new thread, so its own context can be rewritten directly.
pub fn apply_to_current_thread() {
    let header = SHARED.load(Ordering::Acquire);
    if header.is_null() || !region_committed(header) {
        return;
    }

    let view = unsafe { HeaderView::new(header) };
    if !view.magic_valid() || view.active().load(Ordering::Relaxed) == 0 {
        return;
    }

    let slot = view.bp_slot().load(Ordering::Relaxed).min(3) as usize;

    let mut ctx: CONTEXT = unsafe { core::mem::zeroed() };
    ctx.ContextFlags = CONTEXT_DEBUG_REGISTERS;

    unsafe {
        let thread = GetCurrentThread();
        if GetThreadContext(thread, &mut ctx) == 0 {
            return;
        }

        apply_to_context(
            &mut ctx,
            slot,
            view.watch_address(),
            view.bp_type().load(Ordering::Relaxed),
            view.bp_size().load(Ordering::Relaxed),
            true,
        );

        SetThreadContext(thread, &ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dr7_slot0_write_dword() {
        // L0 set, RW0 = write-only, LEN0 = 4 bytes.
        assert_eq!(dr7_configure(0, 0, 1, 4, true), 0x000d_0001);
    }

    #[test]
    fn test_dr7_slot3_readwrite_qword() {
        // L3 at bit 6, RW3 = 0b11 at bits 28..=29, LEN3 = 0b10 at bits 30..=31.
        assert_eq!(dr7_configure(0, 3, 3, 8, true), 0xb000_0040);
    }

    #[test]
    fn test_dr7_disable_round_trips() {
        let armed = dr7_configure(0, 2, 3, 2, true);
        assert_ne!(armed, 0);
        assert_eq!(dr7_configure(armed, 2, 0, 0, false), 0);
    }

    #[test]
    fn test_dr7_leaves_other_slots_alone() {
        let slot0 = dr7_configure(0, 0, 1, 4, true);
        let both = dr7_configure(slot0, 1, 3, 1, true);

        assert_eq!(dr7_configure(both, 1, 0, 0, false), slot0);
    }

    #[test]
    fn test_size_codes() {
        assert_eq!(size_code(1), 0);
        assert_eq!(size_code(2), 1);
        assert_eq!(size_code(4), 3);
        assert_eq!(size_code(8), 2);
        // Unknown widths fall back to a dword watch.
        assert_eq!(size_code(3), 3);
    }
}
