//! Object-manager callback registry tool.
//!
//! Enumeration and removal both walk the object-callback list of the kernel.
//! The list head is not exported; resolving it needs a version-specific
//! signature scan, which this driver does not ship. Until a resolver is
//! provided, both operations fail cleanly with `not found`.
//!
//! Removal splices a node out by rewriting its neighbors' links without
//! taking the lock that guards the list. That races against the kernel's own
//! registration paths and is only acceptable on a quiet test box; treat it as
//! test-only tooling.

use core::ptr::NonNull;
use shared::protocol::CallbackEntry;
use snafu::prelude::*;
use winapi::shared::ntdef::{LIST_ENTRY, NTSTATUS, PVOID};
use winapi::shared::ntstatus::STATUS_NOT_FOUND;

/// In-memory layout of one registration node, interpreted through the known
/// offsets: the links first, then callback and context pointers.
#[repr(C)]
struct ObCallbackNode {
    entry: LIST_ENTRY,
    callback: PVOID,
    context: PVOID,
}

#[derive(Debug, Snafu)]
pub enum CallbackError {
    #[snafu(display("The callback list head could not be resolved on this kernel"))]
    ListHeadUnresolved,

    #[snafu(display("No registration with the requested callback address"))]
    CallbackNotFound,
}

impl CallbackError {
    pub fn to_ntstatus(&self) -> NTSTATUS {
        match self {
            Self::ListHeadUnresolved | Self::CallbackNotFound => STATUS_NOT_FOUND,
        }
    }
}

/// Resolves the address of the object-callback list head.
///
/// TODO: Implement the signature scan for the supported kernel builds. The
/// pattern differs per version, so the scan must key off the build number.
fn resolve_callback_list_head() -> Option<NonNull<LIST_ENTRY>> {
    None
}

/// Walks the registration list and snapshots up to `out.len()` entries.
/// Returns the number of entries written.
pub fn enum_callbacks(out: &mut [CallbackEntry]) -> Result<u32, CallbackError> {
    let head = resolve_callback_list_head().context(ListHeadUnresolvedSnafu)?;

    let mut count = 0usize;
    let mut current = unsafe { head.as_ref().Flink };

    while current != head.as_ptr() && count < out.len() {
        let node = current as *const ObCallbackNode;

        out[count] = CallbackEntry {
            callback_address: unsafe { (*node).callback } as u64,
            context: unsafe { (*node).context } as u64,
        };

        count += 1;
        current = unsafe { (*current).Flink };
    }

    Ok(count as u32)
}

/// Unlinks the first registration whose callback equals `callback_address`.
///
/// Unsynchronized unlink; see the module docs.
pub fn remove_callback(callback_address: u64) -> Result<(), CallbackError> {
    let head = resolve_callback_list_head().context(ListHeadUnresolvedSnafu)?;

    let mut current = unsafe { head.as_ref().Flink };

    while current != head.as_ptr() {
        let node = current as *const ObCallbackNode;

        if unsafe { (*node).callback } as u64 == callback_address {
            unsafe {
                (*(*current).Flink).Blink = (*current).Blink;
                (*(*current).Blink).Flink = (*current).Flink;
            }
            return Ok(());
        }

        current = unsafe { (*current).Flink };
    }

    CallbackNotFoundSnafu.fail()
}
