//! Layout of the shared region used by the memory-access monitor.
//!
//! The controller creates a named file mapping, the monitor DLL maps the same
//! region inside the target and both sides address it through this header.
//! The header is exactly 80 bytes and is followed by two parallel
//! fixed-capacity arrays (the hit ring) plus one trailing event-handle slot.
//!
//! Every field the two processes race on is 32 or 64 bits wide and only ever
//! touched through atomic operations; the layout keeps those fields naturally
//! aligned even though the struct is packed.

use core::mem::{offset_of, size_of};

/// "VEHD" sentinel. Written once at creation; a mismatch means the region is
/// gone or torn and the handler must bail.
pub const SHARED_MEM_MAGIC: u32 = 0x5645_4844;

/// Capacity of the hit ring. Overwrites under sustained overflow are data
/// loss by design.
pub const MAX_HITS: usize = 1024;

/// Breakpoint fires on writes only.
pub const BP_TYPE_WRITE: u32 = 1;
/// Breakpoint fires on reads and writes.
pub const BP_TYPE_READ_WRITE: u32 = 3;

/// Shared-region header plus the hit ring.
///
/// `write_index` is monotonic; the producer slot is `index % MAX_HITS`.
/// `read_index` belongs to the controller alone.
#[repr(C, packed)]
pub struct SharedHeader {
    pub magic: u32,
    pub active: u32,
    pub hit_count: u32,
    pub watch_address: u64,
    pub bp_size: u32,
    pub bp_type: u32,
    pub bp_slot: u32,
    pub write_index: u32,
    pub read_index: u32,
    pub use_guard: u32,
    /// Superseded by the monitor's per-thread latch; kept for layout.
    pub need_reapply: u32,
    pub page_base: u64,
    pub page_size: u32,
    pub orig_protection: u32,
    pub active_handlers: u32,
    pub shutdown_requested: u32,
    pub reserved: [u32; 2],
    pub hit_addresses: [u64; MAX_HITS],
    pub hit_thread_ids: [u32; MAX_HITS],
    /// Duplicated stop-event handle slot; unused by the handler, kept for
    /// layout.
    pub stop_event: u64,
}

/// Size of the fixed header that precedes the hit arrays.
pub const HEADER_SIZE: usize = 80;

const_assert_eq!(offset_of!(SharedHeader, hit_addresses), HEADER_SIZE);
const_assert_eq!(
    offset_of!(SharedHeader, hit_thread_ids),
    HEADER_SIZE + MAX_HITS * 8
);
const_assert_eq!(
    size_of::<SharedHeader>(),
    HEADER_SIZE + MAX_HITS * 8 + MAX_HITS * 4 + 8
);

impl SharedHeader {
    /// Producer slot for a monotonic ring index.
    pub const fn slot(index: u32) -> usize {
        index as usize % MAX_HITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_fields_precede_ring() {
        assert_eq!(offset_of!(SharedHeader, magic), 0);
        assert_eq!(offset_of!(SharedHeader, active), 4);
        assert_eq!(offset_of!(SharedHeader, hit_count), 8);
        assert_eq!(offset_of!(SharedHeader, watch_address), 12);
        assert_eq!(offset_of!(SharedHeader, write_index), 32);
        assert_eq!(offset_of!(SharedHeader, read_index), 36);
        assert_eq!(offset_of!(SharedHeader, page_base), 48);
        assert_eq!(offset_of!(SharedHeader, active_handlers), 64);
        assert_eq!(offset_of!(SharedHeader, shutdown_requested), 68);
    }

    #[test]
    fn test_slot_wraps() {
        assert_eq!(SharedHeader::slot(0), 0);
        assert_eq!(SharedHeader::slot(1023), 1023);
        assert_eq!(SharedHeader::slot(1024), 0);
        assert_eq!(SharedHeader::slot(u32::MAX), (u32::MAX as usize) % MAX_HITS);
    }

    #[test]
    fn test_magic_spells_vehd() {
        assert_eq!(&SHARED_MEM_MAGIC.to_be_bytes(), b"VEHD");
    }
}
