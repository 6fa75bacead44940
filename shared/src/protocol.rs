//! Packed request records for the ioctl surface.
//!
//! These travel through a single buffered-I/O system buffer, so the layout is
//! the contract: little-endian fields, `#[repr(C, packed)]`, no implicit
//! padding. A `WriteRequest` is immediately followed by its payload bytes; an
//! `EnumCallbacksRequest` is immediately followed by `entry_count` packed
//! [`CallbackEntry`] records on the way out.

use core::mem::size_of;

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_BUILD: u32 = 0;

/// Reply of `IOCTL_CRXSHIELD_GET_VERSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

/// Input of `IOCTL_CRXSHIELD_READ_MEMORY`. The reply is `size` raw bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct ReadRequest {
    pub process_id: u32,
    pub address: u64,
    pub size: u32,
}

/// Input header of `IOCTL_CRXSHIELD_WRITE_MEMORY`; `size` payload bytes
/// follow directly after this record.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct WriteRequest {
    pub process_id: u32,
    pub address: u64,
    pub size: u32,
}

/// In/out record of `IOCTL_CRXSHIELD_GET_PROCESS_BASE`. `process_id` is
/// caller-supplied, `base_address` is filled in by the driver.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct ProcessBaseRequest {
    pub process_id: u32,
    pub base_address: u64,
}

/// One snapshotted object-callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct CallbackEntry {
    pub callback_address: u64,
    pub context: u64,
}

/// In/out header of `IOCTL_CRXSHIELD_ENUM_CALLBACKS`.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct EnumCallbacksRequest {
    pub max_entries: u32,
    pub entry_count: u32,
}

/// Input of `IOCTL_CRXSHIELD_REMOVE_CALLBACK`.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct RemoveCallbackRequest {
    pub callback_address: u64,
}

const_assert_eq!(size_of::<VersionInfo>(), 12);
const_assert_eq!(size_of::<ReadRequest>(), 16);
const_assert_eq!(size_of::<WriteRequest>(), 16);
const_assert_eq!(size_of::<ProcessBaseRequest>(), 12);
const_assert_eq!(size_of::<CallbackEntry>(), 16);
const_assert_eq!(size_of::<EnumCallbacksRequest>(), 8);
const_assert_eq!(size_of::<RemoveCallbackRequest>(), 8);

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn test_field_offsets_are_packed() {
        assert_eq!(offset_of!(ReadRequest, process_id), 0);
        assert_eq!(offset_of!(ReadRequest, address), 4);
        assert_eq!(offset_of!(ReadRequest, size), 12);

        assert_eq!(offset_of!(ProcessBaseRequest, base_address), 4);
        assert_eq!(offset_of!(CallbackEntry, context), 8);
    }

    #[test]
    fn test_version_reply() {
        let reply = VersionInfo {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            build: VERSION_BUILD,
        };

        assert_eq!(
            reply,
            VersionInfo {
                major: 1,
                minor: 1,
                build: 0
            }
        );
    }
}
