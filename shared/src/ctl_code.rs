//! Helper functions for working with ctl codes.

#![allow(missing_docs)]

use crate::ctl_code;

/// Function-number base shared by all CrxShield control codes.
pub const IOCTL_BASE: u32 = 0x1337;

pub const IOCTL_CRXSHIELD_GET_VERSION: u32 = ctl_code!(IOCTL_BASE);
pub const IOCTL_CRXSHIELD_READ_MEMORY: u32 = ctl_code!(IOCTL_BASE + 0x1);
pub const IOCTL_CRXSHIELD_WRITE_MEMORY: u32 = ctl_code!(IOCTL_BASE + 0x2);
pub const IOCTL_CRXSHIELD_GET_PROCESS_BASE: u32 = ctl_code!(IOCTL_BASE + 0x3);
pub const IOCTL_CRXSHIELD_ENUM_CALLBACKS: u32 = ctl_code!(IOCTL_BASE + 0x4);
pub const IOCTL_CRXSHIELD_REMOVE_CALLBACK: u32 = ctl_code!(IOCTL_BASE + 0x5);

pub const METHOD_BUFFERED: u32 = 0;
pub const METHOD_IN_DIRECT: u32 = 1;
pub const METHOD_OUT_DIRECT: u32 = 2;
pub const METHOD_NEITHER: u32 = 3;

pub const FILE_ANY_ACCESS: u32 = 0;
pub const FILE_READ_ACCESS: u32 = 0x0001;
pub const FILE_WRITE_ACCESS: u32 = 0x0002;

pub const FILE_DEVICE_UNKNOWN: u32 = 0x00000022;

/// Creates a new ctl code from the parameters.
pub const fn ctl_code_fn(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    device_type << 16 | access << 14 | function << 2 | method
}

/// Creates a new ioctl code for the specified function number.
#[macro_export]
macro_rules! ctl_code {
    ($x:expr) => {
        $crate::ctl_code::ctl_code_fn(
            $crate::ctl_code::FILE_DEVICE_UNKNOWN,
            $x,
            $crate::ctl_code::METHOD_BUFFERED,
            $crate::ctl_code::FILE_ANY_ACCESS,
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctl_code() {
        assert_eq!(IOCTL_CRXSHIELD_GET_VERSION, 0x224cdc);
        assert_eq!(IOCTL_CRXSHIELD_READ_MEMORY, 0x224ce0);
        assert_eq!(IOCTL_CRXSHIELD_WRITE_MEMORY, 0x224ce4);
        assert_eq!(IOCTL_CRXSHIELD_GET_PROCESS_BASE, 0x224ce8);
        assert_eq!(IOCTL_CRXSHIELD_ENUM_CALLBACKS, 0x224cec);
        assert_eq!(IOCTL_CRXSHIELD_REMOVE_CALLBACK, 0x224cf0);
    }

    #[test]
    fn test_method_and_access_bits() {
        // METHOD_BUFFERED and FILE_ANY_ACCESS are both zero, so the raw code
        // is device type and (shifted) function number only.
        for (i, code) in [
            IOCTL_CRXSHIELD_GET_VERSION,
            IOCTL_CRXSHIELD_READ_MEMORY,
            IOCTL_CRXSHIELD_WRITE_MEMORY,
            IOCTL_CRXSHIELD_GET_PROCESS_BASE,
            IOCTL_CRXSHIELD_ENUM_CALLBACKS,
            IOCTL_CRXSHIELD_REMOVE_CALLBACK,
        ]
        .into_iter()
        .enumerate()
        {
            assert_eq!(code & 0x3, METHOD_BUFFERED);
            assert_eq!(code >> 16, FILE_DEVICE_UNKNOWN);
            assert_eq!((code >> 2) & 0x3fff, IOCTL_BASE + i as u32);
        }
    }
}
