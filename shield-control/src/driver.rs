//! Ioctl client for the kernel gateway.
//!
//! Opens the gateway device through its DOS name and wraps each control code
//! in a typed call. All requests use buffered I/O; the packed records from
//! `shared::protocol` are marshalled into plain byte buffers here.

use crate::ControllerError;
use ntapi::ntioapi::{NtOpenFile, FILE_NON_DIRECTORY_FILE};
use ntapi::ntrtl::RtlInitUnicodeString;
use shared::ctl_code::{
    IOCTL_CRXSHIELD_ENUM_CALLBACKS, IOCTL_CRXSHIELD_GET_PROCESS_BASE,
    IOCTL_CRXSHIELD_GET_VERSION, IOCTL_CRXSHIELD_READ_MEMORY, IOCTL_CRXSHIELD_REMOVE_CALLBACK,
    IOCTL_CRXSHIELD_WRITE_MEMORY,
};
use shared::obf;
use shared::protocol::{
    CallbackEntry, EnumCallbacksRequest, ProcessBaseRequest, ReadRequest, RemoveCallbackRequest,
    VersionInfo, WriteRequest,
};
use std::io;
use std::mem::{size_of, MaybeUninit};
use std::ptr;
use widestring::U16CString;
use winapi::shared::ntdef::{
    InitializeObjectAttributes, HANDLE, OBJECT_ATTRIBUTES, OBJ_CASE_INSENSITIVE,
};
use winapi::um::handleapi::CloseHandle;
use winapi::um::ioapiset::DeviceIoControl;
use winapi::um::winnt::{FILE_GENERIC_READ, FILE_GENERIC_WRITE, FILE_SHARE_READ, FILE_SHARE_WRITE};

/// Reinterprets a packed record as its wire bytes.
fn as_bytes<T>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
}

/// NT path of the gateway device, derived from the DOS symlink name the
/// driver registers.
fn device_path() -> Result<U16CString, ControllerError> {
    let mut wide = [0u16; 32];
    let len = obf::decode_wide(&obf::SYM_LINK_NAME_OBF, &mut wide)
        .ok_or(ControllerError::BadDeviceName)?;

    let dos_name =
        String::from_utf16(&wide[..len]).map_err(|_| ControllerError::BadDeviceName)?;
    let nt_path = dos_name.replace("\\DosDevices", "\\??");

    U16CString::from_str(&nt_path).map_err(|_| ControllerError::BadDeviceName)
}

#[derive(Debug)]
pub struct DriverController {
    handle: HANDLE,
}

impl DriverController {
    /// Opens a handle to the gateway device.
    pub fn connect() -> Result<Self, ControllerError> {
        let driver = device_path()?;

        let mut path = MaybeUninit::uninit();
        unsafe { RtlInitUnicodeString(path.as_mut_ptr(), driver.as_ptr()) };

        let mut object_attributes = MaybeUninit::<OBJECT_ATTRIBUTES>::uninit();
        unsafe {
            InitializeObjectAttributes(
                object_attributes.as_mut_ptr(),
                path.as_mut_ptr(),
                OBJ_CASE_INSENSITIVE,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };

        let mut handle = MaybeUninit::uninit();
        let mut io_status_block = MaybeUninit::uninit();
        let status = unsafe {
            NtOpenFile(
                handle.as_mut_ptr(),
                FILE_GENERIC_READ | FILE_GENERIC_WRITE,
                object_attributes.as_mut_ptr(),
                io_status_block.as_mut_ptr(),
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                FILE_NON_DIRECTORY_FILE,
            )
        };

        if status != 0 {
            return Err(ControllerError::DeviceUnavailable { status });
        }

        Ok(Self {
            handle: unsafe { handle.assume_init() },
        })
    }

    /// One buffered ioctl round trip; returns the reply byte count.
    fn call(&self, code: u32, input: &[u8], output: &mut [u8]) -> Result<u32, ControllerError> {
        let mut bytes_returned = 0u32;

        let ok = unsafe {
            DeviceIoControl(
                self.handle,
                code,
                input.as_ptr() as *mut _,
                input.len() as u32,
                output.as_mut_ptr() as *mut _,
                output.len() as u32,
                &mut bytes_returned,
                ptr::null_mut(),
            )
        };

        if ok == 0 {
            return Err(ControllerError::Ioctl {
                code,
                source: io::Error::last_os_error(),
            });
        }

        Ok(bytes_returned)
    }

    pub fn version(&self) -> Result<VersionInfo, ControllerError> {
        let mut reply = [0u8; size_of::<VersionInfo>()];

        let bytes = self.call(IOCTL_CRXSHIELD_GET_VERSION, &[0u8; size_of::<VersionInfo>()], &mut reply)?;
        if bytes as usize != size_of::<VersionInfo>() {
            return Err(ControllerError::ShortReply {
                expected: size_of::<VersionInfo>(),
                got: bytes as usize,
            });
        }

        Ok(unsafe { ptr::read_unaligned(reply.as_ptr() as *const VersionInfo) })
    }

    /// Reads `size` bytes of target memory. The gateway guarantees a full
    /// read on success; anything shorter is an error here.
    pub fn read_memory(
        &self,
        process_id: u32,
        address: u64,
        size: u32,
    ) -> Result<Vec<u8>, ControllerError> {
        let request = ReadRequest {
            process_id,
            address,
            size,
        };
        let mut output = vec![0u8; size as usize];

        let bytes = self.call(IOCTL_CRXSHIELD_READ_MEMORY, as_bytes(&request), &mut output)?;
        if bytes != size {
            return Err(ControllerError::ShortReply {
                expected: size as usize,
                got: bytes as usize,
            });
        }

        Ok(output)
    }

    /// Writes `data` into target memory; read-only pages are handled by the
    /// gateway's remap fallback.
    pub fn write_memory(
        &self,
        process_id: u32,
        address: u64,
        data: &[u8],
    ) -> Result<(), ControllerError> {
        let request = WriteRequest {
            process_id,
            address,
            size: data.len() as u32,
        };

        let mut input = Vec::with_capacity(size_of::<WriteRequest>() + data.len());
        input.extend_from_slice(as_bytes(&request));
        input.extend_from_slice(data);

        let bytes = self.call(IOCTL_CRXSHIELD_WRITE_MEMORY, &input, &mut [])?;
        if bytes as usize != data.len() {
            return Err(ControllerError::ShortReply {
                expected: data.len(),
                got: bytes as usize,
            });
        }

        Ok(())
    }

    pub fn process_base(&self, process_id: u32) -> Result<u64, ControllerError> {
        let request = ProcessBaseRequest {
            process_id,
            base_address: 0,
        };
        let mut reply = [0u8; size_of::<ProcessBaseRequest>()];

        self.call(IOCTL_CRXSHIELD_GET_PROCESS_BASE, as_bytes(&request), &mut reply)?;

        let reply = unsafe { ptr::read_unaligned(reply.as_ptr() as *const ProcessBaseRequest) };
        Ok(reply.base_address)
    }

    /// Snapshots up to `max_entries` object-callback registrations.
    pub fn enum_callbacks(
        &self,
        max_entries: u32,
    ) -> Result<Vec<CallbackEntry>, ControllerError> {
        let request = EnumCallbacksRequest {
            max_entries,
            entry_count: 0,
        };
        let mut reply = vec![
            0u8;
            size_of::<EnumCallbacksRequest>()
                + max_entries as usize * size_of::<CallbackEntry>()
        ];

        self.call(IOCTL_CRXSHIELD_ENUM_CALLBACKS, as_bytes(&request), &mut reply)?;

        let header = unsafe { ptr::read_unaligned(reply.as_ptr() as *const EnumCallbacksRequest) };
        let count = (header.entry_count as usize).min(max_entries as usize);

        let mut entries = Vec::with_capacity(count);
        for index in 0..count {
            let offset = size_of::<EnumCallbacksRequest>() + index * size_of::<CallbackEntry>();
            entries.push(unsafe {
                ptr::read_unaligned(reply[offset..].as_ptr() as *const CallbackEntry)
            });
        }

        Ok(entries)
    }

    pub fn remove_callback(&self, callback_address: u64) -> Result<(), ControllerError> {
        let request = RemoveCallbackRequest { callback_address };

        self.call(IOCTL_CRXSHIELD_REMOVE_CALLBACK, as_bytes(&request), &mut [])?;

        Ok(())
    }
}

impl Drop for DriverController {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}
