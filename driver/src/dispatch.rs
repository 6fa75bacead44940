//! IRP dispatch: thin create/close handlers and the device-control router.
//!
//! The device uses buffered I/O, so every request arrives in a single system
//! buffer shared between input and output. Each handler validates lengths
//! before touching the payload and reports the number of meaningful bytes it
//! produced through `IoStatus.Information`.

use crate::assert_paged_code;
use crate::nt::include::{
    IoGetCurrentIrpStackLocation, IofCompleteRequest, DEVICE_OBJECT, IO_NO_INCREMENT, IRP,
};
use crate::{callbacks, memory};
use core::mem::size_of;
use core::ptr;
use shared::ctl_code::{
    IOCTL_CRXSHIELD_ENUM_CALLBACKS, IOCTL_CRXSHIELD_GET_PROCESS_BASE,
    IOCTL_CRXSHIELD_GET_VERSION, IOCTL_CRXSHIELD_READ_MEMORY, IOCTL_CRXSHIELD_REMOVE_CALLBACK,
    IOCTL_CRXSHIELD_WRITE_MEMORY,
};
use shared::protocol::{
    CallbackEntry, EnumCallbacksRequest, ProcessBaseRequest, ReadRequest, RemoveCallbackRequest,
    VersionInfo, WriteRequest, VERSION_BUILD, VERSION_MAJOR, VERSION_MINOR,
};
use winapi::shared::ntdef::NTSTATUS;
use winapi::shared::ntstatus::{
    STATUS_BUFFER_TOO_SMALL, STATUS_INVALID_DEVICE_REQUEST, STATUS_INVALID_PARAMETER,
    STATUS_SUCCESS,
};

/// Completes the IRP and returns the same status, so handlers can
/// `return complete(..)`.
unsafe fn complete(irp: *mut IRP, status: NTSTATUS, information: usize) -> NTSTATUS {
    (*irp).IoStatus.Status = status;
    (*irp).IoStatus.Information = information;
    IofCompleteRequest(irp, IO_NO_INCREMENT);

    status
}

/// `IRP_MJ_CREATE` / `IRP_MJ_CLOSE`. No per-handle state.
pub unsafe extern "system" fn create_close(_device: *mut DEVICE_OBJECT, irp: *mut IRP) -> NTSTATUS {
    complete(irp, STATUS_SUCCESS, 0)
}

/// `IRP_MJ_DEVICE_CONTROL` router.
pub unsafe extern "system" fn device_control(
    _device: *mut DEVICE_OBJECT,
    irp: *mut IRP,
) -> NTSTATUS {
    assert_paged_code!();

    let stack = IoGetCurrentIrpStackLocation(irp);

    let code = (*stack).Parameters.IoControlCode;
    let in_len = (*stack).Parameters.InputBufferLength as usize;
    let out_len = (*stack).Parameters.OutputBufferLength as usize;
    let buffer = (*irp).AssociatedIrp.SystemBuffer as *mut u8;

    if buffer.is_null() || in_len == 0 {
        return complete(irp, STATUS_INVALID_PARAMETER, 0);
    }

    let (status, information) = match code {
        IOCTL_CRXSHIELD_GET_VERSION => get_version(buffer, out_len),
        IOCTL_CRXSHIELD_READ_MEMORY => read_memory(buffer, in_len, out_len),
        IOCTL_CRXSHIELD_WRITE_MEMORY => write_memory(buffer, in_len),
        IOCTL_CRXSHIELD_GET_PROCESS_BASE => get_process_base(buffer, in_len, out_len),
        IOCTL_CRXSHIELD_ENUM_CALLBACKS => enum_callbacks(buffer, in_len, out_len),
        IOCTL_CRXSHIELD_REMOVE_CALLBACK => remove_callback(buffer, in_len),
        _ => {
            log::warn!("Unsupported control code {:#x}", code);
            (STATUS_INVALID_DEVICE_REQUEST, 0)
        }
    };

    complete(irp, status, information)
}

fn get_version(buffer: *mut u8, out_len: usize) -> (NTSTATUS, usize) {
    log::info!("GetVersion");

    if out_len < size_of::<VersionInfo>() {
        return (STATUS_BUFFER_TOO_SMALL, 0);
    }

    let reply = VersionInfo {
        major: VERSION_MAJOR,
        minor: VERSION_MINOR,
        build: VERSION_BUILD,
    };
    unsafe { ptr::write_unaligned(buffer as *mut VersionInfo, reply) };

    (STATUS_SUCCESS, size_of::<VersionInfo>())
}

fn read_memory(buffer: *mut u8, in_len: usize, out_len: usize) -> (NTSTATUS, usize) {
    if in_len < size_of::<ReadRequest>() {
        return (STATUS_BUFFER_TOO_SMALL, 0);
    }

    let request = unsafe { ptr::read_unaligned(buffer as *const ReadRequest) };
    log::info!(
        "ReadMemory: pid {}, address {:#x}, size {}",
        { request.process_id },
        { request.address },
        { request.size }
    );

    if out_len < request.size as usize {
        return (STATUS_BUFFER_TOO_SMALL, 0);
    }

    // The reply overwrites the request in the shared buffer.
    match memory::read_process_memory(
        request.process_id,
        request.address,
        buffer,
        request.size as usize,
    ) {
        Ok(bytes_read) => (STATUS_SUCCESS, bytes_read),
        Err(error) => {
            log::warn!("ReadMemory failed: {}", error);
            (error.to_ntstatus(), 0)
        }
    }
}

fn write_memory(buffer: *mut u8, in_len: usize) -> (NTSTATUS, usize) {
    if in_len < size_of::<WriteRequest>() {
        return (STATUS_BUFFER_TOO_SMALL, 0);
    }

    let request = unsafe { ptr::read_unaligned(buffer as *const WriteRequest) };
    log::info!(
        "WriteMemory: pid {}, address {:#x}, size {}",
        { request.process_id },
        { request.address },
        { request.size }
    );

    // `in_len` is already bounded, so comparing against the remaining payload
    // space cannot be defeated by an overflowing `size`.
    if request.size as usize > in_len - size_of::<WriteRequest>() {
        return (STATUS_BUFFER_TOO_SMALL, 0);
    }

    let payload = unsafe { buffer.add(size_of::<WriteRequest>()) };

    match memory::write_process_memory(
        request.process_id,
        request.address,
        payload,
        request.size as usize,
    ) {
        Ok(bytes_written) => (STATUS_SUCCESS, bytes_written),
        Err(error) => {
            log::warn!("WriteMemory failed: {}", error);
            (error.to_ntstatus(), 0)
        }
    }
}

fn get_process_base(buffer: *mut u8, in_len: usize, out_len: usize) -> (NTSTATUS, usize) {
    if in_len < size_of::<ProcessBaseRequest>() || out_len < size_of::<ProcessBaseRequest>() {
        return (STATUS_BUFFER_TOO_SMALL, 0);
    }

    let mut request = unsafe { ptr::read_unaligned(buffer as *const ProcessBaseRequest) };
    log::info!("GetProcessBase: pid {}", { request.process_id });

    let (status, base) = match memory::process_base_address(request.process_id) {
        Ok(base) => (STATUS_SUCCESS, base),
        Err(error) => {
            log::warn!("GetProcessBase failed: {}", error);
            (error.to_ntstatus(), 0)
        }
    };

    request.base_address = base;
    unsafe { ptr::write_unaligned(buffer as *mut ProcessBaseRequest, request) };

    (status, size_of::<ProcessBaseRequest>())
}

fn enum_callbacks(buffer: *mut u8, in_len: usize, out_len: usize) -> (NTSTATUS, usize) {
    if in_len < size_of::<EnumCallbacksRequest>() || out_len < size_of::<EnumCallbacksRequest>() {
        return (STATUS_BUFFER_TOO_SMALL, 0);
    }

    let mut request = unsafe { ptr::read_unaligned(buffer as *const EnumCallbacksRequest) };
    log::info!("EnumCallbacks: max {}", { request.max_entries });

    // Entries follow the request header in the same buffer; never hand out
    // more capacity than the output buffer actually has.
    let capacity = (out_len - size_of::<EnumCallbacksRequest>()) / size_of::<CallbackEntry>();
    let capacity = capacity.min(request.max_entries as usize);

    let entries = unsafe {
        core::slice::from_raw_parts_mut(
            buffer.add(size_of::<EnumCallbacksRequest>()) as *mut CallbackEntry,
            capacity,
        )
    };

    let (status, count) = match callbacks::enum_callbacks(entries) {
        Ok(count) => (STATUS_SUCCESS, count),
        Err(error) => {
            log::warn!("EnumCallbacks failed: {}", error);
            (error.to_ntstatus(), 0)
        }
    };

    request.entry_count = count;
    unsafe { ptr::write_unaligned(buffer as *mut EnumCallbacksRequest, request) };

    let information =
        size_of::<EnumCallbacksRequest>() + count as usize * size_of::<CallbackEntry>();
    (status, information)
}

fn remove_callback(buffer: *mut u8, in_len: usize) -> (NTSTATUS, usize) {
    if in_len < size_of::<RemoveCallbackRequest>() {
        return (STATUS_BUFFER_TOO_SMALL, 0);
    }

    let request = unsafe { ptr::read_unaligned(buffer as *const RemoveCallbackRequest) };
    log::info!("RemoveCallback: address {:#x}", { request.callback_address });

    match callbacks::remove_callback(request.callback_address) {
        Ok(()) => (STATUS_SUCCESS, 0),
        Err(error) => {
            log::warn!("RemoveCallback failed: {}", error);
            (error.to_ntstatus(), 0)
        }
    }
}
