//! CrxShield kernel memory gateway.
//!
//! A small test driver for poking at your own anti-tamper software: it
//! exposes one device with a handful of buffered ioctls for cross-process
//! memory access, image-base resolution and object-callback inspection.
//!
//! Kernel mode code can take the whole box down. Only load this on a machine
//! you can afford to crash.

#![no_std]
#![feature(lang_items)]
#![feature(alloc_error_handler)]

extern crate alloc;

use crate::logger::GatewayLogger;
use crate::nt::include::{
    IoCreateDevice, IoCreateSymbolicLink, IoDeleteDevice, IoDeleteSymbolicLink,
    RtlInitUnicodeString, DEVICE_OBJECT, DO_BUFFERED_IO, DO_DEVICE_INITIALIZING, DRIVER_OBJECT,
    FILE_DEVICE_SECURE_OPEN, IRP_MJ_CLOSE, IRP_MJ_CREATE, IRP_MJ_DEVICE_CONTROL,
};
use crate::utils::alloc::GatewayAlloc;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicPtr, Ordering};
use shared::ctl_code::FILE_DEVICE_UNKNOWN;
use shared::obf;
use winapi::shared::ntdef::{NTSTATUS, PVOID, UNICODE_STRING};
use winapi::shared::ntstatus::STATUS_SUCCESS;

pub mod callbacks;
pub mod dispatch;
pub mod hide;
pub mod lang;
pub mod logger;
pub mod memory;
pub mod nt;
pub mod utils;

#[global_allocator]
static GLOBAL: GatewayAlloc = GatewayAlloc;

static LOGGER: GatewayLogger = GatewayLogger;

static DEVICE: AtomicPtr<DEVICE_OBJECT> = AtomicPtr::new(core::ptr::null_mut());

/// Longest namespace name plus NUL terminator.
const NAME_BUFFER_LEN: usize = 32;

fn decoded_name(obfuscated: &[u8], buffer: &mut [u16; NAME_BUFFER_LEN]) -> UNICODE_STRING {
    // The obfuscated names are compile-time constants that fit the buffer.
    let _ = obf::decode_wide(obfuscated, buffer);

    let mut string = MaybeUninit::<UNICODE_STRING>::uninit();
    unsafe {
        RtlInitUnicodeString(string.as_mut_ptr(), buffer.as_ptr());
        string.assume_init()
    }
}

pub unsafe extern "system" fn driver_unload(driver: *mut DRIVER_OBJECT) {
    log::info!("Driver unloading");

    let mut name_buffer = [0u16; NAME_BUFFER_LEN];
    let mut sym_link = decoded_name(&obf::SYM_LINK_NAME_OBF, &mut name_buffer);
    IoDeleteSymbolicLink(&mut sym_link);

    hide::unhide_driver();

    let device = DEVICE.swap(core::ptr::null_mut(), Ordering::Relaxed);
    if !device.is_null() {
        IoDeleteDevice(device);
    } else if !driver.is_null() && !(*driver).DeviceObject.is_null() {
        IoDeleteDevice((*driver).DeviceObject);
    }

    let live = utils::alloc::live_allocations();
    if live != 0 {
        log::warn!("{} pool allocation(s) still live at unload", live);
    }
}

#[no_mangle]
pub unsafe extern "system" fn DriverEntry(
    driver: *mut DRIVER_OBJECT,
    _registry_path: PVOID,
) -> NTSTATUS {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(GatewayLogger::MAX_LEVEL));

    log::info!("Loading CrxShield gateway");

    // Resolve the undocumented routines first; a missing export downgrades
    // the affected ioctls to `not implemented` instead of failing the load.
    //
    memory::resolve_routines();

    // The namespace names live obfuscated in the binary and are only decoded
    // into stack buffers for the registration calls.
    //
    let mut device_buffer = [0u16; NAME_BUFFER_LEN];
    let mut sym_link_buffer = [0u16; NAME_BUFFER_LEN];
    let mut device_name = decoded_name(&obf::DEVICE_NAME_OBF, &mut device_buffer);
    let mut sym_link_name = decoded_name(&obf::SYM_LINK_NAME_OBF, &mut sym_link_buffer);

    let mut device: *mut DEVICE_OBJECT = core::ptr::null_mut();
    let status = IoCreateDevice(
        driver,
        0,
        &mut device_name,
        FILE_DEVICE_UNKNOWN,
        FILE_DEVICE_SECURE_OPEN,
        0,
        &mut device,
    );
    if status != STATUS_SUCCESS {
        log::error!("Failed to create the device object: {:#x}", status);
        return status;
    }

    let status = IoCreateSymbolicLink(&mut sym_link_name, &mut device_name);
    if status != STATUS_SUCCESS {
        log::error!("Failed to create the symbolic link: {:#x}", status);
        IoDeleteDevice(device);
        return status;
    }

    (*driver).DriverUnload = Some(driver_unload);
    (*driver).MajorFunction[IRP_MJ_CREATE] = Some(dispatch::create_close);
    (*driver).MajorFunction[IRP_MJ_CLOSE] = Some(dispatch::create_close);
    (*driver).MajorFunction[IRP_MJ_DEVICE_CONTROL] = Some(dispatch::device_control);

    (*device).Flags |= DO_BUFFERED_IO;
    (*device).Flags &= !DO_DEVICE_INITIALIZING;

    DEVICE.store(device, Ordering::Relaxed);

    hide::hide_driver(driver);

    log::info!("Driver loaded");

    STATUS_SUCCESS
}
