//! In-process memory-access monitor.
//!
//! Injected into the target, this DLL opens the shared region created by the
//! controller, registers a first-chance vectored exception handler and traps
//! accesses to the watched address with either hardware debug registers or a
//! guard page. Hit sites are recorded into the shared ring; the controller
//! drains them from outside.
//!
//! The exported surface is a plain stdcall ABI so any injector can drive it.

use crate::logger::DebugOutputLogger;
use crate::transport::{HeaderView, SharedMapping};
use shared::veh::SharedHeader;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use widestring::U16CStr;
use winapi::shared::minwindef::{BOOL, DWORD, FALSE, HINSTANCE, LPVOID, TRUE};
use winapi::um::errhandlingapi::{AddVectoredExceptionHandler, RemoveVectoredExceptionHandler};
use winapi::um::winnt::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH, DLL_THREAD_ATTACH};

mod breakpoints;
mod handler;
mod logger;
mod transport;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to open shared mapping {name:?} (error {code})")]
    OpenMapping { name: String, code: u32 },

    #[error("failed to map the shared region (error {code})")]
    MapView { code: u32 },

    #[error("failed to register the vectored exception handler")]
    RegisterHandler,
}

// The handler reads these without taking a lock; the exported lifecycle
// entry points are serialized by the controller and keep them consistent
// with MAPPING.
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static SHARED: AtomicPtr<SharedHeader> = AtomicPtr::new(std::ptr::null_mut());
static VEH_HANDLE: AtomicPtr<winapi::ctypes::c_void> = AtomicPtr::new(std::ptr::null_mut());

static MAPPING: Mutex<Option<SharedMapping>> = Mutex::new(None);

static LOGGER: DebugOutputLogger = DebugOutputLogger;

fn initialize(name: &U16CStr) -> Result<(), MonitorError> {
    let mapping = SharedMapping::open(name)?;

    // Position 1: run before every frame-based handler.
    let veh_handle =
        unsafe { AddVectoredExceptionHandler(1, Some(handler::vectored_handler)) };
    if veh_handle.is_null() {
        return Err(MonitorError::RegisterHandler);
    }

    SHARED.store(mapping.header_ptr(), Ordering::Release);
    VEH_HANDLE.store(veh_handle, Ordering::Relaxed);
    *MAPPING.lock().unwrap() = Some(mapping);
    INITIALIZED.store(true, Ordering::Release);

    log::info!("Monitor attached to shared region");

    Ok(())
}

fn teardown() {
    let veh_handle = VEH_HANDLE.swap(std::ptr::null_mut(), Ordering::Relaxed);
    if !veh_handle.is_null() {
        unsafe { RemoveVectoredExceptionHandler(veh_handle) };
    }

    // Disarm every slot before the region goes away so no thread faults into
    // a dead configuration.
    for slot in 0..4 {
        breakpoints::clear_on_all_threads(slot);
    }

    INITIALIZED.store(false, Ordering::Release);
    SHARED.store(std::ptr::null_mut(), Ordering::Release);

    if let Some(mapping) = MAPPING.lock().unwrap().take() {
        let view = unsafe { HeaderView::new(mapping.header_ptr()) };
        view.active().store(0, Ordering::Relaxed);
        // Mapping unmaps and closes on drop.
    }

    log::info!("Monitor detached");
}

/// Opens the named shared region and installs the vectored handler. A
/// previous session is fully torn down first, so the handler can never see a
/// half-swapped configuration.
#[no_mangle]
pub unsafe extern "system" fn InitializeVEH(shared_mem_name: *const u16) -> BOOL {
    if shared_mem_name.is_null() {
        return FALSE;
    }

    let name = U16CStr::from_ptr_str(shared_mem_name);
    if name.is_empty() {
        return FALSE;
    }

    if INITIALIZED.load(Ordering::Acquire)
        || !VEH_HANDLE.load(Ordering::Relaxed).is_null()
        || !SHARED.load(Ordering::Relaxed).is_null()
    {
        log::warn!("Previous monitor state detected, tearing down first");
        teardown();
    }

    match initialize(name) {
        Ok(()) => TRUE,
        Err(error) => {
            log::error!("Initialization failed: {}", error);
            FALSE
        }
    }
}

/// Removes the handler, disarms all slots and unmaps the region.
#[no_mangle]
pub unsafe extern "system" fn UninitializeVEH() {
    if !INITIALIZED.load(Ordering::Acquire)
        && VEH_HANDLE.load(Ordering::Relaxed).is_null()
        && SHARED.load(Ordering::Relaxed).is_null()
    {
        return;
    }

    teardown();
}

/// Arms `slot` with the given watch on every thread of the process.
/// Individual thread failures do not stop the sweep but fail the call.
#[no_mangle]
pub unsafe extern "system" fn SetHardwareBreakpoint(
    slot: i32,
    address: u64,
    bp_type: u32,
    size: u32,
) -> BOOL {
    if !(0..=3).contains(&slot) {
        return FALSE;
    }

    if breakpoints::set_on_all_threads(slot as usize, address, bp_type, size) {
        TRUE
    } else {
        FALSE
    }
}

/// Disables `slot` on every thread of the process.
#[no_mangle]
pub unsafe extern "system" fn ClearHardwareBreakpoint(slot: i32) {
    if !(0..=3).contains(&slot) {
        return;
    }

    breakpoints::clear_on_all_threads(slot as usize);
}

/// Re-applies the configuration in the shared header to every thread. The
/// controller calls this to cover threads that appeared between the initial
/// arm and now. No-op unless monitoring is active.
#[no_mangle]
pub unsafe extern "system" fn RefreshBreakpoints() -> BOOL {
    let header = SHARED.load(Ordering::Acquire);
    if !INITIALIZED.load(Ordering::Acquire) || header.is_null() {
        return FALSE;
    }

    let view = HeaderView::new(header);
    if view.active().load(Ordering::Relaxed) == 0 {
        return FALSE;
    }

    let slot = view.bp_slot().load(Ordering::Relaxed).min(3) as usize;
    let armed = breakpoints::set_on_all_threads(
        slot,
        view.watch_address(),
        view.bp_type().load(Ordering::Relaxed),
        view.bp_size().load(Ordering::Relaxed),
    );

    if armed {
        TRUE
    } else {
        FALSE
    }
}

#[no_mangle]
extern "system" fn DllMain(_module: HINSTANCE, reason: DWORD, _reserved: LPVOID) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => {
            let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(log::LevelFilter::Info));
            // Thread notifications stay enabled: the attach hook is how new
            // threads inherit the breakpoint.
            log::info!("Monitor DLL attached");
        }
        DLL_THREAD_ATTACH => {
            // Runs inside the new thread, which can rewrite its own debug
            // registers without a suspend.
            breakpoints::apply_to_current_thread();
        }
        DLL_PROCESS_DETACH => {
            unsafe { UninitializeVEH() };
        }
        _ => {}
    }

    TRUE
}
