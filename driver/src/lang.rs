use crate::nt::include::{KeBugCheck, MANUALLY_INITIATED_CRASH};
use crate::utils::alloc;
use core::panic::PanicInfo;

#[no_mangle]
#[allow(bad_style)]
static _fltused: i32 = 0;

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    // A panic mid-dispatch strands whatever the request had acquired; the
    // live-allocation count narrows down which path died. The logger
    // formats on the stack, so this works even when the pool is gone.
    log::error!(
        "Fatal: {} ({} pool allocation(s) live)",
        info,
        alloc::live_allocations()
    );

    unsafe { KeBugCheck(MANUALLY_INITIATED_CRASH) };
}

#[lang = "eh_personality"]
extern "C" fn eh_personality() {}

#[no_mangle]
extern "C" fn __CxxFrameHandler3() {}
