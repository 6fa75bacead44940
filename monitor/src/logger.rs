use log::{Metadata, Record};
use winapi::um::debugapi::OutputDebugStringA;

/// Routes the log facade to the debugger transport. The exception handler
/// itself never logs; this is for the exported lifecycle entry points.
pub struct DebugOutputLogger;

impl log::Log for DebugOutputLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = format!("[VEHDebug] {} - {}\n\0", record.level(), record.args());

            unsafe { OutputDebugStringA(message.as_ptr() as _) };
        }
    }

    fn flush(&self) {}
}
