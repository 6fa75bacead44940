//! DbgPrint logging for the gateway.
//!
//! Two constraints shape this: dispatch handlers log while a request is in
//! flight, and the panic handler logs after the pool may already have failed.
//! Formatting therefore happens in a fixed stack buffer and never allocates;
//! a message that does not fit is truncated, not dropped. Each record is
//! prefixed with a short subsystem tag so DbgView filters still work once
//! the device name gives nothing to filter on.

use core::fmt::{self, Write};
use log::{LevelFilter, Metadata, Record};
use winapi::km::wdm::DbgPrint;

/// Upper bound for one formatted record, terminator included.
const MESSAGE_CAPACITY: usize = 512;

pub struct GatewayLogger;

impl GatewayLogger {
    /// Hot-path tracing stays compiled out unless the build opts in.
    pub const MAX_LEVEL: LevelFilter = if cfg!(feature = "verbose-log") {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };

    fn subsystem(target: &str) -> &'static str {
        if target.ends_with("memory") {
            "mem"
        } else if target.ends_with("dispatch") {
            "ioctl"
        } else if target.ends_with("callbacks") {
            "obcb"
        } else if target.ends_with("hide") {
            "ldr"
        } else {
            "core"
        }
    }
}

struct MessageBuffer {
    bytes: [u8; MESSAGE_CAPACITY],
    used: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            bytes: [0; MESSAGE_CAPACITY],
            used: 0,
        }
    }

    /// Terminates the message and hands out the buffer. `write_str` keeps
    /// two bytes in reserve for exactly this.
    fn finish(&mut self) -> *const u8 {
        self.bytes[self.used] = b'\n';
        self.bytes[self.used + 1] = 0;

        self.bytes.as_ptr()
    }
}

impl fmt::Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = MESSAGE_CAPACITY - 2 - self.used;
        let take = s.len().min(room);

        self.bytes[self.used..self.used + take].copy_from_slice(&s.as_bytes()[..take]);
        self.used += take;

        // Truncation is preferable to losing the record.
        Ok(())
    }
}

impl log::Log for GatewayLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Self::MAX_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut message = MessageBuffer::new();
        let _ = write!(
            message,
            "CrxShield/{} {}: {}",
            Self::subsystem(record.target()),
            record.level(),
            record.args()
        );

        unsafe { DbgPrint(message.finish()) };
    }

    fn flush(&self) {}
}
