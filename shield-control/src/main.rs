//! Operator front end for the CrxShield gateway and the memory-access
//! monitor.
//!
//! Driver commands talk to the kernel device directly. The `watch` command
//! owns the shared region and drains hits; it expects an injector to have
//! loaded the monitor DLL into the target and pointed it at the same region
//! name.

use crate::driver::DriverController;
use crate::monitor::MonitorSession;
use shared::veh::{BP_TYPE_READ_WRITE, BP_TYPE_WRITE};
use std::io;
use std::time::Duration;
use thiserror::Error;

pub mod driver;
pub mod monitor;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("device name constant is malformed")]
    BadDeviceName,

    #[error("could not open the gateway device (status {status:#x})")]
    DeviceUnavailable { status: i32 },

    #[error("ioctl {code:#x} failed: {source}")]
    Ioctl { code: u32, source: io::Error },

    #[error("short reply: expected {expected} bytes, got {got}")]
    ShortReply { expected: usize, got: usize },

    #[error("shared region name is not a valid wide string")]
    BadRegionName,

    #[error("could not create the shared region: {source}")]
    CreateRegion { source: io::Error },

    #[error("could not open the target process: {source}")]
    OpenTarget { source: io::Error },

    #[error("could not change the watched page's protection: {source}")]
    GuardProtect { source: io::Error },

    #[error("handlers still live after the teardown bound; region leaked")]
    TeardownTimedOut,
}

fn usage() -> ! {
    eprintln!("usage:");
    eprintln!("  shield-control version");
    eprintln!("  shield-control base <pid>");
    eprintln!("  shield-control read <pid> <addr> <len>");
    eprintln!("  shield-control write <pid> <addr> <hex-bytes>");
    eprintln!("  shield-control callbacks [max]");
    eprintln!("  shield-control remove-callback <addr>");
    eprintln!("  shield-control watch <region-name> <addr> <size> [rw] [seconds]");
    eprintln!("  shield-control watch-guard <region-name> <pid> <addr> <size> [seconds]");
    std::process::exit(2);
}

fn parse_u32(value: &str) -> u32 {
    value.parse().unwrap_or_else(|_| usage())
}

fn parse_addr(value: &str) -> u64 {
    let trimmed = value.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).unwrap_or_else(|_| usage())
}

fn parse_hex_bytes(value: &str) -> Vec<u8> {
    if value.len() % 2 != 0 {
        usage();
    }

    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).unwrap_or_else(|_| usage()))
        .collect()
}

/// Prints hits as they arrive, until the optional time bound elapses.
fn drain_loop(session: &MonitorSession, seconds: Option<u32>) {
    let started = std::time::Instant::now();

    loop {
        std::thread::sleep(Duration::from_millis(200));
        for hit in session.drain() {
            println!(
                "hit from rip {:#018x} on thread {}",
                hit.address, hit.thread_id
            );
        }

        if let Some(seconds) = seconds {
            if started.elapsed() >= Duration::from_secs(seconds.into()) {
                break;
            }
        }
    }
}

fn hex_dump(address: u64, bytes: &[u8]) {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let line: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
        println!("{:#018x}: {}", address + row as u64 * 16, line.join(" "));
    }
}

fn run() -> Result<(), ControllerError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or_else(|| usage());

    match command {
        "version" => {
            let driver = DriverController::connect()?;
            let version = driver.version()?;
            println!(
                "CrxShield {}.{}.{}",
                { version.major },
                { version.minor },
                { version.build }
            );
        }
        "base" => {
            let pid = parse_u32(args.get(1).unwrap_or_else(|| usage()));
            let driver = DriverController::connect()?;
            println!("{:#x}", driver.process_base(pid)?);
        }
        "read" => {
            if args.len() != 4 {
                usage();
            }
            let pid = parse_u32(&args[1]);
            let address = parse_addr(&args[2]);
            let size = parse_u32(&args[3]);

            let driver = DriverController::connect()?;
            let bytes = driver.read_memory(pid, address, size)?;
            hex_dump(address, &bytes);
        }
        "write" => {
            if args.len() != 4 {
                usage();
            }
            let pid = parse_u32(&args[1]);
            let address = parse_addr(&args[2]);
            let data = parse_hex_bytes(&args[3]);

            let driver = DriverController::connect()?;
            driver.write_memory(pid, address, &data)?;
            println!("wrote {} bytes at {address:#x}", data.len());
        }
        "callbacks" => {
            let max = args.get(1).map(|v| parse_u32(v)).unwrap_or(64);
            let driver = DriverController::connect()?;
            let entries = driver.enum_callbacks(max)?;

            println!("{} registration(s)", entries.len());
            for entry in entries {
                println!(
                    "  callback {:#018x} context {:#018x}",
                    { entry.callback_address },
                    { entry.context }
                );
            }
        }
        "remove-callback" => {
            let address = parse_addr(args.get(1).unwrap_or_else(|| usage()));
            let driver = DriverController::connect()?;
            driver.remove_callback(address)?;
            println!("unlinked {address:#x}");
        }
        "watch" => {
            if args.len() < 4 {
                usage();
            }
            let name = &args[1];
            let address = parse_addr(&args[2]);
            let size = parse_u32(&args[3]);
            let mut rest = args[4..].iter().map(String::as_str);
            let mut bp_type = BP_TYPE_WRITE;
            let mut seconds = None;
            for extra in &mut rest {
                match extra {
                    "rw" => bp_type = BP_TYPE_READ_WRITE,
                    value => seconds = Some(parse_u32(value)),
                }
            }

            let session = MonitorSession::create(name)?;
            session.configure_hardware(0, address, bp_type, size);
            session.activate();

            println!("region {name:?} ready; inject the monitor DLL and arm slot 0");
            match seconds {
                Some(seconds) => println!("watching {address:#x} ({size} bytes) for {seconds}s"),
                None => println!("watching {address:#x} ({size} bytes); ctrl-c to stop"),
            }

            drain_loop(&session, seconds);

            session.deactivate();
            println!("{} hit(s) total", session.total_hits());
            session.shutdown()?;
        }
        "watch-guard" => {
            if args.len() < 5 {
                usage();
            }
            let name = &args[1];
            let pid = parse_u32(&args[2]);
            let address = parse_addr(&args[3]);
            let size = parse_u32(&args[4]);
            let seconds = args.get(5).map(|v| parse_u32(v));

            let session = MonitorSession::create(name)?;

            // The guard bit goes on before activation; a fault the DLL sees
            // while idle is swallowed, not recorded.
            let original = monitor::arm_guard_page(pid, address)?;
            session.configure_guard(address, size, original);
            session.activate();

            println!("region {name:?} ready; inject the monitor DLL into pid {pid}");
            println!("guard-watching {address:#x} ({size} bytes)");

            drain_loop(&session, seconds);

            session.deactivate();
            monitor::disarm_guard_page(pid, address, original)?;
            println!("{} hit(s) total", session.total_hits());
            session.shutdown()?;
        }
        _ => usage(),
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
