// Allow uppercase acronyms for industry-standard terms like ATA, SCSI, ZBC
#![allow(clippy::upper_case_acronyms)]

//! Uniform access to zoned block devices.
//!
//! A zoned block device divides its LBA space into zones, each either
//! conventional (random writes allowed) or sequential (writes must land on
//! the zone's write pointer). The same device can be reached through the
//! ATA (ZAC) or SCSI (ZBC) zone-management command set depending on how it
//! is attached; this crate hides that behind one [`Device`] handle bound at
//! open time to whichever transport backend accepts the device. A
//! file-backed emulated backend stands in for real hardware in tests.
//!
//! ```no_run
//! use zbd::{Device, OpenMode, ReportingOptions};
//!
//! let mut dev = Device::open("/dev/sdb", OpenMode::ReadWrite)?;
//! for zone in dev.list_zones(0, ReportingOptions::All)? {
//!     println!("zone at {} ({} blocks)", zone.start, zone.length);
//! }
//! dev.close()?;
//! # Ok::<(), zbd::ZbdError>(())
//! ```

pub mod device;
pub mod zone;

mod backend;

pub use device::{Device, DeviceInfo, DeviceType, OpenMode, ZonedModel};
pub use zone::{ReportingOptions, Zone, ZoneCondition, ZoneType, RESET_ALL_ZONES};

use thiserror::Error;

/// Errors reported by every public operation.
///
/// Each variant corresponds to one code of the errno-style taxonomy the
/// library guarantees; [`ZbdError::errno`] performs that mapping for
/// callers bridging to C-style interfaces.
#[derive(Error, Debug)]
pub enum ZbdError {
    /// A required argument is unusable, e.g. a buffer too small for the
    /// requested LBA count. No I/O was attempted.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No backend in the registry accepted the device.
    #[error("No compatible zoned device at {path}: {reason}")]
    NoDevice { path: String, reason: String },

    /// Zone buffer allocation failed.
    #[error("Cannot allocate memory for {0} zones")]
    NoMemory(usize),

    /// The bound backend does not implement this optional operation.
    #[error("Operation not supported by the {backend} backend: {operation}")]
    NotSupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// Transport or device failure, surfaced verbatim from the backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An LBA or zone argument the device rejected.
    #[error("Invalid zone or LBA argument: {0}")]
    InvalidZone(String),
}

impl ZbdError {
    /// Negative errno value of this error, for C-style reporting.
    pub fn errno(&self) -> i32 {
        match self {
            ZbdError::InvalidArgument(_) => -libc::EFAULT,
            ZbdError::NoDevice { .. } => -libc::ENODEV,
            ZbdError::NoMemory(_) => -libc::ENOMEM,
            ZbdError::NotSupported { .. } => -libc::ENXIO,
            ZbdError::Io(e) => e.raw_os_error().map(|n| -n).unwrap_or(-libc::EIO),
            ZbdError::InvalidZone(_) => -libc::EINVAL,
        }
    }
}

pub type ZbdResult<T> = Result<T, ZbdError>;

/// Set the library log level.
///
/// Accepted names are `none`, `error`, `info`, `debug` and `vdebug`. The
/// setting is process-wide and last-writer-wins; it is advisory only and an
/// unrecognized name prints a diagnostic and leaves the current level
/// untouched. Output goes through the `log` facade, so the application
/// still chooses the logger implementation.
pub fn set_log_level(level: &str) {
    let filter = match level {
        "none" => log::LevelFilter::Off,
        "error" => log::LevelFilter::Error,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "vdebug" => log::LevelFilter::Trace,
        other => {
            eprintln!("Unknown log level \"{}\"", other);
            return;
        }
    };
    log::set_max_level(filter);
}

#[cfg(test)]
mod device_tests;

#[cfg(test)]
mod lib_tests;
