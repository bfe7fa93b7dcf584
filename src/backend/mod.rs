// Backend capability contract and transport registry.
//
// One `Backend` per transport family probes a path at open time; the first
// probe that accepts the device yields the per-device `ZoneOps` table every
// later operation dispatches through. The registry order is fixed and
// compiled in: ATA first, then SCSI, then the file-backed emulation.

pub(crate) mod ata;
pub(crate) mod emulated;
pub(crate) mod scsi;
pub(crate) mod sg;

use std::path::Path;

use crate::device::{DeviceInfo, OpenMode};
use crate::zone::{ReportingOptions, Zone};
use crate::{ZbdError, ZbdResult};

/// Per-device command-set operations, implemented once per transport.
///
/// `set_zones` and `set_write_pointer` are optional capabilities: the
/// default bodies answer `NotSupported` without contacting the device,
/// which is the legal state for backends lacking the non-standard commands.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait ZoneOps: Send {
    /// Name of the owning backend, for diagnostics.
    fn backend(&self) -> &'static str;

    /// Count zones from `start_lba` matching `ro`, in one device command.
    fn nr_zones(&mut self, start_lba: u64, ro: ReportingOptions) -> ZbdResult<u32>;

    /// Fill `zones` with descriptors starting at `start_lba`, from one
    /// bounded backend response. Returns the number written, which may be
    /// smaller than the slice; zero means no zone at or past `start_lba`.
    fn report_zones(
        &mut self,
        start_lba: u64,
        ro: ReportingOptions,
        zones: &mut [Zone],
    ) -> ZbdResult<u32>;

    /// Read `lba_count` blocks at `lba_ofst` within `zone`. Returns the
    /// number of blocks transferred.
    fn pread(
        &mut self,
        zone: &Zone,
        buf: &mut [u8],
        lba_count: u32,
        lba_ofst: u64,
    ) -> ZbdResult<u32>;

    /// Write `lba_count` blocks at `lba_ofst` within `zone`. Returns the
    /// number of blocks transferred.
    fn pwrite(&mut self, zone: &Zone, buf: &[u8], lba_count: u32, lba_ofst: u64)
        -> ZbdResult<u32>;

    /// Flush the device cache. `(0, 0, false)` means the whole device.
    fn flush(&mut self, lba_ofst: u64, lba_count: u32, immediate: bool) -> ZbdResult<()>;

    /// Reset the write pointer of the zone starting at `start_lba`, or of
    /// every zone for [`crate::RESET_ALL_ZONES`].
    fn reset_write_pointer(&mut self, start_lba: u64) -> ZbdResult<()>;

    /// Non-standard: replace the zone layout with one conventional zone of
    /// `conv_sz` LBAs (absent when zero) followed by sequential zones of
    /// `seq_sz` LBAs.
    fn set_zones(&mut self, _conv_sz: u64, _seq_sz: u64) -> ZbdResult<()> {
        Err(ZbdError::NotSupported {
            backend: self.backend(),
            operation: "SET ZONES",
        })
    }

    /// Non-standard: force the write pointer of the zone starting at
    /// `start_lba` to `write_pointer`.
    fn set_write_pointer(&mut self, _start_lba: u64, _write_pointer: u64) -> ZbdResult<()> {
        Err(ZbdError::NotSupported {
            backend: self.backend(),
            operation: "SET WRITE POINTER",
        })
    }

    /// Release the device resources. Called exactly once by the handle.
    fn close(&mut self) -> ZbdResult<()>;
}

/// A successfully probed device: its ops table and the device-wide
/// metadata snapshot cached in the handle.
pub(crate) struct Probed {
    pub ops: Box<dyn ZoneOps>,
    pub info: DeviceInfo,
}

/// A transport family's open-time probe.
pub(crate) trait Backend: Sync {
    fn name(&self) -> &'static str;

    /// Open `path` if this transport owns the device, rejecting otherwise
    /// so the registry can try the next backend. On rejection no resource
    /// stays held.
    fn open(&self, path: &Path, mode: OpenMode) -> ZbdResult<Probed>;
}

/// Fixed probe order: concrete transports first, emulation last.
pub(crate) static REGISTRY: [&'static dyn Backend; 3] = [
    &ata::AtaBackend,
    &scsi::ScsiBackend,
    &emulated::EmulatedBackend,
];
