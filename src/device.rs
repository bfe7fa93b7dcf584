// Device handle and the operations every backend is driven through.
//
// `Device::open` probes the backend registry in its fixed order and binds
// the first transport that accepts the path; everything afterwards
// dispatches through that bound ops table. The handle caches the device
// metadata snapshot taken at open time and owns the backend's private
// state until `close` (or drop) releases it.

use std::path::{Path, PathBuf};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::backend::{ZoneOps, REGISTRY};
use crate::zone::{ReportingOptions, Zone, ZoneCondition, ZoneType};
use crate::{ZbdError, ZbdResult};

/// Access mode requested at open time, the `open(2)` flag triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Transport family that accepted the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    /// ZAC disk driven through ATA passthrough commands.
    Ata,

    /// ZBC disk driven through native SCSI commands.
    Scsi,

    /// File-backed emulation.
    Emulated,
}

/// Zone model of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZonedModel {
    /// Random writes allowed everywhere, sequential writes preferred in
    /// sequential zones.
    HostAware,

    /// Sequential zones only accept writes at their write pointer.
    HostManaged,

    /// The drive hides its zones and behaves like a regular disk.
    DriveManaged,

    /// Emulated device with a configurable zone layout.
    Emulated,
}

/// Device-wide metadata, snapshotted when the device is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Transport family bound to the handle.
    pub device_type: DeviceType,

    /// Zone model reported by the device.
    pub zoned_model: ZonedModel,

    /// Vendor, product and revision identification.
    pub vendor_id: String,

    /// Capacity in logical blocks.
    pub nr_lbas: u64,

    /// Logical block size in bytes.
    pub lba_size: u32,

    /// Capacity in physical blocks.
    pub nr_physical_blocks: u64,

    /// Physical block size in bytes.
    pub physical_block_size: u32,
}

/// An open zoned block device.
///
/// A handle is exclusively owned: every operation takes `&mut self` and
/// blocks the calling thread until the device command completes, so one
/// handle cannot be driven from two threads at once without external
/// serialization. Handles to different devices are independent.
pub struct Device {
    ops: Box<dyn ZoneOps>,
    info: DeviceInfo,
    path: PathBuf,
    closed: bool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("path", &self.path)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Open the zoned block device at `path`.
    ///
    /// Backends are tried in the fixed registry order (ATA, SCSI,
    /// emulated); the first to accept the path is bound to the returned
    /// handle. When every backend rejects it, the error context of the
    /// last attempt is reported and nothing stays open.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> ZbdResult<Device> {
        let path = path.as_ref();
        let mut last_err: Option<ZbdError> = None;

        for backend in REGISTRY.iter() {
            match backend.open(path, mode) {
                Ok(probed) => {
                    info!(
                        "{}: opened through the {} backend ({:?}, {} x {} B blocks)",
                        path.display(),
                        backend.name(),
                        probed.info.zoned_model,
                        probed.info.nr_lbas,
                        probed.info.lba_size
                    );
                    return Ok(Device {
                        ops: probed.ops,
                        info: probed.info,
                        path: path.to_path_buf(),
                        closed: false,
                    });
                }
                Err(e) => {
                    debug!(
                        "{}: {} backend rejected the device: {}",
                        path.display(),
                        backend.name(),
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        let reason = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no backend available".to_string());
        error!("Open device {} failed: {}", path.display(), reason);
        Err(ZbdError::NoDevice {
            path: path.display().to_string(),
            reason,
        })
    }

    /// Close the device, releasing the backend state first. Consuming the
    /// handle makes double-close and use-after-close unrepresentable.
    pub fn close(mut self) -> ZbdResult<()> {
        self.closed = true;
        self.ops.close()
    }

    /// Device metadata snapshot taken at open time, borrowed.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Device metadata snapshot taken at open time, as an owned copy.
    pub fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    /// Path the device was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Count the zones from `start_lba` matching `ro`, in a single
    /// backend call. Useful for sizing a buffer before a paginated report.
    pub fn report_nr_zones(&mut self, start_lba: u64, ro: ReportingOptions) -> ZbdResult<u32> {
        self.ops.nr_zones(start_lba, ro)
    }

    /// Fill `zones` with the zone report starting at `start_lba`.
    ///
    /// Hardware bounds how many descriptors one command returns, so this
    /// paginates: each backend response advances the cursor to the end of
    /// its last zone and the loop continues until the buffer is full or
    /// the device runs out of zones. Returns the number of zones written.
    ///
    /// On a backend error mid-pagination the error is returned and zones
    /// already copied into `zones` are not counted.
    pub fn report_zones(
        &mut self,
        start_lba: u64,
        ro: ReportingOptions,
        zones: &mut [Zone],
    ) -> ZbdResult<usize> {
        let mut total = 0usize;
        let mut cursor = start_lba;

        while total < zones.len() {
            let n = match self.ops.report_zones(cursor, ro, &mut zones[total..]) {
                Ok(n) => n as usize,
                Err(e) => {
                    error!(
                        "{}: zone report from LBA {} failed: {}",
                        self.path.display(),
                        cursor,
                        e
                    );
                    return Err(e);
                }
            };
            if n == 0 {
                // End of device or range.
                break;
            }
            total += n;
            cursor = zones[total - 1].end();
        }

        Ok(total)
    }

    /// Report every zone from `start_lba` matching `ro` as an owned list.
    ///
    /// Sizes the buffer with a count-only report, then fills it with one
    /// paginated report. The returned vector is the caller's to keep.
    pub fn list_zones(&mut self, start_lba: u64, ro: ReportingOptions) -> ZbdResult<Vec<Zone>> {
        let count = self.report_nr_zones(start_lba, ro)? as usize;
        debug!("{}: {} zones", self.path.display(), count);

        let mut zones: Vec<Zone> = Vec::new();
        zones.try_reserve_exact(count).map_err(|_| {
            error!("{}: no memory for {} zones", self.path.display(), count);
            ZbdError::NoMemory(count)
        })?;
        zones.resize(
            count,
            Zone {
                zone_type: ZoneType::Conventional,
                condition: ZoneCondition::NotWritePointer,
                start: 0,
                length: 0,
                write_pointer: 0,
                need_reset: false,
            },
        );

        let n = self.report_zones(start_lba, ro, &mut zones)?;
        zones.truncate(n);
        Ok(zones)
    }

    /// Read `lba_count` blocks from `zone` at `lba_ofst` blocks into the
    /// zone. Returns the number of blocks read, which the caller must
    /// check against the request: short transfers pass through as-is.
    ///
    /// A zero `lba_count` succeeds with 0 without touching the device.
    pub fn pread(
        &mut self,
        zone: &Zone,
        buf: &mut [u8],
        lba_count: u32,
        lba_ofst: u64,
    ) -> ZbdResult<u32> {
        if lba_count == 0 {
            return Ok(0);
        }
        self.check_buffer(buf.len(), lba_count)?;

        match self.ops.pread(zone, buf, lba_count, lba_ofst) {
            Ok(n) if n > 0 => Ok(n),
            res => Err(self.io_failure("Read", zone, lba_count, lba_ofst, res)),
        }
    }

    /// Write `lba_count` blocks to `zone` at `lba_ofst` blocks into the
    /// zone. On success the device advances the zone's write pointer by
    /// the number of blocks written; the `Zone` value is not updated,
    /// report again to observe the new pointer.
    ///
    /// A zero `lba_count` succeeds with 0 without touching the device.
    pub fn pwrite(
        &mut self,
        zone: &Zone,
        buf: &[u8],
        lba_count: u32,
        lba_ofst: u64,
    ) -> ZbdResult<u32> {
        if lba_count == 0 {
            return Ok(0);
        }
        self.check_buffer(buf.len(), lba_count)?;

        match self.ops.pwrite(zone, buf, lba_count, lba_ofst) {
            Ok(n) if n > 0 => Ok(n),
            res => Err(self.io_failure("Write", zone, lba_count, lba_ofst, res)),
        }
    }

    /// Flush the whole device cache.
    pub fn flush(&mut self) -> ZbdResult<()> {
        self.ops.flush(0, 0, false)
    }

    /// Reset the write pointer of the sequential zone starting at
    /// `start_lba`, or of every zone when given [`crate::RESET_ALL_ZONES`].
    /// The zone must be open or full; the device rejects anything else.
    pub fn reset_write_pointer(&mut self, start_lba: u64) -> ZbdResult<()> {
        self.ops.reset_write_pointer(start_lba).map_err(|e| {
            error!(
                "{}: RESET WRITE POINTER at LBA {} failed: {}",
                self.path.display(),
                start_lba,
                e
            );
            e
        })
    }

    /// Replace the zone layout with one conventional zone of `conv_sz`
    /// LBAs (none when zero) followed by sequential zones of `seq_sz`
    /// LBAs. Non-standard; backends without the capability answer
    /// "not supported" without contacting the device.
    pub fn set_zones(&mut self, conv_sz: u64, seq_sz: u64) -> ZbdResult<()> {
        self.ops.set_zones(conv_sz, seq_sz)
    }

    /// Force the write pointer of the zone starting at `start_lba` to
    /// `write_pointer`, which must lie within the zone. Non-standard;
    /// backends without the capability answer "not supported" without
    /// contacting the device.
    pub fn set_write_pointer(&mut self, start_lba: u64, write_pointer: u64) -> ZbdResult<()> {
        self.ops.set_write_pointer(start_lba, write_pointer)
    }

    fn check_buffer(&self, buf_len: usize, lba_count: u32) -> ZbdResult<()> {
        let needed = lba_count as usize * self.info.lba_size as usize;
        if buf_len < needed {
            return Err(ZbdError::InvalidArgument(format!(
                "buffer of {} bytes cannot hold {} blocks of {} bytes",
                buf_len, lba_count, self.info.lba_size
            )));
        }
        Ok(())
    }

    /// Normalize a failed or empty proxied transfer. A zero-block result
    /// for a nonzero request is indistinguishable from a device failure
    /// and maps to EIO.
    fn io_failure(
        &self,
        op: &str,
        zone: &Zone,
        lba_count: u32,
        lba_ofst: u64,
        res: ZbdResult<u32>,
    ) -> ZbdError {
        let err = match res {
            Ok(_) => ZbdError::Io(std::io::Error::from_raw_os_error(libc::EIO)),
            Err(e) => e,
        };
        error!(
            "{}: {} {} blocks at block {} + {} failed: {}",
            self.path.display(),
            op,
            lba_count,
            zone.start,
            lba_ofst,
            err
        );
        err
    }

    #[cfg(test)]
    pub(crate) fn with_ops(ops: Box<dyn ZoneOps>, info: DeviceInfo) -> Device {
        Device {
            ops,
            info,
            path: PathBuf::from("/dev/mock"),
            closed: false,
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.ops.close() {
                error!("{}: close failed: {}", self.path.display(), e);
            }
            self.closed = true;
        }
    }
}
