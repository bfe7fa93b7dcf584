// ZBC (SCSI) backend.
//
// Host-managed ZBC disks announce themselves with peripheral device type
// 0x14 in INQUIRY data; host-aware disks look like standard block devices
// with the zoned field set in the block device characteristics VPD page.
// Zone management uses the native REPORT ZONES and RESET WRITE POINTER
// commands, data transfers READ 16/WRITE 16.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::debug;
use nix::sys::stat::{fstat, SFlag};

use super::ata::open_file;
use super::sg::{self, SgCmd};
use super::{Backend, Probed, ZoneOps};
use crate::device::{DeviceInfo, DeviceType, OpenMode, ZonedModel};
use crate::zone::{ReportingOptions, Zone, ZoneCondition, ZoneType, RESET_ALL_ZONES};
use crate::{ZbdError, ZbdResult};

const BACKEND_NAME: &str = "scsi";

/// ZBC IN with the REPORT ZONES service action.
const ZBC_REPORT_ZONES_OPCODE: u8 = 0x95;
const ZBC_REPORT_ZONES_SA: u8 = 0x00;

/// ZBC OUT with the RESET WRITE POINTER service action.
const ZBC_RESET_WP_OPCODE: u8 = 0x94;
const ZBC_RESET_WP_SA: u8 = 0x04;

/// Peripheral device type of host-managed zoned block devices.
const ZBC_PDT_HOST_MANAGED: u8 = 0x14;

/// Zone descriptor geometry in the REPORT ZONES response.
const ZONE_DESCRIPTOR_LENGTH: usize = 64;
const ZONE_DESCRIPTOR_OFFSET: usize = 64;

/// Upper bound on one REPORT ZONES transfer.
const REPORT_ZONES_BUF_MAX: usize = 524_288;

pub(crate) struct ScsiBackend;

struct ScsiDevice {
    file: File,
    path: PathBuf,
    lba_size: u32,
}

fn reject(operation: &'static str) -> ZbdError {
    ZbdError::NotSupported {
        backend: BACKEND_NAME,
        operation,
    }
}

impl Backend for ScsiBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn open(&self, path: &Path, mode: OpenMode) -> ZbdResult<Probed> {
        let file = open_file(path, mode)?;
        let st = fstat(file.as_raw_fd()).map_err(|e| ZbdError::Io(io::Error::from(e)))?;
        let kind = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
        if kind != SFlag::S_IFBLK && kind != SFlag::S_IFCHR {
            return Err(reject("not a block or character device"));
        }

        let fd = file.as_raw_fd();
        let model = classify(fd)?;
        let vendor_id = sg::inquiry_vendor_id(fd);

        let (nr_lbas, lba_size, logical_per_physical) = sg::read_capacity16(fd)?;
        if lba_size == 0 || nr_lbas == 0 {
            return Err(ZbdError::InvalidZone(format!(
                "{}: invalid capacity or block size",
                path.display()
            )));
        }

        let info = DeviceInfo {
            device_type: DeviceType::Scsi,
            zoned_model: model,
            vendor_id,
            nr_lbas,
            lba_size,
            nr_physical_blocks: nr_lbas / logical_per_physical as u64,
            physical_block_size: lba_size * logical_per_physical,
        };

        Ok(Probed {
            ops: Box::new(ScsiDevice {
                file,
                path: path.to_path_buf(),
                lba_size,
            }),
            info,
        })
    }
}

fn classify(fd: RawFd) -> ZbdResult<ZonedModel> {
    let inq = sg::inquiry(fd)?;
    match inq[0] & 0x1F {
        ZBC_PDT_HOST_MANAGED => {
            debug!("Host-managed ZBC device detected");
            Ok(ZonedModel::HostManaged)
        }
        0x00 => {
            // Zoned field of the block device characteristics VPD page:
            // 01b means host-aware.
            let mut vpd = [0u8; 64];
            let n = sg::inquiry_vpd(fd, 0xB1, &mut vpd)?;
            if n > 8 && (vpd[8] >> 4) & 0x03 == 0x01 {
                debug!("Host-aware ZBC device detected");
                Ok(ZonedModel::HostAware)
            } else {
                Err(reject("standard or drive-managed SCSI device"))
            }
        }
        _ => Err(reject("unsupported peripheral device type")),
    }
}

fn parse_descriptor(desc: &[u8]) -> ZbdResult<Zone> {
    let zone_type = ZoneType::from_wire(desc[0] & 0x0F).ok_or_else(|| {
        ZbdError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown zone type {:#x}", desc[0] & 0x0F),
        ))
    })?;
    let condition = ZoneCondition::from_wire((desc[1] >> 4) & 0x0F).ok_or_else(|| {
        ZbdError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown zone condition {:#x}", (desc[1] >> 4) & 0x0F),
        ))
    })?;
    Ok(Zone {
        zone_type,
        condition,
        length: sg::get_be64(&desc[8..]),
        start: sg::get_be64(&desc[16..]),
        write_pointer: sg::get_be64(&desc[24..]),
        need_reset: desc[1] & 0x01 != 0,
    })
}

impl ScsiDevice {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// One REPORT ZONES command with an allocation length sized for
    /// `max_zones` descriptors. Returns the response buffer and the number
    /// of descriptor bytes the device says follow the header.
    fn report_zones_cmd(
        &mut self,
        start_lba: u64,
        ro: ReportingOptions,
        max_zones: usize,
    ) -> ZbdResult<(Vec<u8>, usize)> {
        let alloc = (ZONE_DESCRIPTOR_OFFSET + max_zones * ZONE_DESCRIPTOR_LENGTH)
            .min(REPORT_ZONES_BUF_MAX);
        let mut buf = vec![0u8; alloc];

        let mut cmd = SgCmd::new(16);
        cmd.cdb[0] = ZBC_REPORT_ZONES_OPCODE;
        cmd.cdb[1] = ZBC_REPORT_ZONES_SA;
        sg::put_be64(&mut cmd.cdb[2..], start_lba);
        sg::put_be32(&mut cmd.cdb[10..], alloc as u32);
        cmd.cdb[14] = ro.wire() & 0x3F;
        cmd.exec_read(self.fd(), &mut buf)?;

        let zone_list_bytes = sg::get_be32(&buf) as usize;
        Ok((buf, zone_list_bytes))
    }
}

impl ZoneOps for ScsiDevice {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    fn nr_zones(&mut self, start_lba: u64, ro: ReportingOptions) -> ZbdResult<u32> {
        // Header only: the zone list length field carries the total.
        let (_, zone_list_bytes) = self.report_zones_cmd(start_lba, ro, 0)?;
        Ok((zone_list_bytes / ZONE_DESCRIPTOR_LENGTH) as u32)
    }

    fn report_zones(
        &mut self,
        start_lba: u64,
        ro: ReportingOptions,
        zones: &mut [Zone],
    ) -> ZbdResult<u32> {
        if zones.is_empty() {
            return Ok(0);
        }
        let (buf, zone_list_bytes) = self.report_zones_cmd(start_lba, ro, zones.len())?;

        let in_buf = (buf.len() - ZONE_DESCRIPTOR_OFFSET) / ZONE_DESCRIPTOR_LENGTH;
        let reported = zone_list_bytes / ZONE_DESCRIPTOR_LENGTH;
        let nz = reported.min(in_buf).min(zones.len());

        for (i, zone) in zones.iter_mut().enumerate().take(nz) {
            let off = ZONE_DESCRIPTOR_OFFSET + i * ZONE_DESCRIPTOR_LENGTH;
            *zone = parse_descriptor(&buf[off..off + ZONE_DESCRIPTOR_LENGTH])?;
        }
        Ok(nz as u32)
    }

    fn pread(
        &mut self,
        zone: &Zone,
        buf: &mut [u8],
        lba_count: u32,
        lba_ofst: u64,
    ) -> ZbdResult<u32> {
        let sz = lba_count as usize * self.lba_size as usize;
        let mut cmd = SgCmd::new(16);
        cmd.cdb[0] = 0x88; // READ 16
        cmd.cdb[1] = 0x10;
        sg::put_be64(&mut cmd.cdb[2..], zone.start + lba_ofst);
        sg::put_be32(&mut cmd.cdb[10..], lba_count);
        cmd.exec_read(self.fd(), &mut buf[..sz])?;
        Ok((cmd.transferred(sz) / self.lba_size as usize) as u32)
    }

    fn pwrite(
        &mut self,
        zone: &Zone,
        buf: &[u8],
        lba_count: u32,
        lba_ofst: u64,
    ) -> ZbdResult<u32> {
        let sz = lba_count as usize * self.lba_size as usize;
        let mut cmd = SgCmd::new(16);
        cmd.cdb[0] = 0x8A; // WRITE 16
        cmd.cdb[1] = 0x10;
        sg::put_be64(&mut cmd.cdb[2..], zone.start + lba_ofst);
        sg::put_be32(&mut cmd.cdb[10..], lba_count);
        cmd.exec_write(self.fd(), &buf[..sz])?;
        Ok((cmd.transferred(sz) / self.lba_size as usize) as u32)
    }

    fn flush(&mut self, lba_ofst: u64, lba_count: u32, immediate: bool) -> ZbdResult<()> {
        let mut cmd = SgCmd::new(10);
        cmd.cdb[0] = 0x35; // SYNCHRONIZE CACHE (10)
        if immediate {
            cmd.cdb[1] = 0x02;
        }
        sg::put_be32(&mut cmd.cdb[2..], lba_ofst as u32);
        cmd.cdb[7] = (lba_count >> 8) as u8;
        cmd.cdb[8] = lba_count as u8;
        cmd.exec_none(self.fd())
    }

    fn reset_write_pointer(&mut self, start_lba: u64) -> ZbdResult<()> {
        let mut cmd = SgCmd::new(16);
        cmd.cdb[0] = ZBC_RESET_WP_OPCODE;
        cmd.cdb[1] = ZBC_RESET_WP_SA;
        if start_lba == RESET_ALL_ZONES {
            cmd.cdb[14] = 0x01; // ALL
        } else {
            sg::put_be64(&mut cmd.cdb[2..], start_lba);
        }
        cmd.exec_none(self.fd())
    }

    fn close(&mut self) -> ZbdResult<()> {
        debug!("{}: closing SCSI device", self.path.display());
        Ok(())
    }
}
