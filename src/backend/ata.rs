// ZAC (ATA) backend.
//
// Zone management goes through ATA PASS-THROUGH (16) commands: the zone
// report is the 0x1A log read with READ LOG DMA EXT, resets use RESET WRITE
// POINTER EXT. Data transfers use READ/WRITE DMA EXT unless the open-time
// probe shows the HBA translates native SCSI READ 16/WRITE 16 for this
// disk, in which case the translated path is preferred.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::debug;
use nix::sys::stat::{fstat, SFlag};

use super::sg::{self, SgCmd};
use super::{Backend, Probed, ZoneOps};
use crate::device::{DeviceInfo, DeviceType, OpenMode, ZonedModel};
use crate::zone::{ReportingOptions, Zone, ZoneCondition, ZoneType, RESET_ALL_ZONES};
use crate::{ZbdError, ZbdResult};

const BACKEND_NAME: &str = "ata";

// ATA command codes.
const ATA_EXEC_DEV_DIAGNOSTIC: u8 = 0x90;
const ATA_READ_LOG_DMA_EXT: u8 = 0x47;
const ATA_READ_DMA_EXT: u8 = 0x25;
const ATA_WRITE_DMA_EXT: u8 = 0x35;
const ATA_FLUSH_CACHE_EXT: u8 = 0xEA;
const ATA_RESET_WRITE_POINTER_EXT: u8 = 0x9F;

/// Log page holding the zone report.
const REPORT_ZONES_LOG_PAGE: u8 = 0x1A;

/// Zone descriptor geometry inside the log pages.
const ZONE_DESCRIPTOR_LENGTH: usize = 64;
const ZONE_DESCRIPTOR_OFFSET: usize = 64;

/// Upper bound on one READ LOG transfer.
const ATA_LOG_SIZE: usize = 524_288;

/// Largest single R/W transfer the 16-bit sector count can carry.
const ATA_MAX_RW_LBAS: u32 = 65_536;

pub(crate) struct AtaBackend;

struct AtaDevice {
    file: File,
    path: PathBuf,
    lba_size: u32,
    /// Disk accepts translated SCSI READ 16/WRITE 16.
    scsi_rw: bool,
}

pub(crate) fn open_file(path: &Path, mode: OpenMode) -> ZbdResult<File> {
    let mut opts = OpenOptions::new();
    match mode {
        OpenMode::ReadOnly => opts.read(true),
        OpenMode::WriteOnly => opts.write(true),
        OpenMode::ReadWrite => opts.read(true).write(true),
    };
    Ok(opts.open(path)?)
}

fn reject(operation: &'static str) -> ZbdError {
    ZbdError::NotSupported {
        backend: BACKEND_NAME,
        operation,
    }
}

impl Backend for AtaBackend {
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
        if lba_size == 0 {
            return Err(ZbdError::InvalidZone(format!(
                "{}: invalid logical block size",
                path.display()
            )));
        }
        if nr_lbas == 0 {
            return Err(ZbdError::InvalidZone(format!(
                "{}: invalid capacity",
                path.display()
            )));
        }

        let info = DeviceInfo {
            device_type: DeviceType::Ata,
            zoned_model: model,
            vendor_id,
            nr_lbas,
            lba_size,
            nr_physical_blocks: nr_lbas / logical_per_physical as u64,
            physical_block_size: lba_size * logical_per_physical,
        };

        let mut dev = AtaDevice {
            file,
            path: path.to_path_buf(),
            lba_size,
            scsi_rw: false,
        };

        // SAS HBAs may not translate SCSI R/W for host-managed ZAC disks;
        // probe once at open and remember which command set to use.
        dev.scsi_rw = dev.probe_scsi_rw(model);
        debug!(
            "{}: using {} R/W commands",
            path.display(),
            if dev.scsi_rw { "native SCSI" } else { "ATA" }
        );

        Ok(Probed {
            ops: Box::new(dev),
            info,
        })
    }
}

/// Identify the device by its diagnostic signature. ZAC host-managed disks
/// answer with the 0xCD/0xAB signature; a standard signature can still be
/// a host-aware disk, betrayed by support for the zone report log page.
fn classify(fd: RawFd) -> ZbdResult<ZonedModel> {
    let mut cmd = SgCmd::new(16);
    cmd.cdb[0] = sg::ATA16_CDB_OPCODE;
    cmd.cdb[1] = (0x3 << 1) | 0x01; // Non-Data protocol, ext=1
    cmd.cdb[2] = 0x1 << 5; // ck_cond=1 to get the signature back
    cmd.cdb[14] = ATA_EXEC_DEV_DIAGNOSTIC;
    cmd.exec_none(fd)?;

    let sense = cmd.sense();
    if sense.len() < 20 {
        return Err(reject("no ATA signature in sense data"));
    }
    // ATA status return descriptor starts at sense byte 8; the signature
    // bytes are the LBA mid and high task file registers.
    let desc = &sense[8..];
    debug!("Device signature is {:02x}:{:02x}", desc[9], desc[11]);

    match (desc[9], desc[11]) {
        (0xCD, 0xAB) => {
            debug!("Host-managed ZAC signature detected");
            Ok(ZonedModel::HostManaged)
        }
        (0x00, 0x00) => {
            if report_zones_log_supported(fd)? {
                debug!("Host-aware ATA device detected");
                Ok(ZonedModel::HostAware)
            } else {
                debug!("Standard or drive-managed ATA device detected");
                Err(reject("drive-managed or standard ATA device"))
            }
        }
        _ => Err(reject("unrecognized device signature")),
    }
}

/// Check the general purpose log directory for the zone report log page.
fn report_zones_log_supported(fd: RawFd) -> ZbdResult<bool> {
    let mut buf = [0u8; 512];
    read_log(fd, 0x00, 0, 0, &mut buf)?;
    Ok(sg::get_le16(&buf[REPORT_ZONES_LOG_PAGE as usize * 2..]) != 0)
}

/// READ LOG DMA EXT wrapped in ATA PASS-THROUGH (16).
fn read_log(fd: RawFd, log: u8, page: u32, features: u8, buf: &mut [u8]) -> ZbdResult<()> {
    let sectors = (buf.len() / 512) as u32;
    let mut cmd = SgCmd::new(16);
    cmd.cdb[0] = sg::ATA16_CDB_OPCODE;
    cmd.cdb[1] = (0x6 << 1) | 0x01; // DMA protocol, ext=1
    cmd.cdb[2] = 0x0E; // t_dir=1, byt_blk=1, t_length=10
    cmd.cdb[4] = features;
    cmd.cdb[5] = (sectors >> 8) as u8;
    cmd.cdb[6] = sectors as u8;
    cmd.cdb[8] = log;
    cmd.cdb[9] = (page >> 8) as u8;
    cmd.cdb[10] = page as u8;
    cmd.cdb[14] = ATA_READ_LOG_DMA_EXT;
    cmd.exec_read(fd, buf)
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
        length: sg::get_le64(&desc[8..]),
        start: sg::get_le64(&desc[16..]),
        write_pointer: sg::get_le64(&desc[24..]),
        need_reset: desc[1] & 0x01 != 0,
    })
}

impl AtaDevice {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Walk the 0x1A log pages, invoking `each` for every descriptor whose
    /// zone ends past `start_lba`, until `each` declines more.
    fn walk_report(
        &mut self,
        start_lba: u64,
        ro: ReportingOptions,
        mut each: impl FnMut(Zone) -> bool,
    ) -> ZbdResult<()> {
        let mut buf = vec![0u8; ATA_LOG_SIZE];
        read_log(self.fd(), REPORT_ZONES_LOG_PAGE, 0, ro.wire() & 0x0F, &mut buf)?;

        let mut remaining = sg::get_le32(&buf) as usize;
        let mut off = ZONE_DESCRIPTOR_OFFSET;
        let mut valid = buf.len();
        let mut page = 0u32;

        while remaining > 0 {
            if off + ZONE_DESCRIPTOR_LENGTH > valid {
                // Next log pages.
                page += (valid / 512) as u32;
                let mut next = (remaining * ZONE_DESCRIPTOR_LENGTH).div_ceil(512) * 512;
                next = next.clamp(512, ATA_LOG_SIZE);
                read_log(
                    self.fd(),
                    REPORT_ZONES_LOG_PAGE,
                    page,
                    ro.wire() & 0x0F,
                    &mut buf[..next],
                )?;
                valid = next;
                off = 0;
                continue;
            }

            let zone = parse_descriptor(&buf[off..off + ZONE_DESCRIPTOR_LENGTH])?;
            off += ZONE_DESCRIPTOR_LENGTH;
            remaining -= 1;

            if zone.end() <= start_lba {
                continue;
            }
            if !each(zone) {
                break;
            }
        }

        Ok(())
    }

    fn rw_len(&self, lba_count: u32) -> ZbdResult<usize> {
        if lba_count > ATA_MAX_RW_LBAS {
            return Err(ZbdError::InvalidZone(format!(
                "transfer of {} blocks exceeds the {} block ATA limit",
                lba_count, ATA_MAX_RW_LBAS
            )));
        }
        Ok(lba_count as usize * self.lba_size as usize)
    }

    fn ata_rw_cdb(&self, write: bool, lba: u64, lba_count: u32) -> SgCmd {
        let mut cmd = SgCmd::new(16);
        cmd.cdb[0] = sg::ATA16_CDB_OPCODE;
        cmd.cdb[1] = (0x6 << 1) | 0x01; // DMA protocol, ext=1
        cmd.cdb[2] = if write { 0x16 } else { 0x1E }; // t_dir per direction
        cmd.cdb[5] = (lba_count >> 8) as u8;
        cmd.cdb[6] = lba_count as u8;
        cmd.cdb[7] = (lba >> 24) as u8;
        cmd.cdb[8] = lba as u8;
        cmd.cdb[9] = (lba >> 32) as u8;
        cmd.cdb[10] = (lba >> 8) as u8;
        cmd.cdb[11] = (lba >> 40) as u8;
        cmd.cdb[12] = (lba >> 16) as u8;
        cmd.cdb[13] = 1 << 6;
        cmd.cdb[14] = if write {
            ATA_WRITE_DMA_EXT
        } else {
            ATA_READ_DMA_EXT
        };
        cmd
    }

    fn scsi_rw_cdb(&self, write: bool, lba: u64, lba_count: u32) -> SgCmd {
        let mut cmd = SgCmd::new(16);
        cmd.cdb[0] = if write { 0x8A } else { 0x88 }; // WRITE 16 / READ 16
        cmd.cdb[1] = 0x10;
        sg::put_be64(&mut cmd.cdb[2..], lba);
        sg::put_be32(&mut cmd.cdb[10..], lba_count);
        cmd
    }

    fn read_blocks(
        &mut self,
        lba: u64,
        buf: &mut [u8],
        lba_count: u32,
        force_scsi: bool,
    ) -> ZbdResult<u32> {
        let sz = self.rw_len(lba_count)?;
        let mut cmd = if self.scsi_rw || force_scsi {
            self.scsi_rw_cdb(false, lba, lba_count)
        } else {
            self.ata_rw_cdb(false, lba, lba_count)
        };
        cmd.exec_read(self.fd(), &mut buf[..sz])?;
        Ok((cmd.transferred(sz) / self.lba_size as usize) as u32)
    }

    /// Decide whether translated SCSI R/W works for this disk. Host-aware
    /// disks always translate; for host-managed ones, read one block from
    /// an open or conventional zone and see whether READ 16 succeeds.
    fn probe_scsi_rw(&mut self, model: ZonedModel) -> bool {
        if model == ZonedModel::HostAware {
            return true;
        }

        let mut probe = None;
        for ro in [
            ReportingOptions::ImplicitOpen,
            ReportingOptions::ExplicitOpen,
            ReportingOptions::NotWritePointer,
        ] {
            let mut found = None;
            if self
                .walk_report(0, ro, |zone| {
                    found = Some(zone);
                    false
                })
                .is_err()
            {
                return true;
            }
            if found.is_some() {
                probe = found;
                break;
            }
        }

        let Some(zone) = probe else {
            debug!("No suitable zone for the R/W probe, assuming ATA commands");
            return false;
        };

        let mut buf = vec![0u8; self.lba_size as usize];
        matches!(self.read_blocks(zone.start, &mut buf, 1, true), Ok(n) if n > 0)
    }
}

impl ZoneOps for AtaDevice {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    fn nr_zones(&mut self, start_lba: u64, ro: ReportingOptions) -> ZbdResult<u32> {
        let mut count = 0u32;
        self.walk_report(start_lba, ro, |_| {
            count += 1;
            true
        })?;
        Ok(count)
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
        let mut filled = 0usize;
        self.walk_report(start_lba, ro, |zone| {
            zones[filled] = zone;
            filled += 1;
            filled < zones.len()
        })?;
        Ok(filled as u32)
    }

    fn pread(
        &mut self,
        zone: &Zone,
        buf: &mut [u8],
        lba_count: u32,
        lba_ofst: u64,
    ) -> ZbdResult<u32> {
        self.read_blocks(zone.start + lba_ofst, buf, lba_count, false)
    }

    fn pwrite(
        &mut self,
        zone: &Zone,
        buf: &[u8],
        lba_count: u32,
        lba_ofst: u64,
    ) -> ZbdResult<u32> {
        let sz = self.rw_len(lba_count)?;
        let lba = zone.start + lba_ofst;
        let mut cmd = if self.scsi_rw {
            self.scsi_rw_cdb(true, lba, lba_count)
        } else {
            self.ata_rw_cdb(true, lba, lba_count)
        };
        cmd.exec_write(self.fd(), &buf[..sz])?;
        Ok((cmd.transferred(sz) / self.lba_size as usize) as u32)
    }

    fn flush(&mut self, _lba_ofst: u64, _lba_count: u32, _immediate: bool) -> ZbdResult<()> {
        let mut cmd = SgCmd::new(16);
        cmd.cdb[0] = sg::ATA16_CDB_OPCODE;
        cmd.cdb[1] = (0x3 << 1) | 0x01; // Non-Data protocol, ext=1
        cmd.cdb[14] = ATA_FLUSH_CACHE_EXT;
        cmd.exec_none(self.fd())
    }

    fn reset_write_pointer(&mut self, start_lba: u64) -> ZbdResult<()> {
        let mut cmd = SgCmd::new(16);
        cmd.cdb[0] = sg::ATA16_CDB_OPCODE;
        cmd.cdb[1] = (0x3 << 1) | 0x01; // Non-Data protocol, ext=1
        if start_lba == RESET_ALL_ZONES {
            cmd.cdb[4] = 0x01; // reset all
        } else {
            cmd.cdb[7] = (start_lba >> 24) as u8;
            cmd.cdb[8] = start_lba as u8;
            cmd.cdb[9] = (start_lba >> 32) as u8;
            cmd.cdb[10] = (start_lba >> 8) as u8;
            cmd.cdb[11] = (start_lba >> 40) as u8;
            cmd.cdb[12] = (start_lba >> 16) as u8;
        }
        cmd.cdb[13] = 1 << 6;
        cmd.cdb[14] = ATA_RESET_WRITE_POINTER_EXT;
        cmd.exec_none(self.fd())
    }

    fn close(&mut self) -> ZbdResult<()> {
        debug!("{}: closing ATA device", self.path.display());
        Ok(())
    }
}
