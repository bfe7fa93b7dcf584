// SCSI-generic (SG_IO) passthrough plumbing shared by the ATA and SCSI
// backends: command descriptor blocks, sense inspection and the residual
// count that yields the number of blocks actually transferred.

use std::io;
use std::os::unix::io::RawFd;

use log::{debug, trace};

use crate::{ZbdError, ZbdResult};

/// SG_IO ioctl request code.
const SG_IO: libc::c_ulong = 0x2285;

/// Data transfer directions, as the sg driver defines them.
const SG_DXFER_NONE: libc::c_int = -1;
const SG_DXFER_TO_DEV: libc::c_int = -2;
const SG_DXFER_FROM_DEV: libc::c_int = -3;

const SG_INFO_OK_MASK: u32 = 0x1;
const SG_INFO_OK: u32 = 0x0;

const SENSE_BUF_LEN: usize = 64;
const CDB_LEN: usize = 16;

/// Command timeout in milliseconds.
const SG_TIMEOUT_MS: u32 = 30_000;

/// ATA PASS-THROUGH (16) operation code.
pub(crate) const ATA16_CDB_OPCODE: u8 = 0x85;

#[repr(C)]
struct SgIoHdr {
    interface_id: libc::c_int,
    dxfer_direction: libc::c_int,
    cmd_len: u8,
    mx_sb_len: u8,
    iovec_count: u16,
    dxfer_len: u32,
    dxferp: *mut libc::c_void,
    cmdp: *mut u8,
    sbp: *mut u8,
    timeout: u32,
    flags: u32,
    pack_id: libc::c_int,
    usr_ptr: *mut libc::c_void,
    status: u8,
    masked_status: u8,
    msg_status: u8,
    sb_len_wr: u8,
    host_status: u16,
    driver_status: u16,
    resid: i32,
    duration: u32,
    info: u32,
}

/// One SG_IO command: a 16-byte CDB plus the execution results needed by
/// the callers (sense bytes and residual count).
pub(crate) struct SgCmd {
    pub cdb: [u8; CDB_LEN],
    cdb_len: u8,
    sense: [u8; SENSE_BUF_LEN],
    sense_len: usize,
    resid: i32,
}

enum Xfer<'a> {
    None,
    FromDev(&'a mut [u8]),
    ToDev(&'a [u8]),
}

impl SgCmd {
    pub fn new(cdb_len: u8) -> Self {
        SgCmd {
            cdb: [0u8; CDB_LEN],
            cdb_len,
            sense: [0u8; SENSE_BUF_LEN],
            sense_len: 0,
            resid: 0,
        }
    }

    /// Sense bytes returned by the last execution.
    pub fn sense(&self) -> &[u8] {
        &self.sense[..self.sense_len]
    }

    /// Number of bytes actually transferred by the last execution.
    pub fn transferred(&self, requested: usize) -> usize {
        requested.saturating_sub(self.resid.max(0) as usize)
    }

    /// Execute a command with no data phase.
    pub fn exec_none(&mut self, fd: RawFd) -> ZbdResult<()> {
        self.exec(fd, Xfer::None)
    }

    /// Execute a command reading from the device into `buf`.
    pub fn exec_read(&mut self, fd: RawFd, buf: &mut [u8]) -> ZbdResult<()> {
        self.exec(fd, Xfer::FromDev(buf))
    }

    /// Execute a command writing `buf` to the device.
    pub fn exec_write(&mut self, fd: RawFd, buf: &[u8]) -> ZbdResult<()> {
        self.exec(fd, Xfer::ToDev(buf))
    }

    fn exec(&mut self, fd: RawFd, xfer: Xfer<'_>) -> ZbdResult<()> {
        let (dir, dxferp, dxfer_len) = match xfer {
            Xfer::None => (SG_DXFER_NONE, std::ptr::null_mut(), 0),
            Xfer::FromDev(buf) => (
                SG_DXFER_FROM_DEV,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len() as u32,
            ),
            // The sg driver only reads from the buffer in this direction.
            Xfer::ToDev(buf) => (
                SG_DXFER_TO_DEV,
                buf.as_ptr() as *mut libc::c_void,
                buf.len() as u32,
            ),
        };

        let mut hdr = SgIoHdr {
            interface_id: 'S' as libc::c_int,
            dxfer_direction: dir,
            cmd_len: self.cdb_len,
            mx_sb_len: SENSE_BUF_LEN as u8,
            iovec_count: 0,
            dxfer_len,
            dxferp,
            cmdp: self.cdb.as_mut_ptr(),
            sbp: self.sense.as_mut_ptr(),
            timeout: SG_TIMEOUT_MS,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };

        trace!("SG_IO cdb {:02x?}", &self.cdb[..self.cdb_len as usize]);

        let ret = unsafe { libc::ioctl(fd, SG_IO, &mut hdr) };
        if ret < 0 {
            return Err(ZbdError::Io(io::Error::last_os_error()));
        }

        self.sense_len = hdr.sb_len_wr as usize;
        self.resid = hdr.resid;

        if (hdr.info & SG_INFO_OK_MASK) != SG_INFO_OK {
            // A sense payload with no or a recovered sense key is how the
            // ATA passthrough ck_cond protocol returns task file registers;
            // only real sense keys are failures.
            if let Some((key, asc, ascq)) = self.sense_key() {
                if key <= 0x01 {
                    return Ok(());
                }
                debug!(
                    "SG_IO command {:#04x} failed: sense key {:#x} asc {:#04x} ascq {:#04x}",
                    self.cdb[0], key, asc, ascq
                );
                return Err(ZbdError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "SCSI sense key {:#x} asc {:#04x} ascq {:#04x}",
                        key, asc, ascq
                    ),
                )));
            }
            debug!(
                "SG_IO command {:#04x} failed: status {:#04x} host {:#06x} driver {:#06x}",
                self.cdb[0], hdr.status, hdr.host_status, hdr.driver_status
            );
            return Err(ZbdError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "SG_IO status {:#04x} host {:#06x} driver {:#06x}",
                    hdr.status, hdr.host_status, hdr.driver_status
                ),
            )));
        }

        Ok(())
    }

    /// Sense key, additional sense code and qualifier, for both fixed and
    /// descriptor sense formats.
    fn sense_key(&self) -> Option<(u8, u8, u8)> {
        let sense = self.sense();
        match sense.first()? & 0x7F {
            0x70 | 0x71 if sense.len() >= 14 => {
                Some((sense[2] & 0x0F, sense[12], sense[13]))
            }
            0x72 | 0x73 if sense.len() >= 4 => Some((sense[1] & 0x0F, sense[2], sense[3])),
            _ => None,
        }
    }
}

/// Big-endian field setters used by SCSI CDBs.
pub(crate) fn put_be32(buf: &mut [u8], val: u32) {
    buf[..4].copy_from_slice(&val.to_be_bytes());
}

pub(crate) fn put_be64(buf: &mut [u8], val: u64) {
    buf[..8].copy_from_slice(&val.to_be_bytes());
}

pub(crate) fn get_be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[..4].try_into().unwrap())
}

pub(crate) fn get_be64(buf: &[u8]) -> u64 {
    u64::from_be_bytes(buf[..8].try_into().unwrap())
}

/// Little-endian accessors for ATA log page data.
pub(crate) fn get_le16(buf: &[u8]) -> u16 {
    u16::from_le_bytes(buf[..2].try_into().unwrap())
}

pub(crate) fn get_le32(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[..4].try_into().unwrap())
}

pub(crate) fn get_le64(buf: &[u8]) -> u64 {
    u64::from_le_bytes(buf[..8].try_into().unwrap())
}

/// ASCII identification field, trimmed of padding.
pub(crate) fn ascii_field(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// Standard INQUIRY data (96 bytes).
pub(crate) fn inquiry(fd: RawFd) -> ZbdResult<[u8; 96]> {
    let mut buf = [0u8; 96];
    let mut cmd = SgCmd::new(6);
    cmd.cdb[0] = 0x12;
    cmd.cdb[4] = buf.len() as u8;
    cmd.exec_read(fd, &mut buf)?;
    Ok(buf)
}

/// INQUIRY for one vital product data page.
pub(crate) fn inquiry_vpd(fd: RawFd, page: u8, buf: &mut [u8]) -> ZbdResult<usize> {
    let mut cmd = SgCmd::new(6);
    cmd.cdb[0] = 0x12;
    cmd.cdb[1] = 0x01; // EVPD
    cmd.cdb[2] = page;
    cmd.cdb[3] = (buf.len() >> 8) as u8;
    cmd.cdb[4] = buf.len() as u8;
    cmd.exec_read(fd, buf)?;
    Ok(cmd.transferred(buf.len()))
}

/// Vendor, product and revision strings from standard INQUIRY data.
pub(crate) fn inquiry_vendor_id(fd: RawFd) -> String {
    match inquiry(fd) {
        Ok(buf) => {
            let mut id = ascii_field(&buf[8..16]);
            for part in [&buf[16..32], &buf[32..36]] {
                let field = ascii_field(part);
                if !field.is_empty() {
                    if !id.is_empty() {
                        id.push(' ');
                    }
                    id.push_str(&field);
                }
            }
            if id.is_empty() {
                "UNKNOWN".to_string()
            } else {
                id
            }
        }
        Err(e) => {
            debug!("Device inquiry failed: {}", e);
            "UNKNOWN".to_string()
        }
    }
}

/// READ CAPACITY (16): capacity in logical blocks, logical block size and
/// the logical-per-physical block exponent.
pub(crate) fn read_capacity16(fd: RawFd) -> ZbdResult<(u64, u32, u32)> {
    let mut buf = [0u8; 32];
    let mut cmd = SgCmd::new(16);
    cmd.cdb[0] = 0x9E;
    cmd.cdb[1] = 0x10; // service action
    put_be32(&mut cmd.cdb[10..], buf.len() as u32);
    cmd.exec_read(fd, &mut buf)?;

    let nr_lbas = get_be64(&buf[0..]) + 1;
    let lba_size = get_be32(&buf[8..]);
    let logical_per_physical = 1u32 << (buf[13] & 0x0F);
    Ok((nr_lbas, lba_size, logical_per_physical))
}
