// Emulated backend.
//
// A regular file stands in for a zoned device: the data area is the file
// itself, the zone table lives in a JSON sidecar next to it so a reopened
// device keeps its layout. The emulation enforces the same write rules a
// host-managed disk would (sequential zones only accept writes at the
// write pointer) and implements the non-standard SET ZONES and SET WRITE
// POINTER commands that real transports lack, which makes it the
// configurable fixture the rest of the crate is tested against.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{Backend, Probed, ZoneOps};
use crate::device::{DeviceInfo, DeviceType, OpenMode, ZonedModel};
use crate::zone::{ReportingOptions, Zone, ZoneCondition, ZoneType, RESET_ALL_ZONES};
use crate::{ZbdError, ZbdResult};

const BACKEND_NAME: &str = "emulated";

/// Fixture geometry of every emulated device.
pub(crate) const EMULATED_LBA_SIZE: u32 = 512;
pub(crate) const EMULATED_PHYSICAL_BLOCK_SIZE: u32 = 4096;
pub(crate) const EMULATED_VENDOR_ID: &str = "ZBD EMULATED 0.1";

/// Sidecar file holding the zone table, next to the backing file.
const SIDECAR_SUFFIX: &str = ".zones";

pub(crate) struct EmulatedBackend;

#[derive(Debug, Serialize, Deserialize)]
struct ZoneTable {
    lba_size: u32,
    zones: Vec<Zone>,
}

struct EmulatedDevice {
    file: File,
    path: PathBuf,
    sidecar: PathBuf,
    nr_lbas: u64,
    zones: Vec<Zone>,
    dirty: bool,
}

impl Backend for EmulatedBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn open(&self, path: &Path, mode: OpenMode) -> ZbdResult<Probed> {
        let mut opts = OpenOptions::new();
        match mode {
            OpenMode::ReadOnly => opts.read(true),
            OpenMode::WriteOnly => opts.write(true),
            OpenMode::ReadWrite => opts.read(true).write(true),
        };
        let file = opts.open(path)?;

        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(ZbdError::NotSupported {
                backend: BACKEND_NAME,
                operation: "not a regular file",
            });
        }

        let nr_lbas = meta.len() / EMULATED_LBA_SIZE as u64;
        let sidecar = sidecar_path(path);
        let zones = load_zone_table(&sidecar)?;
        debug!(
            "{}: emulated device, {} LBAs, {} configured zones",
            path.display(),
            nr_lbas,
            zones.len()
        );

        let info = DeviceInfo {
            device_type: DeviceType::Emulated,
            zoned_model: ZonedModel::Emulated,
            vendor_id: EMULATED_VENDOR_ID.to_string(),
            nr_lbas,
            lba_size: EMULATED_LBA_SIZE,
            nr_physical_blocks: nr_lbas
                / (EMULATED_PHYSICAL_BLOCK_SIZE / EMULATED_LBA_SIZE) as u64,
            physical_block_size: EMULATED_PHYSICAL_BLOCK_SIZE,
        };

        Ok(Probed {
            ops: Box::new(EmulatedDevice {
                file,
                path: path.to_path_buf(),
                sidecar,
                nr_lbas,
                zones,
                dirty: false,
            }),
            info,
        })
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

fn load_zone_table(sidecar: &Path) -> ZbdResult<Vec<Zone>> {
    if !sidecar.exists() {
        // Unconfigured device: no zones until SET ZONES runs.
        return Ok(Vec::new());
    }
    let file = File::open(sidecar)?;
    let table: ZoneTable = serde_json::from_reader(io::BufReader::new(file))
        .map_err(|e| ZbdError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    if table.lba_size != EMULATED_LBA_SIZE {
        return Err(ZbdError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("zone table block size {} is not supported", table.lba_size),
        )));
    }
    Ok(table.zones)
}

impl EmulatedDevice {
    fn persist(&mut self) -> ZbdResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let table = ZoneTable {
            lba_size: EMULATED_LBA_SIZE,
            zones: self.zones.clone(),
        };
        let file = File::create(&self.sidecar)?;
        serde_json::to_writer(io::BufWriter::new(file), &table)
            .map_err(|e| ZbdError::Io(io::Error::from(e)))?;
        self.dirty = false;
        Ok(())
    }

    /// Internal zone matching the caller's snapshot, by start LBA.
    fn zone_index(&self, start: u64) -> ZbdResult<usize> {
        self.zones
            .iter()
            .position(|z| z.start == start)
            .ok_or_else(|| ZbdError::InvalidZone(format!("no zone starts at LBA {}", start)))
    }

    fn byte_offset(&self, zone: &Zone, lba_ofst: u64) -> u64 {
        (zone.start + lba_ofst) * EMULATED_LBA_SIZE as u64
    }

    fn check_in_zone(&self, zone: &Zone, lba_count: u32, lba_ofst: u64) -> ZbdResult<()> {
        if lba_ofst + lba_count as u64 > zone.length {
            return Err(ZbdError::InvalidZone(format!(
                "access of {} blocks at offset {} exceeds zone of {} blocks at LBA {}",
                lba_count, lba_ofst, zone.length, zone.start
            )));
        }
        Ok(())
    }

    fn reset_one(zone: &mut Zone) {
        zone.write_pointer = zone.start;
        zone.condition = ZoneCondition::Empty;
        zone.need_reset = false;
    }
}

impl ZoneOps for EmulatedDevice {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    fn nr_zones(&mut self, start_lba: u64, ro: ReportingOptions) -> ZbdResult<u32> {
        let count = self
            .zones
            .iter()
            .filter(|z| z.end() > start_lba && ro.matches(z))
            .count();
        Ok(count as u32)
    }

    fn report_zones(
        &mut self,
        start_lba: u64,
        ro: ReportingOptions,
        zones: &mut [Zone],
    ) -> ZbdResult<u32> {
        let mut filled = 0usize;
        for zone in self
            .zones
            .iter()
            .filter(|z| z.end() > start_lba && ro.matches(z))
        {
            if filled == zones.len() {
                break;
            }
            zones[filled] = zone.clone();
            filled += 1;
        }
        Ok(filled as u32)
    }

    fn pread(
        &mut self,
        zone: &Zone,
        buf: &mut [u8],
        lba_count: u32,
        lba_ofst: u64,
    ) -> ZbdResult<u32> {
        let idx = self.zone_index(zone.start)?;
        let current = self.zones[idx].clone();
        self.check_in_zone(&current, lba_count, lba_ofst)?;

        let sz = lba_count as usize * EMULATED_LBA_SIZE as usize;
        let offset = self.byte_offset(&current, lba_ofst);
        self.file.read_exact_at(&mut buf[..sz], offset)?;
        Ok(lba_count)
    }

    fn pwrite(
        &mut self,
        zone: &Zone,
        buf: &[u8],
        lba_count: u32,
        lba_ofst: u64,
    ) -> ZbdResult<u32> {
        let idx = self.zone_index(zone.start)?;
        let current = self.zones[idx].clone();
        self.check_in_zone(&current, lba_count, lba_ofst)?;

        match current.condition {
            ZoneCondition::Offline | ZoneCondition::ReadOnly => {
                return Err(ZbdError::InvalidZone(format!(
                    "zone at LBA {} is not writable",
                    current.start
                )));
            }
            _ => {}
        }

        if current.zone_type == ZoneType::SequentialWriteRequired
            && current.start + lba_ofst != current.write_pointer
        {
            return Err(ZbdError::InvalidZone(format!(
                "unaligned write at LBA {} in sequential zone (write pointer at {})",
                current.start + lba_ofst,
                current.write_pointer
            )));
        }

        let sz = lba_count as usize * EMULATED_LBA_SIZE as usize;
        let offset = self.byte_offset(&current, lba_ofst);
        self.file.write_all_at(&buf[..sz], offset)?;

        let zone = &mut self.zones[idx];
        if zone.is_sequential() {
            zone.write_pointer = zone.start + lba_ofst + lba_count as u64;
            zone.condition = if zone.write_pointer == zone.end() {
                ZoneCondition::Full
            } else {
                ZoneCondition::ImplicitOpen
            };
            self.dirty = true;
            self.persist()?;
        }
        Ok(lba_count)
    }

    fn flush(&mut self, _lba_ofst: u64, _lba_count: u32, _immediate: bool) -> ZbdResult<()> {
        self.file.sync_all()?;
        self.persist()
    }

    fn reset_write_pointer(&mut self, start_lba: u64) -> ZbdResult<()> {
        if start_lba == RESET_ALL_ZONES {
            for zone in self.zones.iter_mut().filter(|z| {
                z.is_sequential()
                    && !matches!(
                        z.condition,
                        ZoneCondition::Offline | ZoneCondition::ReadOnly
                    )
            }) {
                Self::reset_one(zone);
            }
            self.dirty = true;
            return self.persist();
        }

        let idx = self.zone_index(start_lba)?;
        let zone = &mut self.zones[idx];
        if !zone.is_sequential() {
            return Err(ZbdError::InvalidZone(format!(
                "zone at LBA {} is conventional and has no write pointer",
                start_lba
            )));
        }
        if matches!(
            zone.condition,
            ZoneCondition::Offline | ZoneCondition::ReadOnly
        ) {
            return Err(ZbdError::InvalidZone(format!(
                "zone at LBA {} cannot be reset in its current condition",
                start_lba
            )));
        }
        Self::reset_one(zone);
        self.dirty = true;
        self.persist()
    }

    fn set_zones(&mut self, conv_sz: u64, seq_sz: u64) -> ZbdResult<()> {
        if seq_sz == 0 {
            return Err(ZbdError::InvalidZone(
                "sequential zone size cannot be zero".to_string(),
            ));
        }

        let mut zones = Vec::new();
        let mut lba = 0u64;
        if conv_sz > 0 {
            let length = conv_sz.min(self.nr_lbas);
            zones.push(Zone {
                zone_type: ZoneType::Conventional,
                condition: ZoneCondition::NotWritePointer,
                start: 0,
                length,
                write_pointer: 0,
                need_reset: false,
            });
            lba = length;
        }
        while lba < self.nr_lbas {
            // The last zone may be shorter so the table covers the whole
            // device exactly once.
            let length = seq_sz.min(self.nr_lbas - lba);
            zones.push(Zone {
                zone_type: ZoneType::SequentialWriteRequired,
                condition: ZoneCondition::Empty,
                start: lba,
                length,
                write_pointer: lba,
                need_reset: false,
            });
            lba += length;
        }

        info!(
            "{}: zone layout set, {} zones ({} conventional LBAs, {} LBAs per sequential zone)",
            self.path.display(),
            zones.len(),
            conv_sz,
            seq_sz
        );
        self.zones = zones;
        self.dirty = true;
        self.persist()
    }

    fn set_write_pointer(&mut self, start_lba: u64, write_pointer: u64) -> ZbdResult<()> {
        let idx = self.zone_index(start_lba)?;
        let zone = &mut self.zones[idx];
        if !zone.is_sequential() {
            return Err(ZbdError::InvalidZone(format!(
                "zone at LBA {} is conventional and has no write pointer",
                start_lba
            )));
        }
        if write_pointer < zone.start || write_pointer > zone.end() {
            return Err(ZbdError::InvalidZone(format!(
                "write pointer {} outside zone [{}, {}]",
                write_pointer,
                zone.start,
                zone.end()
            )));
        }
        zone.write_pointer = write_pointer;
        zone.condition = if write_pointer == zone.start {
            ZoneCondition::Empty
        } else if write_pointer == zone.end() {
            ZoneCondition::Full
        } else {
            ZoneCondition::ImplicitOpen
        };
        self.dirty = true;
        self.persist()
    }

    fn close(&mut self) -> ZbdResult<()> {
        debug!("{}: closing emulated device", self.path.display());
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ZONE_LBAS: u64 = 16;

    fn emulated_device(size_lbas: u64) -> (NamedTempFile, Box<dyn ZoneOps>) {
        let mut backing = NamedTempFile::new().unwrap();
        backing
            .write_all(&vec![0u8; (size_lbas * EMULATED_LBA_SIZE as u64) as usize])
            .unwrap();
        backing.flush().unwrap();

        let probed = EmulatedBackend
            .open(backing.path(), OpenMode::ReadWrite)
            .unwrap();
        let mut ops = probed.ops;
        ops.set_zones(ZONE_LBAS, ZONE_LBAS).unwrap();
        (backing, ops)
    }

    #[test]
    fn sequential_write_must_land_on_write_pointer() {
        let (_backing, mut ops) = emulated_device(64);
        let mut zones = vec![
            Zone {
                zone_type: ZoneType::Conventional,
                condition: ZoneCondition::NotWritePointer,
                start: 0,
                length: 0,
                write_pointer: 0,
                need_reset: false,
            };
            4
        ];
        assert_eq!(
            ops.report_zones(0, ReportingOptions::All, &mut zones).unwrap(),
            4
        );

        let seq = zones[1].clone();
        let data = vec![0xA5u8; 2 * EMULATED_LBA_SIZE as usize];

        // Not at the write pointer: rejected.
        let err = ops.pwrite(&seq, &data, 2, 4).unwrap_err();
        assert_eq!(err.errno(), -libc::EINVAL);

        // At the write pointer: accepted and the pointer advances.
        assert_eq!(ops.pwrite(&seq, &data, 2, 0).unwrap(), 2);
        let mut one = vec![seq.clone()];
        ops.report_zones(seq.start, ReportingOptions::All, &mut one)
            .unwrap();
        assert_eq!(one[0].write_pointer, seq.start + 2);
        assert_eq!(one[0].condition, ZoneCondition::ImplicitOpen);
    }

    #[test]
    fn writing_a_zone_to_its_end_makes_it_full() {
        let (_backing, mut ops) = emulated_device(32);
        let mut zones = vec![
            Zone {
                zone_type: ZoneType::Conventional,
                condition: ZoneCondition::NotWritePointer,
                start: 0,
                length: 0,
                write_pointer: 0,
                need_reset: false,
            };
            2
        ];
        ops.report_zones(0, ReportingOptions::All, &mut zones).unwrap();

        let seq = zones[1].clone();
        let data = vec![0x5Au8; (ZONE_LBAS * EMULATED_LBA_SIZE as u64) as usize];
        assert_eq!(ops.pwrite(&seq, &data, ZONE_LBAS as u32, 0).unwrap(), 16);

        let mut one = vec![seq.clone()];
        ops.report_zones(seq.start, ReportingOptions::Full, &mut one)
            .unwrap();
        assert_eq!(one[0].condition, ZoneCondition::Full);
        assert_eq!(one[0].write_pointer, one[0].end());
    }

    #[test]
    fn unconfigured_device_reports_no_zones() {
        let mut backing = NamedTempFile::new().unwrap();
        backing.write_all(&[0u8; 4096]).unwrap();
        let probed = EmulatedBackend
            .open(backing.path(), OpenMode::ReadOnly)
            .unwrap();
        let mut ops = probed.ops;
        assert_eq!(ops.nr_zones(0, ReportingOptions::All).unwrap(), 0);
    }

    #[test]
    fn set_zones_rejects_zero_sequential_size() {
        let (_backing, mut ops) = emulated_device(32);
        let err = ops.set_zones(0, 0).unwrap_err();
        assert_eq!(err.errno(), -libc::EINVAL);
    }
}
