// Unit tests for the handle-level operations, driven against a mocked
// backend ops table so pagination arithmetic and error normalization can
// be checked without a device.

use mockall::Sequence;

use crate::backend::{MockZoneOps, ZoneOps};
use crate::device::{Device, DeviceInfo, DeviceType, ZonedModel};
use crate::zone::{ReportingOptions, Zone, ZoneCondition, ZoneType};
use crate::ZbdError;

const ZONE_LBAS: u64 = 16;
const LBA_SIZE: u32 = 512;

fn mock_info() -> DeviceInfo {
    DeviceInfo {
        device_type: DeviceType::Emulated,
        zoned_model: ZonedModel::HostManaged,
        vendor_id: "MOCK".to_string(),
        nr_lbas: 5 * ZONE_LBAS,
        lba_size: LBA_SIZE,
        nr_physical_blocks: 5 * ZONE_LBAS / 8,
        physical_block_size: 4096,
    }
}

fn seq_zone(start: u64) -> Zone {
    Zone {
        zone_type: ZoneType::SequentialWriteRequired,
        condition: ZoneCondition::Empty,
        start,
        length: ZONE_LBAS,
        write_pointer: start,
        need_reset: false,
    }
}

fn blank_zones(n: usize) -> Vec<Zone> {
    vec![seq_zone(0); n]
}

fn device(mut ops: MockZoneOps) -> Device {
    // Dropping the handle closes the backend; keep the mock permissive
    // about it so each test only states what it is actually checking.
    ops.expect_close().returning(|| Ok(()));
    Device::with_ops(Box::new(ops), mock_info())
}

#[test]
fn pagination_advances_the_cursor_zone_by_zone() {
    let mut ops = MockZoneOps::new();
    let mut seq = Sequence::new();

    // The backend hands out at most two zones per call; the aggregator
    // must come back with the cursor at the end of the previous batch.
    for (expected_start, batch) in [(0u64, 2usize), (32, 2), (64, 1)] {
        ops.expect_report_zones()
            .times(1)
            .in_sequence(&mut seq)
            .withf(move |start, _, _| *start == expected_start)
            .returning(move |start, _, zones| {
                for (i, slot) in zones.iter_mut().enumerate().take(batch) {
                    *slot = seq_zone(start + i as u64 * ZONE_LBAS);
                }
                Ok(batch as u32)
            });
    }

    let mut dev = device(ops);
    let mut zones = blank_zones(5);
    let n = dev.report_zones(0, ReportingOptions::All, &mut zones).unwrap();

    assert_eq!(n, 5);
    for (i, zone) in zones.iter().enumerate() {
        assert_eq!(zone.start, i as u64 * ZONE_LBAS);
    }
}

#[test]
fn pagination_stops_on_an_empty_batch() {
    let mut ops = MockZoneOps::new();
    let mut seq = Sequence::new();

    ops.expect_report_zones()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|start, _, zones| {
            zones[0] = seq_zone(start);
            Ok(1)
        });
    ops.expect_report_zones()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _| Ok(0));

    let mut dev = device(ops);
    let mut zones = blank_zones(8);
    let n = dev.report_zones(0, ReportingOptions::All, &mut zones).unwrap();
    assert_eq!(n, 1);
}

#[test]
fn count_only_report_is_a_single_backend_call() {
    let mut ops = MockZoneOps::new();
    ops.expect_nr_zones().times(1).returning(|_, _| Ok(5));
    ops.expect_report_zones().times(0);

    let mut dev = device(ops);
    assert_eq!(dev.report_nr_zones(0, ReportingOptions::All).unwrap(), 5);
}

#[test]
fn pagination_error_discards_partial_count() {
    let mut ops = MockZoneOps::new();
    let mut seq = Sequence::new();

    ops.expect_report_zones()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|start, _, zones| {
            zones[0] = seq_zone(start);
            zones[1] = seq_zone(start + ZONE_LBAS);
            Ok(2)
        });
    ops.expect_report_zones()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _| {
            Err(ZbdError::Io(std::io::Error::from_raw_os_error(libc::EIO)))
        });

    let mut dev = device(ops);
    let mut zones = blank_zones(5);
    // The two zones of the first batch are in the buffer, but the error
    // return carries no partial count.
    let err = dev
        .report_zones(0, ReportingOptions::All, &mut zones)
        .unwrap_err();
    assert_eq!(err.errno(), -libc::EIO);
}

#[test]
fn list_zones_sizes_then_fills() {
    let mut ops = MockZoneOps::new();
    ops.expect_nr_zones().times(1).returning(|_, _| Ok(3));
    ops.expect_report_zones().times(1).returning(|start, _, zones| {
        for (i, slot) in zones.iter_mut().enumerate().take(3) {
            *slot = seq_zone(start + i as u64 * ZONE_LBAS);
        }
        Ok(3)
    });

    let mut dev = device(ops);
    let zones = dev.list_zones(0, ReportingOptions::All).unwrap();
    assert_eq!(zones.len(), 3);
    for pair in zones.windows(2) {
        assert_eq!(pair[0].end(), pair[1].start);
    }
}

#[test]
fn zero_length_io_never_reaches_the_backend() {
    let mut ops = MockZoneOps::new();
    ops.expect_pread().times(0);
    ops.expect_pwrite().times(0);

    let mut dev = device(ops);
    let zone = seq_zone(0);
    let mut buf = [0u8; 0];
    assert_eq!(dev.pread(&zone, &mut buf, 0, 0).unwrap(), 0);
    assert_eq!(dev.pwrite(&zone, &buf, 0, 0).unwrap(), 0);
}

#[test]
fn short_transfers_pass_through_unchanged() {
    let mut ops = MockZoneOps::new();
    ops.expect_pread().times(1).returning(|_, _, _, _| Ok(1));

    let mut dev = device(ops);
    let zone = seq_zone(0);
    let mut buf = vec![0u8; 4 * LBA_SIZE as usize];
    // 4 blocks requested, 1 came back: the caller gets the short count.
    assert_eq!(dev.pread(&zone, &mut buf, 4, 0).unwrap(), 1);
}

#[test]
fn zero_byte_transfer_is_io_error() {
    let mut ops = MockZoneOps::new();
    ops.expect_pread().times(1).returning(|_, _, _, _| Ok(0));
    ops.expect_pwrite().times(1).returning(|_, _, _, _| Ok(0));

    let mut dev = device(ops);
    let zone = seq_zone(0);
    let mut buf = vec![0u8; 2 * LBA_SIZE as usize];
    assert_eq!(dev.pread(&zone, &mut buf, 2, 0).unwrap_err().errno(), -libc::EIO);
    assert_eq!(dev.pwrite(&zone, &buf, 2, 0).unwrap_err().errno(), -libc::EIO);
}

#[test]
fn undersized_buffer_is_rejected_before_any_io() {
    let mut ops = MockZoneOps::new();
    ops.expect_pread().times(0);

    let mut dev = device(ops);
    let zone = seq_zone(0);
    let mut buf = vec![0u8; LBA_SIZE as usize];
    let err = dev.pread(&zone, &mut buf, 2, 0).unwrap_err();
    assert_eq!(err.errno(), -libc::EFAULT);
}

#[test]
fn flush_uses_the_whole_device_sentinel() {
    let mut ops = MockZoneOps::new();
    ops.expect_flush()
        .times(1)
        .withf(|ofst, count, immediate| *ofst == 0 && *count == 0 && !*immediate)
        .returning(|_, _, _| Ok(()));

    let mut dev = device(ops);
    dev.flush().unwrap();
}

#[test]
fn explicit_close_releases_the_backend_once() {
    let mut ops = MockZoneOps::new();
    ops.expect_close().times(1).returning(|| Ok(()));
    Device::with_ops(Box::new(ops), mock_info()).close().unwrap();
}

#[test]
fn dropped_handles_close_the_backend() {
    let mut ops = MockZoneOps::new();
    ops.expect_close().times(1).returning(|| Ok(()));
    drop(Device::with_ops(Box::new(ops), mock_info()));
}

/// Ops table with no optional capabilities: the trait's default bodies
/// must answer "not supported" without a device round trip.
struct RequiredOnlyOps;

impl ZoneOps for RequiredOnlyOps {
    fn backend(&self) -> &'static str {
        "required-only"
    }

    fn nr_zones(&mut self, _: u64, _: ReportingOptions) -> crate::ZbdResult<u32> {
        panic!("device contacted");
    }

    fn report_zones(
        &mut self,
        _: u64,
        _: ReportingOptions,
        _: &mut [Zone],
    ) -> crate::ZbdResult<u32> {
        panic!("device contacted");
    }

    fn pread(&mut self, _: &Zone, _: &mut [u8], _: u32, _: u64) -> crate::ZbdResult<u32> {
        panic!("device contacted");
    }

    fn pwrite(&mut self, _: &Zone, _: &[u8], _: u32, _: u64) -> crate::ZbdResult<u32> {
        panic!("device contacted");
    }

    fn flush(&mut self, _: u64, _: u32, _: bool) -> crate::ZbdResult<()> {
        panic!("device contacted");
    }

    fn reset_write_pointer(&mut self, _: u64) -> crate::ZbdResult<()> {
        panic!("device contacted");
    }

    fn close(&mut self) -> crate::ZbdResult<()> {
        Ok(())
    }
}

#[test]
fn optional_operations_fail_without_device_contact() {
    let mut dev = Device::with_ops(Box::new(RequiredOnlyOps), mock_info());

    let err = dev.set_zones(0, 1024).unwrap_err();
    assert_eq!(err.errno(), -libc::ENXIO);

    let err = dev.set_write_pointer(0, 8).unwrap_err();
    assert_eq!(err.errno(), -libc::ENXIO);
}
