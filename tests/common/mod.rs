// Shared fixtures for the integration tests.
//
// Every test drives a real `Device` bound to the emulated backend over a
// file in a temporary directory, so the zone table sidecar is cleaned up
// with the directory.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use tempfile::TempDir;
use zbd::{Device, OpenMode};

pub const LBA_SIZE: usize = 512;

/// Create a zeroed backing file of `lbas` logical blocks.
pub fn backing_file(lbas: u64) -> (TempDir, PathBuf) {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("zoned.img");
    let mut file = File::create(&path).unwrap();
    file.write_all(&vec![0u8; lbas as usize * LBA_SIZE]).unwrap();
    file.sync_all().unwrap();
    (dir, path)
}

/// Open an emulated device of `lbas` blocks with `conv_sz` conventional
/// LBAs up front and `seq_sz`-LBA sequential zones after.
pub fn configured_device(lbas: u64, conv_sz: u64, seq_sz: u64) -> (TempDir, PathBuf, Device) {
    let (dir, path) = backing_file(lbas);
    let mut dev = Device::open(&path, OpenMode::ReadWrite).unwrap();
    dev.set_zones(conv_sz, seq_sz).unwrap();
    (dir, path, dev)
}

/// A buffer of `lbas` blocks filled with `byte`.
pub fn pattern(lbas: u32, byte: u8) -> Vec<u8> {
    vec![byte; lbas as usize * LBA_SIZE]
}
