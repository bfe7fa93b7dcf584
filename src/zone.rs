// Zone state model for ZBC/ZAC devices.
//
// Zones are transient value objects: a report produces them, nothing in
// this crate mutates them afterwards. State changes on the device are
// observed by reporting again.

use serde::{Deserialize, Serialize};

/// Sentinel LBA selecting every zone, accepted by
/// [`crate::Device::reset_write_pointer`].
pub const RESET_ALL_ZONES: u64 = u64::MAX;

/// Type of zone.
///
/// Discriminants are the ZBC/ZAC zone descriptor codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ZoneType {
    /// Conventional zone, supports random writes.
    Conventional = 0x1,

    /// Sequential write required zone.
    SequentialWriteRequired = 0x2,

    /// Sequential write preferred zone.
    SequentialWritePreferred = 0x3,
}

impl ZoneType {
    pub(crate) fn from_wire(code: u8) -> Option<Self> {
        match code {
            0x1 => Some(ZoneType::Conventional),
            0x2 => Some(ZoneType::SequentialWriteRequired),
            0x3 => Some(ZoneType::SequentialWritePreferred),
            _ => None,
        }
    }
}

/// Zone condition.
///
/// Discriminants are the ZBC/ZAC zone descriptor codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ZoneCondition {
    /// Conventional zone, no write pointer.
    NotWritePointer = 0x0,

    /// Zone is empty: write pointer at the zone start.
    Empty = 0x1,

    /// Zone was opened by a write.
    ImplicitOpen = 0x2,

    /// Zone was opened explicitly.
    ExplicitOpen = 0x3,

    /// Zone is closed.
    Closed = 0x4,

    /// Zone is read-only.
    ReadOnly = 0xD,

    /// Zone is full: write pointer one past the zone's last LBA.
    Full = 0xE,

    /// Zone is offline.
    Offline = 0xF,
}

impl ZoneCondition {
    pub(crate) fn from_wire(code: u8) -> Option<Self> {
        match code {
            0x0 => Some(ZoneCondition::NotWritePointer),
            0x1 => Some(ZoneCondition::Empty),
            0x2 => Some(ZoneCondition::ImplicitOpen),
            0x3 => Some(ZoneCondition::ExplicitOpen),
            0x4 => Some(ZoneCondition::Closed),
            0xD => Some(ZoneCondition::ReadOnly),
            0xE => Some(ZoneCondition::Full),
            0xF => Some(ZoneCondition::Offline),
            _ => None,
        }
    }
}

/// A single zone of a zoned block device.
///
/// For any two zones reported from the same device snapshot,
/// `start + length` of one zone is the `start` of the next: the report is
/// ascending, contiguous and non-overlapping. For write-pointer zones the
/// pointer always satisfies `start <= write_pointer <= start + length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Type of the zone.
    pub zone_type: ZoneType,

    /// Current condition of the zone.
    pub condition: ZoneCondition,

    /// First LBA of the zone.
    pub start: u64,

    /// Length of the zone in logical blocks.
    pub length: u64,

    /// Current write pointer LBA. Meaningless for conventional zones.
    pub write_pointer: u64,

    /// Reset recommended bit from the zone descriptor.
    pub need_reset: bool,
}

impl Zone {
    /// True for conventional zones.
    pub fn is_conventional(&self) -> bool {
        self.zone_type == ZoneType::Conventional
    }

    /// True for zones with sequential write semantics.
    pub fn is_sequential(&self) -> bool {
        matches!(
            self.zone_type,
            ZoneType::SequentialWriteRequired | ZoneType::SequentialWritePreferred
        )
    }

    /// True when the write pointer sits at the zone start.
    pub fn is_empty(&self) -> bool {
        self.condition == ZoneCondition::Empty
    }

    /// True when the write pointer is one past the zone's last LBA.
    pub fn is_full(&self) -> bool {
        self.condition == ZoneCondition::Full
    }

    /// True when the zone accepts writes in its current condition.
    pub fn is_writable(&self) -> bool {
        matches!(
            self.condition,
            ZoneCondition::NotWritePointer
                | ZoneCondition::Empty
                | ZoneCondition::ImplicitOpen
                | ZoneCondition::ExplicitOpen
        )
    }

    /// True when the zone must be reset before it can be rewritten.
    pub fn needs_reset(&self) -> bool {
        self.need_reset || matches!(self.condition, ZoneCondition::Full | ZoneCondition::Closed)
    }

    /// LBA one past the end of the zone.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Filter restricting which zones a report returns.
///
/// Passed through opaquely to hardware backends (low nibble of the command's
/// reporting-options field); the emulated backend interprets it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReportingOptions {
    /// All zones.
    All = 0x00,

    /// Zones in the empty condition.
    Empty = 0x01,

    /// Implicitly open zones.
    ImplicitOpen = 0x02,

    /// Explicitly open zones.
    ExplicitOpen = 0x03,

    /// Closed zones.
    Closed = 0x04,

    /// Full zones.
    Full = 0x05,

    /// Read-only zones.
    ReadOnly = 0x06,

    /// Offline zones.
    Offline = 0x07,

    /// Conventional zones (no write pointer).
    NotWritePointer = 0x3F,
}

impl ReportingOptions {
    /// Command-level encoding of the filter.
    pub(crate) fn wire(self) -> u8 {
        self as u8
    }

    /// Whether `zone` belongs in a report with this filter.
    pub(crate) fn matches(self, zone: &Zone) -> bool {
        match self {
            ReportingOptions::All => true,
            ReportingOptions::Empty => zone.condition == ZoneCondition::Empty,
            ReportingOptions::ImplicitOpen => zone.condition == ZoneCondition::ImplicitOpen,
            ReportingOptions::ExplicitOpen => zone.condition == ZoneCondition::ExplicitOpen,
            ReportingOptions::Closed => zone.condition == ZoneCondition::Closed,
            ReportingOptions::Full => zone.condition == ZoneCondition::Full,
            ReportingOptions::ReadOnly => zone.condition == ZoneCondition::ReadOnly,
            ReportingOptions::Offline => zone.condition == ZoneCondition::Offline,
            ReportingOptions::NotWritePointer => {
                zone.condition == ZoneCondition::NotWritePointer
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequential_zone(condition: ZoneCondition, wp: u64) -> Zone {
        Zone {
            zone_type: ZoneType::SequentialWriteRequired,
            condition,
            start: 1024,
            length: 512,
            write_pointer: wp,
            need_reset: false,
        }
    }

    #[test]
    fn full_zone_needs_reset() {
        let zone = sequential_zone(ZoneCondition::Full, 1536);
        assert!(zone.needs_reset());
        assert!(!zone.is_writable());
    }

    #[test]
    fn empty_zone_is_writable() {
        let zone = sequential_zone(ZoneCondition::Empty, 1024);
        assert!(zone.is_writable());
        assert!(!zone.needs_reset());
        assert_eq!(zone.end(), 1536);
    }

    #[test]
    fn reporting_options_filter() {
        let zone = sequential_zone(ZoneCondition::Full, 1536);
        assert!(ReportingOptions::All.matches(&zone));
        assert!(ReportingOptions::Full.matches(&zone));
        assert!(!ReportingOptions::Empty.matches(&zone));
        assert!(!ReportingOptions::NotWritePointer.matches(&zone));
    }

    #[test]
    fn wire_codes_round_trip() {
        for ty in [
            ZoneType::Conventional,
            ZoneType::SequentialWriteRequired,
            ZoneType::SequentialWritePreferred,
        ] {
            assert_eq!(ZoneType::from_wire(ty as u8), Some(ty));
        }
        for cond in [
            ZoneCondition::NotWritePointer,
            ZoneCondition::Empty,
            ZoneCondition::ImplicitOpen,
            ZoneCondition::ExplicitOpen,
            ZoneCondition::Closed,
            ZoneCondition::ReadOnly,
            ZoneCondition::Full,
            ZoneCondition::Offline,
        ] {
            assert_eq!(ZoneCondition::from_wire(cond as u8), Some(cond));
        }
        assert_eq!(ZoneType::from_wire(0x9), None);
        assert_eq!(ZoneCondition::from_wire(0x9), None);
    }
}
