//! Pixel records and the normalization boundary
//!
//! Ledger entries are loosely typed; [`normalize`] is the single place where
//! they are coerced into a [`Record`] or rejected as malformed.

use crate::common::{Error, Result};
use crate::ledger::LedgerEntry;
use serde::{Deserialize, Serialize};

/// Recency of a write. Orders by position, then by log index inside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp {
    pub position: u64,
    pub log_index: u32,
}

impl Stamp {
    pub fn new(position: u64, log_index: u32) -> Self {
        Self {
            position,
            log_index,
        }
    }
}

/// Latest known state of one pixel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub x: u32,
    pub y: u32,
    pub color: u32,
    pub placed_by: String,
    pub placed_at: u64,
    #[serde(skip)]
    pub stamp: Stamp,
}

/// Canvas geometry; maps coordinates to cache keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canvas {
    resolution: u32,
}

impl Canvas {
    /// `resolution` must be a power of two (checked by config validation)
    pub fn new(resolution: u32) -> Self {
        debug_assert!(resolution.is_power_of_two());
        Self { resolution }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Number of addressable pixels
    pub fn capacity(&self) -> u64 {
        self.resolution as u64 * self.resolution as u64
    }

    pub fn key(&self, x: u32, y: u32) -> u64 {
        x as u64 + y as u64 * self.resolution as u64
    }

    pub fn coords(&self, key: u64) -> (u32, u32) {
        let res = self.resolution as u64;
        ((key % res) as u32, (key / res) as u32)
    }

    pub fn contains(&self, x: u64, y: u64) -> bool {
        x < self.resolution as u64 && y < self.resolution as u64
    }

    /// Validate caller-supplied coordinates
    pub fn check(&self, x: u64, y: u64) -> Result<(u32, u32)> {
        if !self.contains(x, y) {
            return Err(Error::OutOfBounds {
                x,
                y,
                resolution: self.resolution,
            });
        }
        Ok((x as u32, y as u32))
    }
}

/// Coerce a ledger entry into a record.
///
/// Every field except `log_index` (defaults to 0) is required. Coordinates must
/// lie on the canvas and color must fit 32 bits.
/// Longest placer id a snapshot can hold (u16 length prefix)
pub const MAX_PLACER_ID_LEN: usize = u16::MAX as usize;

pub fn normalize(entry: &LedgerEntry, canvas: &Canvas) -> Result<Record> {
    fn field<T: Copy>(value: Option<T>, name: &str) -> Result<T> {
        value.ok_or_else(|| Error::Malformed(format!("missing {}", name)))
    }

    let x = field(entry.x, "x")?;
    let y = field(entry.y, "y")?;
    let color = field(entry.color, "color")?;
    let placed_at = field(entry.timestamp, "timestamp")?;
    let position = field(entry.position, "position")?;

    let placed_by = match entry.user.as_deref() {
        Some(user) if !user.is_empty() => user.to_string(),
        _ => return Err(Error::Malformed("missing user".into())),
    };
    if placed_by.len() > MAX_PLACER_ID_LEN {
        return Err(Error::Malformed(format!(
            "user id of {} bytes exceeds {}",
            placed_by.len(),
            MAX_PLACER_ID_LEN
        )));
    }

    if !canvas.contains(x, y) {
        return Err(Error::Malformed(format!(
            "coordinate ({}, {}) outside canvas of {}",
            x,
            y,
            canvas.resolution()
        )));
    }
    let color = u32::try_from(color)
        .map_err(|_| Error::Malformed(format!("color {:#x} wider than 32 bits", color)))?;
    let log_index = u32::try_from(entry.log_index.unwrap_or(0))
        .map_err(|_| Error::Malformed("log index wider than 32 bits".into()))?;

    Ok(Record {
        x: x as u32,
        y: y as u32,
        color,
        placed_by,
        placed_at,
        stamp: Stamp::new(position, log_index),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LedgerEntry {
        LedgerEntry::placement("0xabc", 3, 4, 0xff0000, 1_700_000_000, 42, 1)
    }

    #[test]
    fn test_stamp_ordering() {
        assert!(Stamp::new(10, 5) < Stamp::new(11, 0));
        assert!(Stamp::new(10, 0) < Stamp::new(10, 1));
        assert_eq!(Stamp::new(7, 2), Stamp::new(7, 2));
    }

    #[test]
    fn test_canvas_keys() {
        let canvas = Canvas::new(1024);
        assert_eq!(canvas.key(0, 0), 0);
        assert_eq!(canvas.key(5, 1), 1029);
        assert_eq!(canvas.coords(1029), (5, 1));
        assert_eq!(canvas.coords(canvas.key(1023, 1023)), (1023, 1023));
        assert_eq!(canvas.capacity(), 1024 * 1024);

        assert!(canvas.check(1023, 0).is_ok());
        assert!(matches!(
            canvas.check(1024, 0),
            Err(Error::OutOfBounds { x: 1024, .. })
        ));
    }

    #[test]
    fn test_normalize_valid_entry() {
        let record = normalize(&entry(), &Canvas::new(1024)).unwrap();
        assert_eq!((record.x, record.y), (3, 4));
        assert_eq!(record.color, 0xff0000);
        assert_eq!(record.placed_by, "0xabc");
        assert_eq!(record.placed_at, 1_700_000_000);
        assert_eq!(record.stamp, Stamp::new(42, 1));
    }

    #[test]
    fn test_normalize_keeps_zero_color() {
        let mut e = entry();
        e.color = Some(0);
        assert_eq!(normalize(&e, &Canvas::new(1024)).unwrap().color, 0);
    }

    #[test]
    fn test_normalize_rejects_malformed() {
        let canvas = Canvas::new(1024);

        let mut missing = entry();
        missing.y = None;
        assert!(matches!(normalize(&missing, &canvas), Err(Error::Malformed(_))));

        let mut outside = entry();
        outside.x = Some(1024);
        assert!(matches!(normalize(&outside, &canvas), Err(Error::Malformed(_))));

        let mut wide = entry();
        wide.color = Some(u64::from(u32::MAX) + 1);
        assert!(matches!(normalize(&wide, &canvas), Err(Error::Malformed(_))));

        let mut anonymous = entry();
        anonymous.user = Some(String::new());
        assert!(normalize(&anonymous, &canvas).is_err());

        assert!(normalize(&LedgerEntry::default(), &canvas).is_err());
    }

    #[test]
    fn test_normalize_rejects_oversized_user() {
        let canvas = Canvas::new(1024);

        // 3-byte chars, so a byte cut at the limit would split one
        let mut long = entry();
        long.user = Some("€".repeat(MAX_PLACER_ID_LEN / 3 + 1));
        assert!(matches!(normalize(&long, &canvas), Err(Error::Malformed(_))));

        let mut at_limit = entry();
        at_limit.user = Some("a".repeat(MAX_PLACER_ID_LEN));
        assert!(normalize(&at_limit, &canvas).is_ok());
    }

    #[test]
    fn test_record_json_shape() {
        let record = normalize(&entry(), &Canvas::new(1024)).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "x": 3, "y": 4, "color": 0xff0000,
                "placedBy": "0xabc", "placedAt": 1_700_000_000u64
            })
        );
    }
}
