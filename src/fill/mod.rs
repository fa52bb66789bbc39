//! Gap filling for sparse time series.
//!
//! Input is a sparse mapping from `YYYY-MM-DD HH:MM:SS` keys to numbers. Every mode
//! zeroes the seconds of the input keys, walks a calendar grid and emits one slot
//! per grid point, with `None` where the input had no reading.

mod calendar;

pub use calendar::{fill_day, fill_flex, fill_week, fill_year, Step, StepUnit};

use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Sparse readings keyed by timestamp string.
pub type SparseSeries = BTreeMap<String, Option<f64>>;

/// Slot key format.
pub const SLOT_FORMAT: &str = "%Y-%m-%d %H:%M:00";

/// Minute interval used by day mode when none is configured.
pub const DEFAULT_DAY_INTERVAL_MINUTES: u32 = 5;

const INPUT_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Errors for gap-filler arguments. Malformed sparse keys are not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillError {
    InvalidAnchor(String),
    InvalidInterval(u32),
    InvalidStep(String),
    InvalidYear(i32),
    OutOfRange,
}

impl std::fmt::Display for FillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FillError::InvalidAnchor(s) => write!(f, "invalid anchor date: {}", s),
            FillError::InvalidInterval(m) => {
                write!(f, "minute interval must be within 1..=60, got {}", m)
            }
            FillError::InvalidStep(s) => write!(f, "invalid step: {}", s),
            FillError::InvalidYear(y) => write!(f, "year {} is out of range", y),
            FillError::OutOfRange => write!(f, "time grid leaves the supported date range"),
        }
    }
}

impl std::error::Error for FillError {}

/// Dense, ordered series produced by the fill functions.
///
/// Serializes as a JSON object whose keys appear in slot order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSlotSeries {
    slots: Vec<(String, Option<f64>)>,
}

impl TimeSlotSeries {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.slots.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|(key, _)| key.as_str())
    }

    /// Value of the slot `key`. `None` for unknown keys and for empty slots alike;
    /// use [`contains_key`](Self::contains_key) to tell them apart.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.slots
            .iter()
            .find(|(slot, _)| slot == key)
            .and_then(|(_, value)| *value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.iter().any(|(slot, _)| slot == key)
    }

    pub fn first_key(&self) -> Option<&str> {
        self.slots.first().map(|(key, _)| key.as_str())
    }

    pub fn last_key(&self) -> Option<&str> {
        self.slots.last().map(|(key, _)| key.as_str())
    }

    /// Number of slots holding a reading.
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|(_, value)| value.is_some()).count()
    }

    pub fn into_inner(self) -> Vec<(String, Option<f64>)> {
        self.slots
    }
}

impl Serialize for TimeSlotSeries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.slots.len()))?;
        for (key, value) in &self.slots {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Parse a sparse-series key. Accepts `YYYY-MM-DD HH:MM[:SS]` with a space or `T`.
pub fn parse_timestamp(key: &str) -> Option<NaiveDateTime> {
    let key = key.trim();
    INPUT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(key, format).ok())
}

/// Parse an anchor given either as a date or as a timestamp.
pub fn parse_anchor(anchor: &str) -> Result<NaiveDateTime, FillError> {
    if let Some(ts) = parse_timestamp(anchor) {
        return Ok(ts);
    }
    NaiveDate::parse_from_str(anchor.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| FillError::InvalidAnchor(anchor.to_string()))
}

/// Readings keyed by minute. Unparseable keys are dropped.
pub(crate) struct MinuteIndex {
    readings: HashMap<NaiveDateTime, Option<f64>>,
}

impl MinuteIndex {
    pub(crate) fn new(sparse: &SparseSeries) -> Self {
        let readings = sparse
            .iter()
            .filter_map(|(key, value)| {
                let minute = parse_timestamp(key)?.with_second(0)?.with_nanosecond(0)?;
                Some((minute, *value))
            })
            .collect();
        Self { readings }
    }

    fn lookup(&self, slot: &NaiveDateTime) -> Option<f64> {
        self.readings.get(slot).copied().flatten()
    }
}

/// Accumulates slots in grid order.
pub(crate) struct SeriesBuilder<'a> {
    index: &'a MinuteIndex,
    slots: Vec<(String, Option<f64>)>,
}

impl<'a> SeriesBuilder<'a> {
    pub(crate) fn new(index: &'a MinuteIndex) -> Self {
        Self {
            index,
            slots: Vec::new(),
        }
    }

    /// Slots are matched and keyed by their minute; seconds never reach a key.
    pub(crate) fn push(&mut self, slot: NaiveDateTime) {
        let minute = slot
            .with_second(0)
            .and_then(|ts| ts.with_nanosecond(0))
            .unwrap_or(slot);
        let value = self.index.lookup(&minute);
        self.slots.push((slot.format(SLOT_FORMAT).to_string(), value));
    }

    pub(crate) fn finish(self) -> TimeSlotSeries {
        TimeSlotSeries { slots: self.slots }
    }
}
