//! Pure aggregations over decoded `Things` responses.
//!
//! Every function that needs observations returns `None` when
//! [`has_observations`] does not hold.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, Month, NaiveDateTime};
use serde_json::Value;

use super::model::{Datastream, QueryOptions, Selects, Thing};

/// First thing has a datastream with an id and an observation list.
pub fn has_observations(things: &[Thing]) -> bool {
    first_datastream(things)
        .map(|ds| ds.id.is_some() && ds.observations.is_some())
        .unwrap_or(false)
}

/// First thing has a datastream with an id and a unit of measurement.
pub fn has_units(things: &[Thing]) -> bool {
    first_datastream(things)
        .map(|ds| ds.id.is_some() && ds.unit_of_measurement.is_some())
        .unwrap_or(false)
}

pub(crate) fn first_datastream(things: &[Thing]) -> Option<&Datastream> {
    things.first()?.datastreams.as_ref()?.first()
}

fn datastreams(things: &[Thing]) -> &[Datastream] {
    things
        .first()
        .and_then(|thing| thing.datastreams.as_deref())
        .unwrap_or_default()
}

/// Sum of the first datastream's results.
pub fn sum_observations(things: &[Thing]) -> Option<f64> {
    if !has_observations(things) {
        return None;
    }
    Some(
        first_datastream(things)?
            .observations()
            .iter()
            .filter_map(|obs| obs.result)
            .sum(),
    )
}

/// Chart label of a datastream.
///
/// Multi-valued, caller-adjustable parameters are spelled out and joined with
/// `" und "`. Without those, the values of the default-label parameters are
/// concatenated; failing that, `options.default_label` is used.
pub fn label_for(datastream: &Datastream, selects: &Selects, options: &QueryOptions) -> String {
    let label = selects
        .iter()
        .filter(|(_, select)| !select.overwritten && select.value.is_multi())
        .map(|(name, select)| {
            format!(
                "{}: '{}'",
                select.description,
                property_text(datastream.properties.get(name))
            )
        })
        .collect::<Vec<_>>()
        .join(" und ");
    if !label.is_empty() {
        return label;
    }

    let label: String = selects
        .iter()
        .filter(|(_, select)| select.is_default_label)
        .map(|(name, _)| property_text(datastream.properties.get(name)))
        .collect();
    if !label.is_empty() {
        return label;
    }

    options.default_label.clone().unwrap_or_default()
}

fn property_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Per-label sum of all results.
pub fn bucket_observations(
    things: &[Thing],
    selects: &Selects,
    options: &QueryOptions,
) -> Option<BTreeMap<String, f64>> {
    if !has_observations(things) {
        return None;
    }
    let mut buckets = BTreeMap::new();
    for ds in datastreams(things) {
        let sum: f64 = ds.observations().iter().filter_map(|obs| obs.result).sum();
        buckets.insert(label_for(ds, selects, options), sum);
    }
    Some(buckets)
}

/// Per-label first result with its unit symbol, e.g. `"42 km/h"`. Datastreams
/// without a first result are skipped.
pub fn bucket_single_values(
    things: &[Thing],
    selects: &Selects,
    options: &QueryOptions,
) -> Option<BTreeMap<String, String>> {
    if !has_observations(things) {
        return None;
    }
    let mut buckets = BTreeMap::new();
    for ds in datastreams(things) {
        let Some(result) = ds.observations().first().and_then(|obs| obs.result) else {
            continue;
        };
        let symbol = ds
            .unit_of_measurement
            .as_ref()
            .and_then(|unit| unit.symbol.as_deref())
            .unwrap_or_default();
        buckets.insert(
            label_for(ds, selects, options),
            format!("{} {}", result, symbol).trim_end().to_string(),
        );
    }
    Some(buckets)
}

/// Start of a phenomenon time that may be an interval `a/b`.
pub fn parse_phenomenon_time(phenomenon_time: &str) -> &str {
    phenomenon_time
        .split('/')
        .next()
        .unwrap_or(phenomenon_time)
}

/// Oldest phenomenon time of the first datastream, never later than `not_after`.
/// Times are compared as ISO 8601 strings.
pub fn first_date(things: &[Thing], not_after: &str) -> Option<String> {
    if !has_observations(things) {
        return None;
    }
    Some(oldest(first_datastream(things)?, not_after))
}

fn oldest(ds: &Datastream, not_after: &str) -> String {
    ds.observations()
        .iter()
        .filter_map(|obs| obs.phenomenon_time.as_deref())
        .map(parse_phenomenon_time)
        .fold(not_after, |first, time| if time < first { time } else { first })
        .to_string()
}

/// Per-label oldest phenomenon time, rendered by `format`. Times that do not parse
/// are passed through unchanged.
pub fn bucket_dates(
    things: &[Thing],
    selects: &Selects,
    options: &QueryOptions,
    not_after: &str,
    format: impl Fn(NaiveDateTime) -> String,
) -> Option<BTreeMap<String, String>> {
    if !has_observations(things) {
        return None;
    }
    let mut dates = BTreeMap::new();
    for ds in datastreams(things) {
        let first = oldest(ds, not_after);
        let rendered = super::model::parse_instant(&first)
            .map(&format)
            .unwrap_or(first);
        dates.insert(label_for(ds, selects, options), rendered);
    }
    Some(dates)
}

/// Busiest calendar month of one label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonthPeak {
    /// 1-based month; `None` if no month had a positive sum.
    pub month: Option<u32>,
    pub sum: f64,
}

impl MonthPeak {
    /// English month name, or an empty string without a peak.
    pub fn month_name(&self) -> &'static str {
        self.month
            .and_then(|m| u8::try_from(m).ok())
            .and_then(|m| Month::try_from(m).ok())
            .map(|m| m.name())
            .unwrap_or("")
    }
}

/// Per label, the month whose results add up to the highest sum. Ties keep the
/// month that reached the sum first in observation order.
pub fn highest_month(
    things: &[Thing],
    selects: &Selects,
    options: &QueryOptions,
) -> Option<BTreeMap<String, MonthPeak>> {
    if !has_observations(things) {
        return None;
    }
    let mut peaks = BTreeMap::new();
    for ds in datastreams(things) {
        let mut sums: HashMap<u32, f64> = HashMap::new();
        let mut peak = MonthPeak {
            month: None,
            sum: 0.0,
        };
        for obs in ds.observations() {
            let (Some(time), Some(result)) = (obs.phenomenon_time.as_deref(), obs.result) else {
                continue;
            };
            let Some(instant) = super::model::parse_instant(parse_phenomenon_time(time)) else {
                continue;
            };
            let sum = sums.entry(instant.month()).or_insert(0.0);
            *sum += result;
            if *sum > peak.sum {
                peak = MonthPeak {
                    month: Some(instant.month()),
                    sum: *sum,
                };
            }
        }
        peaks.insert(label_for(ds, selects, options), peak);
    }
    Some(peaks)
}
