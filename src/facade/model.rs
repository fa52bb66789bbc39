//! Typed view of the remote service's `Things` responses and of the caller's
//! parameter selection.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fill::parse_timestamp;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitOfMeasurement {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub definition: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(rename = "phenomenonTime", default)]
    pub phenomenon_time: Option<String>,
    #[serde(default)]
    pub result: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Datastream {
    #[serde(rename = "@iot.id", default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(rename = "unitOfMeasurement", default)]
    pub unit_of_measurement: Option<UnitOfMeasurement>,
    #[serde(rename = "resultTime", default)]
    pub result_time: Option<String>,
    #[serde(rename = "Observations", default)]
    pub observations: Option<Vec<Observation>>,
}

impl Datastream {
    /// The `@iot.id` as used in topic names.
    pub fn id_string(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn observations(&self) -> &[Observation] {
        self.observations.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    #[serde(rename = "@iot.id", default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Option<BTreeMap<String, Value>>,
    #[serde(rename = "Datastreams", default)]
    pub datastreams: Option<Vec<Datastream>>,
}

/// Decode a response into things. Accepts a single entity, an array of entities or
/// a collection wrapper with a `value` array.
pub fn things_from_value(value: &Value) -> Result<Vec<Thing>, String> {
    let decoded = match value {
        Value::Array(_) => serde_json::from_value(value.clone()),
        Value::Object(map) => match map.get("value") {
            Some(inner @ Value::Array(_)) => serde_json::from_value(inner.clone()),
            _ => serde_json::from_value(value.clone()).map(|thing| vec![thing]),
        },
        other => return Err(format!("expected an object or array, got {}", other)),
    };
    decoded.map_err(|e| e.to_string())
}

/// Selected parameter values. Either one value or several (one label per datastream).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectValue {
    Many(Vec<Value>),
    One(Value),
}

impl SelectValue {
    pub fn is_multi(&self) -> bool {
        matches!(self, SelectValue::Many(values) if values.len() > 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub value: SelectValue,
    #[serde(default)]
    pub description: String,
    /// Fixed by the caller; never part of a label.
    #[serde(default)]
    pub overwritten: bool,
    #[serde(rename = "isDefaultLabel", default)]
    pub is_default_label: bool,
}

/// Parameter name -> selection. Ordered, so the JSON form is a stable cache key.
pub type Selects = BTreeMap<String, Select>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(rename = "defaultLabel", default)]
    pub default_label: Option<String>,
}

/// Everything that identifies one datastream query against a thing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorQuery {
    pub thing_id: u64,
    /// `$filter` expression for the datastreams, passed through verbatim.
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub selects: Selects,
    #[serde(default)]
    pub options: QueryOptions,
}

impl SensorQuery {
    pub fn new(thing_id: u64, filter: impl Into<String>) -> Self {
        Self {
            thing_id,
            filter: filter.into(),
            ..Self::default()
        }
    }

    pub fn with_selects(mut self, selects: Selects) -> Self {
        self.selects = selects;
        self
    }

    pub fn with_default_label(mut self, label: impl Into<String>) -> Self {
        self.options.default_label = Some(label.into());
        self
    }
}

/// Datastreams of a running total on one thing. Whole weeks before the current
/// ISO week come from `weekly_filter`; the current week comes from the finer
/// `recent_filter`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalQuery {
    pub thing_id: u64,
    pub weekly_filter: String,
    pub recent_filter: String,
}

/// Inclusive date range of a dataset query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSetting {
    pub from: NaiveDate,
    pub until: NaiveDate,
    /// Aggregation interval name of the datastreams, e.g. `15-Min`.
    #[serde(default)]
    pub interval: Option<String>,
}

/// Parse a phenomenon or result time. RFC 3339 instants are converted to UTC.
pub fn parse_instant(s: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_utc())
        .ok()
        .or_else(|| parse_timestamp(s))
}
