//! Metric data model and numeric codec.
//!
//! A [`MetricRecord`] is the unit exchanged on the wire and in storage.
//! The wire `type` field is an open string so that malformed requests
//! survive deserialization and can be rejected with the protocol's own
//! error message; [`MetricKind`] is the closed set it must validate
//! against. Exactly one of `value` / `delta` carries meaning, determined
//! by the kind: gauges replace on write, counters accumulate deltas.

use crate::error::VitalsError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Mapping from metric id to gauge value (last-value semantics).
pub type GaugeMap = HashMap<String, f64>;

/// Mapping from metric id to counter value (accumulating semantics).
pub type CounterMap = HashMap<String, i64>;

/// Maximum id length accepted by the SQL schema.
pub const METRIC_NAME_MAX: usize = 64;

/// The closed set of metric kinds. Any other value on the wire is a
/// protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}

impl FromStr for MetricKind {
    type Err = VitalsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(Self::Gauge),
            "counter" => Ok(Self::Counter),
            other => Err(VitalsError::UnknownMetricKind { kind: other.to_string() }),
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single metric update or lookup result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    /// Open on the wire; validate with [`MetricRecord::parse_kind`].
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
}

impl MetricRecord {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge.as_str().to_string(),
            value: Some(value),
            delta: None,
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter.as_str().to_string(),
            value: None,
            delta: Some(delta),
        }
    }

    /// Validate the open wire field against the closed kind set.
    pub fn parse_kind(&self) -> Result<MetricKind, VitalsError> {
        self.kind.parse()
    }

    /// The formatted value as rendered on the text surface.
    pub fn format_value(&self) -> String {
        match self.delta {
            Some(delta) => format_counter(delta),
            None => format_gauge(self.value.unwrap_or_default()),
        }
    }
}

/// Format a gauge as the shortest round-trippable decimal, without an
/// exponent, trailing zeros or a trailing dot. `f64`'s `Display` already
/// produces exactly that form.
pub fn format_gauge(v: f64) -> String {
    format!("{v}")
}

/// Format a counter as a decimal integer.
pub fn format_counter(v: i64) -> String {
    v.to_string()
}

pub fn parse_gauge(s: &str) -> Result<f64, VitalsError> {
    s.parse::<f64>().map_err(|_| VitalsError::InvalidMetricValue { raw: s.to_string() })
}

pub fn parse_counter(s: &str) -> Result<i64, VitalsError> {
    s.parse::<i64>().map_err(|_| VitalsError::InvalidMetricValue { raw: s.to_string() })
}
