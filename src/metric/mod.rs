//! Typed Metric Values
//!
//! The in-memory side of the pipeline:
//! - [`MetricValue`]: tagged gauge/counter value, the single dispatch point
//!   for merge, formatting and signing input
//! - [`MetricSet`]: one collection tick worth of named values
//! - [`StorageItem`]: the durable `(name, value)` record
//!
//! The wire form lives in [`dto`].

pub mod dto;

use serde::{Deserialize, Serialize};
use std::collections::hash_map::{self, HashMap};
use std::fmt;
use std::str::FromStr;

pub use dto::{FailedMetric, MetricDto};

/// Validation failures for metric input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    /// `type` is neither `gauge` nor `counter`
    UnknownMetricType(String),
    /// `id` is empty
    EmptyMetricName,
    /// Numeric field missing, unparsable, non-finite or a negative counter
    WrongMetricValue(String),
    /// Signature does not match the shared secret
    HashCheckFailed(String),
}

impl fmt::Display for MetricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricError::UnknownMetricType(kind) => write!(f, "unknown metric type: {:?}", kind),
            MetricError::EmptyMetricName => write!(f, "metric name is empty"),
            MetricError::WrongMetricValue(reason) => write!(f, "wrong metric value: {}", reason),
            MetricError::HashCheckFailed(id) => write!(f, "hash check failed for metric {:?}", id),
        }
    }
}

impl std::error::Error for MetricError {}

/// The two metric kinds. Ordering is gauges first, then counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(MetricError::UnknownMetricType(other.to_string())),
        }
    }
}

/// A gauge (last write wins) or a counter delta (additive, never negative)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    /// Build a gauge, rejecting NaN and infinities
    pub fn gauge(value: f64) -> Result<Self, MetricError> {
        if !value.is_finite() {
            return Err(MetricError::WrongMetricValue(format!(
                "gauge must be finite, got {}",
                value
            )));
        }
        Ok(MetricValue::Gauge(value))
    }

    /// Build a counter, rejecting negative deltas
    pub fn counter(delta: i64) -> Result<Self, MetricError> {
        if delta < 0 {
            return Err(MetricError::WrongMetricValue(format!(
                "counter must be non-negative, got {}",
                delta
            )));
        }
        Ok(MetricValue::Counter(delta))
    }

    /// Parse the plain-text form used by path-style updates
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, MetricError> {
        match kind {
            MetricKind::Gauge => {
                let value = raw.trim().parse::<f64>().map_err(|_| {
                    MetricError::WrongMetricValue(format!("not a float: {:?}", raw))
                })?;
                Self::gauge(value)
            }
            MetricKind::Counter => {
                let delta = raw.trim().parse::<i64>().map_err(|_| {
                    MetricError::WrongMetricValue(format!("not an integer: {:?}", raw))
                })?;
                Self::counter(delta)
            }
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// Fold `other` into `self`: gauges are replaced, counters are summed.
    /// A kind mismatch replaces the value outright.
    pub fn merge(&mut self, other: MetricValue) {
        match (self, other) {
            (MetricValue::Counter(current), MetricValue::Counter(delta)) => {
                *current = current.saturating_add(delta);
            }
            (slot, other) => *slot = other,
        }
    }

    /// Signing input, `<kind>:<value>`. Gauges use six fixed decimals.
    pub fn canonical(&self) -> String {
        match self {
            MetricValue::Gauge(value) => format!("gauge:{:.6}", value),
            MetricValue::Counter(delta) => format!("counter:{}", delta),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(value) => write!(f, "{}", value),
            MetricValue::Counter(delta) => write!(f, "{}", delta),
        }
    }
}

/// Durable record: one per `(name, kind)`
#[derive(Debug, Clone, PartialEq)]
pub struct StorageItem {
    pub name: String,
    pub value: MetricValue,
}

impl StorageItem {
    pub fn new(name: impl Into<String>, value: MetricValue) -> Self {
        StorageItem {
            name: name.into(),
            value,
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
}

/// Named values produced by one sampling tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSet {
    items: HashMap<String, MetricValue>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever is stored under `name`
    pub fn insert(&mut self, name: impl Into<String>, value: MetricValue) {
        self.items.insert(name.into(), value);
    }

    /// Merge with kind semantics (gauge replace, counter add)
    pub fn merge(&mut self, name: impl Into<String>, value: MetricValue) {
        match self.items.entry(name.into()) {
            hash_map::Entry::Occupied(mut slot) => slot.get_mut().merge(value),
            hash_map::Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }

    pub fn merge_set(&mut self, other: MetricSet) {
        for (name, value) in other.items {
            self.merge(name, value);
        }
    }

    /// Only the counter entries
    pub fn counters(&self) -> MetricSet {
        let items = self
            .items
            .iter()
            .filter(|(_, value)| value.kind() == MetricKind::Counter)
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        MetricSet { items }
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.items.get(name)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricValue)> {
        self.items.iter()
    }
}

impl IntoIterator for MetricSet {
    type Item = (String, MetricValue);
    type IntoIter = hash_map::IntoIter<String, MetricValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl FromIterator<(String, MetricValue)> for MetricSet {
    fn from_iter<I: IntoIterator<Item = (String, MetricValue)>>(iter: I) -> Self {
        let mut set = MetricSet::new();
        for (name, value) in iter {
            set.merge(name, value);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_counter_rejected() {
        assert!(matches!(
            MetricValue::counter(-1),
            Err(MetricError::WrongMetricValue(_))
        ));
        assert!(matches!(
            MetricValue::parse(MetricKind::Counter, "-42"),
            Err(MetricError::WrongMetricValue(_))
        ));
        assert_eq!(MetricValue::counter(0), Ok(MetricValue::Counter(0)));
        assert_eq!(MetricValue::counter(7), Ok(MetricValue::Counter(7)));
    }

    #[test]
    fn test_parse_plain_values() {
        assert_eq!(
            MetricValue::parse(MetricKind::Gauge, "13220880"),
            Ok(MetricValue::Gauge(13220880.0))
        );
        assert_eq!(
            MetricValue::parse(MetricKind::Gauge, "-0.5"),
            Ok(MetricValue::Gauge(-0.5))
        );
        assert!(MetricValue::parse(MetricKind::Counter, "1.5").is_err());
        assert!(MetricValue::parse(MetricKind::Gauge, "abc").is_err());
        assert!(MetricValue::parse(MetricKind::Gauge, "NaN").is_err());
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(
            "histogram".parse::<MetricKind>(),
            Err(MetricError::UnknownMetricType("histogram".to_string()))
        );
        assert_eq!("gauge".parse::<MetricKind>(), Ok(MetricKind::Gauge));
    }

    #[test]
    fn test_canonical_form() {
        assert_eq!(MetricValue::Counter(5).canonical(), "counter:5");
        assert_eq!(
            MetricValue::Gauge(13220880.0).canonical(),
            "gauge:13220880.000000"
        );
        assert_eq!(MetricValue::Gauge(0.25).to_string(), "0.25");
        assert_eq!(MetricValue::Gauge(13220880.0).to_string(), "13220880");
    }

    #[test]
    fn test_set_merge_semantics() {
        let mut set = MetricSet::new();
        set.merge("PollCount", MetricValue::Counter(1));
        set.merge("PollCount", MetricValue::Counter(2));
        set.merge("Alloc", MetricValue::Gauge(1.0));
        set.merge("Alloc", MetricValue::Gauge(5.0));

        assert_eq!(set.get("PollCount"), Some(&MetricValue::Counter(3)));
        assert_eq!(set.get("Alloc"), Some(&MetricValue::Gauge(5.0)));

        let counters = set.counters();
        assert_eq!(counters.len(), 1);
        assert!(counters.get("Alloc").is_none());
    }

    #[test]
    fn test_kind_ordering_gauges_first() {
        assert!(MetricKind::Gauge < MetricKind::Counter);
    }
}
