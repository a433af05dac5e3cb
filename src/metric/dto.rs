//! Wire form of a metric, shared by the HTTP JSON bodies and the gRPC messages

use super::{MetricError, MetricKind, MetricValue, StorageItem};
use serde::{Deserialize, Serialize};

/// `{id, type, value?, delta?, hash?}`
///
/// Exactly one of `value` / `delta` is set, chosen by `type`. `hash` is set
/// only when signing is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDto {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl MetricDto {
    /// Wire form of a typed value, unsigned
    pub fn new(id: impl Into<String>, value: &MetricValue) -> Self {
        let (value_field, delta_field) = match *value {
            MetricValue::Gauge(v) => (Some(v), None),
            MetricValue::Counter(d) => (None, Some(d)),
        };
        MetricDto {
            id: id.into(),
            kind: value.kind().as_str().to_string(),
            value: value_field,
            delta: delta_field,
            hash: None,
        }
    }

    /// Value-less query, as sent to `POST /value/`
    pub fn query(id: impl Into<String>, kind: MetricKind) -> Self {
        MetricDto {
            id: id.into(),
            kind: kind.as_str().to_string(),
            value: None,
            delta: None,
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: String) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn metric_kind(&self) -> Result<MetricKind, MetricError> {
        self.kind.parse()
    }

    /// Check type, then name
    pub fn key(&self) -> Result<(MetricKind, &str), MetricError> {
        let kind = self.metric_kind()?;
        if self.id.is_empty() {
            return Err(MetricError::EmptyMetricName);
        }
        Ok((kind, self.id.as_str()))
    }

    /// Typed value carried by this DTO
    pub fn metric_value(&self) -> Result<MetricValue, MetricError> {
        match self.metric_kind()? {
            MetricKind::Gauge => match (self.value, self.delta) {
                (Some(value), None) => MetricValue::gauge(value),
                (None, _) => Err(MetricError::WrongMetricValue(format!(
                    "gauge {:?} has no value",
                    self.id
                ))),
                (Some(_), Some(_)) => Err(MetricError::WrongMetricValue(format!(
                    "gauge {:?} carries a delta",
                    self.id
                ))),
            },
            MetricKind::Counter => match (self.delta, self.value) {
                (Some(delta), None) => MetricValue::counter(delta),
                (None, _) => Err(MetricError::WrongMetricValue(format!(
                    "counter {:?} has no delta",
                    self.id
                ))),
                (Some(_), Some(_)) => Err(MetricError::WrongMetricValue(format!(
                    "counter {:?} carries a value",
                    self.id
                ))),
            },
        }
    }

    /// Full structural decode: type, name, value. Signature is checked
    /// separately by the signer.
    pub fn decode(&self) -> Result<StorageItem, MetricError> {
        let (_, name) = self.key()?;
        let value = self.metric_value()?;
        Ok(StorageItem::new(name, value))
    }
}

impl From<&StorageItem> for MetricDto {
    fn from(item: &StorageItem) -> Self {
        MetricDto::new(item.name.clone(), &item.value)
    }
}

/// One rejected entry of a batch update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMetric {
    #[serde(flatten)]
    pub metric: MetricDto,
    pub error: String,
}

impl FailedMetric {
    pub fn new(metric: MetricDto, error: impl ToString) -> Self {
        FailedMetric {
            metric,
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let counter = MetricDto::new("PollCount", &MetricValue::Counter(5));
        let json = serde_json::to_string(&counter).unwrap();
        assert_eq!(json, r#"{"id":"PollCount","type":"counter","delta":5}"#);

        let gauge = MetricDto::new("Sys", &MetricValue::Gauge(13220880.0));
        let json = serde_json::to_value(&gauge).unwrap();
        assert_eq!(json["type"], "gauge");
        assert_eq!(json["value"], 13220880.0);
        assert!(json.get("delta").is_none());
        assert!(json.get("hash").is_none());
    }

    #[test]
    fn test_decode_validation_order() {
        let unknown: MetricDto =
            serde_json::from_str(r#"{"id":"","type":"histogram","value":1}"#).unwrap();
        assert!(matches!(
            unknown.decode(),
            Err(MetricError::UnknownMetricType(_))
        ));

        let nameless: MetricDto =
            serde_json::from_str(r#"{"id":"","type":"gauge","value":1}"#).unwrap();
        assert_eq!(nameless.decode(), Err(MetricError::EmptyMetricName));

        let missing: MetricDto = serde_json::from_str(r#"{"id":"a","type":"counter"}"#).unwrap();
        assert!(matches!(
            missing.decode(),
            Err(MetricError::WrongMetricValue(_))
        ));

        let negative: MetricDto =
            serde_json::from_str(r#"{"id":"a","type":"counter","delta":-3}"#).unwrap();
        assert!(matches!(
            negative.decode(),
            Err(MetricError::WrongMetricValue(_))
        ));

        let both: MetricDto =
            serde_json::from_str(r#"{"id":"a","type":"gauge","value":1.0,"delta":1}"#).unwrap();
        assert!(matches!(both.decode(), Err(MetricError::WrongMetricValue(_))));
    }

    #[test]
    fn test_failed_metric_flattens() {
        let failed = FailedMetric::new(
            MetricDto::new("x", &MetricValue::Counter(1)),
            MetricError::EmptyMetricName,
        );
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["id"], "x");
        assert_eq!(json["error"], "metric name is empty");
    }
}
