//! Generated `metrics.v1` gRPC types and their mapping to [`MetricDto`]

#![allow(clippy::derive_partial_eq_without_eq)]

use crate::metric::{self, MetricDto};

tonic::include_proto!("metrics.v1");

/// Fully-qualified path of the protected update RPC
pub const UPDATE_METRICS_PATH: &str = "/metrics.v1.Metrics/UpdateMetrics";

impl From<MetricDto> for Metric {
    fn from(dto: MetricDto) -> Self {
        Metric {
            id: dto.id,
            r#type: dto.kind,
            value: dto.value,
            delta: dto.delta,
            hash: dto.hash,
        }
    }
}

impl From<Metric> for MetricDto {
    fn from(m: Metric) -> Self {
        MetricDto {
            id: m.id,
            kind: m.r#type,
            value: m.value,
            delta: m.delta,
            hash: m.hash,
        }
    }
}

impl From<metric::FailedMetric> for FailedMetric {
    fn from(failed: metric::FailedMetric) -> Self {
        FailedMetric {
            metric: Some(failed.metric.into()),
            error: failed.error,
        }
    }
}

impl From<FailedMetric> for metric::FailedMetric {
    fn from(failed: FailedMetric) -> Self {
        let dto = failed
            .metric
            .map(MetricDto::from)
            .unwrap_or_else(|| MetricDto::query("", metric::MetricKind::Gauge));
        metric::FailedMetric::new(dto, failed.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricValue;

    #[test]
    fn test_dto_conversion_keeps_optional_fields() {
        let dto = MetricDto::new("PollCount", &MetricValue::Counter(5)).with_hash("ab".into());
        let wire = Metric::from(dto.clone());
        assert_eq!(wire.r#type, "counter");
        assert_eq!(wire.value, None);
        assert_eq!(MetricDto::from(wire), dto);
    }
}
