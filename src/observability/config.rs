//! Datadog settings, read from the standard `DD_*` variables

use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct DatadogConfig {
    pub service_name: String,
    pub env: String,
    pub version: String,
    pub statsd_addr: SocketAddr,
    pub trace_addr: String,
    pub trace_sample_rate: f64,
    pub metric_prefix: String,
    pub tags: Vec<(String, String)>,
    /// Emit JSON log lines instead of text
    pub json_logs: bool,
}

impl DatadogConfig {
    /// Read from the process environment; `service` is used when
    /// `DD_SERVICE` is unset
    pub fn from_env(service: &str) -> Self {
        Self::from_lookup(service, |var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(service: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let statsd_addr = lookup("DD_DOGSTATSD_URL")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8125)));

        let trace_sample_rate = lookup("DD_TRACE_SAMPLE_RATE")
            .and_then(|v| v.parse::<f64>().ok())
            .map(|rate| rate.clamp(0.0, 1.0))
            .unwrap_or(1.0);

        let json_logs = lookup("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .or_else(|| lookup("DD_LOGS_INJECTION").map(|v| v == "true"))
            .unwrap_or(false);

        DatadogConfig {
            service_name: lookup("DD_SERVICE").unwrap_or_else(|| service.to_string()),
            env: lookup("DD_ENV").unwrap_or_else(|| "development".to_string()),
            version: lookup("DD_VERSION").unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            statsd_addr,
            trace_addr: lookup("DD_TRACE_AGENT_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8126".to_string()),
            trace_sample_rate,
            metric_prefix: lookup("DD_METRIC_PREFIX")
                .unwrap_or_else(|| "metrics_pipeline".to_string()),
            tags: lookup("DD_TAGS").map(|v| parse_tags(&v)).unwrap_or_default(),
            json_logs,
        }
    }

    /// `key:value` strings for DogStatsD, with service and env prepended
    pub fn formatted_tags(&self) -> Vec<String> {
        let mut tags = vec![
            format!("service:{}", self.service_name),
            format!("env:{}", self.env),
        ];
        tags.extend(self.tags.iter().map(|(k, v)| format!("{}:{}", k, v)));
        tags
    }
}

fn parse_tags(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.trim().split_once(':')?;
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}
