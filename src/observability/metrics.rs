//! DogStatsD Metrics Client
//!
//! Non-blocking UDP client. Degrades to a no-op when the agent address
//! cannot be bound.

use dogstatsd::{Client, Options};
use std::sync::Arc;

use super::config::DatadogConfig;
use super::recorder::MetricsRecorder;

#[derive(Clone)]
pub struct StatsdMetrics {
    client: Arc<Option<Client>>,
    prefix: String,
    global_tags: Vec<String>,
}

impl StatsdMetrics {
    pub fn new(config: &DatadogConfig) -> Self {
        let client = match Client::new(Options {
            to_addr: config.statsd_addr.to_string(),
            ..Default::default()
        }) {
            Ok(c) => {
                tracing::info!("DogStatsD client connected to {}", config.statsd_addr);
                Some(c)
            }
            Err(e) => {
                tracing::warn!("Failed to create DogStatsD client: {}. Metrics disabled.", e);
                None
            }
        };

        StatsdMetrics {
            client: Arc::new(client),
            prefix: config.metric_prefix.clone(),
            global_tags: config.formatted_tags(),
        }
    }

    fn name(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    fn merge_tags(&self, tags: &[&str]) -> Vec<String> {
        self.global_tags
            .iter()
            .cloned()
            .chain(tags.iter().map(|s| s.to_string()))
            .collect()
    }
}

impl MetricsRecorder for StatsdMetrics {
    fn incr(&self, name: &str, tags: &[&str]) {
        if let Some(ref client) = *self.client {
            let _ = client.incr(&self.name(name), self.merge_tags(tags));
        }
    }

    fn histogram(&self, name: &str, value: f64, tags: &[&str]) {
        if let Some(ref client) = *self.client {
            let _ = client.histogram(&self.name(name), value.to_string(), self.merge_tags(tags));
        }
    }

    fn gauge(&self, name: &str, value: f64, tags: &[&str]) {
        if let Some(ref client) = *self.client {
            let _ = client.gauge(&self.name(name), value.to_string(), self.merge_tags(tags));
        }
    }

    fn timing(&self, name: &str, duration_ms: f64, tags: &[&str]) {
        if let Some(ref client) = *self.client {
            let _ = client.timing(&self.name(name), duration_ms as i64, self.merge_tags(tags));
        }
    }
}
