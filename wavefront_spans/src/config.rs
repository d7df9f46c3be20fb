use std::time::Duration;

use serde::Deserialize;

use crate::{span_buffer::DEFAULT_MAX_QUEUE_SIZE, ApplicationTags};

const DEFAULT_SOURCE: &str = "wavefront-spans";

/// Everything a [`crate::WavefrontSpanHandler`] needs besides its sender.
///
/// Every field has a default, so a config file only has to name what it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Spans beyond this many waiting to be sent are dropped.
    pub max_queue_size: usize,
    pub application_tags: ApplicationTags,
    /// The host the spans are reported from.
    pub source: String,
    /// Span tags copied onto the derived RED metrics.
    pub red_metrics_custom_tag_keys: Vec<String>,
    /// Also report the reporter's own counters and queue gauges on every heartbeat.
    pub extract_runtime_metrics: bool,
    /// How long `close()` waits for queued spans to be sent.
    pub shutdown_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Minimum time between "buffer full" warnings.
    pub drop_warning_interval: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            application_tags: ApplicationTags::default(),
            source: default_source(),
            red_metrics_custom_tag_keys: Vec::new(),
            extract_runtime_metrics: true,
            shutdown_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(60),
            drop_warning_interval: Duration::from_secs(10),
        }
    }
}

impl HandlerConfig {
    pub fn new(application_tags: ApplicationTags) -> Self {
        Self {
            application_tags,
            ..Default::default()
        }
    }
}

fn default_source() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|hostname| !hostname.is_empty())
        .unwrap_or_else(|| DEFAULT_SOURCE.to_string())
}
