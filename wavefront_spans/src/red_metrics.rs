//! Rate, error and duration metrics derived from reported spans, and the
//! heartbeat that announces which application/service combinations are live.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    mem,
    sync::Mutex,
};

use crate::{
    application_tags::{
        APPLICATION_TAG_KEY, CLUSTER_TAG_KEY, SERVICE_TAG_KEY, SHARD_TAG_KEY,
    },
    tag_list::COMPONENT_TAG_KEY,
    ApplicationTags, SendError, Sender,
};

pub const TRACING_DERIVED_PREFIX: &str = "tracing.derived";
pub const HEARTBEAT_METRIC: &str = "~component.heartbeat";
pub const WAVEFRONT_GENERATED_COMPONENT: &str = "wavefront-generated";
pub const OPERATION_NAME_TAG: &str = "operationName";
/// Source of the derived metrics, as opposed to the source of the spans they came from.
pub const DERIVED_METRICS_SOURCE: &str = "wavefront-spans";

const DELTA_PREFIX: &str = "\u{2206}";
const INVOCATION_SUFFIX: &str = ".invocation";
const ERROR_SUFFIX: &str = ".error";
const TOTAL_TIME_SUFFIX: &str = ".total_time.millis";
const DURATION_SUFFIX: &str = ".duration.micros";
const COUNT_SUFFIX: &str = ".count";
const MINUTE_DISTRIBUTION_SUFFIX: &str = ".m";

/// A reporting combination that has been seen at least once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeartbeatKey {
    pub application: String,
    pub service: String,
    pub cluster: String,
    pub shard: String,
    pub source: String,
    pub custom_tags: BTreeMap<String, String>,
}

impl HeartbeatKey {
    pub fn point_tags(&self, component: &str) -> BTreeMap<String, String> {
        let mut tags = self.custom_tags.clone();
        tags.insert(APPLICATION_TAG_KEY.to_string(), self.application.clone());
        tags.insert(SERVICE_TAG_KEY.to_string(), self.service.clone());
        tags.insert(CLUSTER_TAG_KEY.to_string(), self.cluster.clone());
        tags.insert(SHARD_TAG_KEY.to_string(), self.shard.clone());
        tags.insert(COMPONENT_TAG_KEY.to_string(), component.to_string());
        tags
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RedKey {
    operation: String,
    component: String,
    heartbeat: HeartbeatKey,
}

impl RedKey {
    fn metric_base(&self) -> String {
        sanitize(&format!(
            "{}.{}.{}",
            self.heartbeat.application, self.heartbeat.service, self.operation
        ))
    }

    fn point_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.heartbeat.point_tags(&self.component);
        tags.insert(OPERATION_NAME_TAG.to_string(), self.operation.clone());
        tags
    }
}

#[derive(Debug, Default)]
struct RedStats {
    invocations: u64,
    errors: u64,
    total_time_micros: u64,
    // duration in micros -> how many spans took exactly that long
    durations: BTreeMap<u64, u32>,
}

/// Aggregates RED statistics between flushes.
///
/// Written by the reporting thread, drained by the heartbeat thread.
pub struct RedMetrics {
    custom_tag_keys: BTreeSet<String>,
    aggregates: Mutex<HashMap<RedKey, RedStats>>,
}

impl RedMetrics {
    /// `custom_tag_keys` name span tags that are copied onto the derived metrics.
    pub fn new(custom_tag_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            custom_tag_keys: custom_tag_keys.into_iter().collect(),
            aggregates: Default::default(),
        }
    }

    /// Records one span and returns the heartbeat key it reports under.
    #[allow(clippy::too_many_arguments)]
    pub fn report(
        &self,
        operation: &str,
        application_tags: &ApplicationTags,
        source: &str,
        component: &str,
        is_error: bool,
        duration_micros: u64,
        span_tags: &[(String, String)],
    ) -> HeartbeatKey {
        let mut custom_tags: BTreeMap<String, String> = span_tags
            .iter()
            .filter(|(key, _)| self.custom_tag_keys.contains(key))
            .cloned()
            .collect();
        // One heartbeat per component; emission still overrides it.
        custom_tags.insert(COMPONENT_TAG_KEY.to_string(), component.to_string());
        let heartbeat = HeartbeatKey {
            application: application_tags.application.clone(),
            service: application_tags.service.clone(),
            cluster: application_tags.cluster_or_none().to_string(),
            shard: application_tags.shard_or_none().to_string(),
            source: source.to_string(),
            custom_tags,
        };
        let key = RedKey {
            operation: operation.to_string(),
            component: component.to_string(),
            heartbeat: heartbeat.clone(),
        };

        let mut aggregates = self
            .aggregates
            .lock()
            .expect("red metrics mutex should not be poisoned");
        let stats = aggregates.entry(key).or_default();
        stats.invocations += 1;
        if is_error {
            stats.errors += 1;
        }
        stats.total_time_micros += duration_micros;
        *stats.durations.entry(duration_micros).or_default() += 1;

        heartbeat
    }

    /// Number of distinct operations aggregated since the last flush.
    pub fn pending(&self) -> usize {
        self.aggregates
            .lock()
            .expect("red metrics mutex should not be poisoned")
            .len()
    }

    /// Sends everything aggregated since the last flush and starts over.
    ///
    /// Every key is attempted; the last failure is returned.
    pub fn flush(&self, sender: &dyn Sender, timestamp_millis: u64) -> Result<(), SendError> {
        let aggregates = mem::take(
            &mut *self
                .aggregates
                .lock()
                .expect("red metrics mutex should not be poisoned"),
        );

        let mut result = Ok(());
        for (key, stats) in aggregates {
            if let Err(error) = send_red_metrics(sender, &key, &stats, timestamp_millis) {
                log::debug!("failed to send RED metrics for {}: {error}", key.operation);
                result = Err(error);
            }
        }
        result
    }
}

fn send_red_metrics(
    sender: &dyn Sender,
    key: &RedKey,
    stats: &RedStats,
    timestamp_millis: u64,
) -> Result<(), SendError> {
    let base = format!("{TRACING_DERIVED_PREFIX}.{}", key.metric_base());
    let tags = key.point_tags();

    sender.send_metric(
        &format!("{DELTA_PREFIX}{base}{INVOCATION_SUFFIX}{COUNT_SUFFIX}"),
        stats.invocations as f64,
        timestamp_millis,
        DERIVED_METRICS_SOURCE,
        &tags,
    )?;
    if 0 < stats.errors {
        sender.send_metric(
            &format!("{DELTA_PREFIX}{base}{ERROR_SUFFIX}{COUNT_SUFFIX}"),
            stats.errors as f64,
            timestamp_millis,
            DERIVED_METRICS_SOURCE,
            &tags,
        )?;
    }
    sender.send_metric(
        &format!("{DELTA_PREFIX}{base}{TOTAL_TIME_SUFFIX}{COUNT_SUFFIX}"),
        stats.total_time_micros as f64 / 1000.0,
        timestamp_millis,
        DERIVED_METRICS_SOURCE,
        &tags,
    )?;
    let centroids: Vec<(f64, u32)> = stats
        .durations
        .iter()
        .map(|(micros, count)| (*micros as f64, *count))
        .collect();
    sender.send_distribution(
        &format!("{base}{DURATION_SUFFIX}{MINUTE_DISTRIBUTION_SUFFIX}"),
        &centroids,
        timestamp_millis,
        DERIVED_METRICS_SOURCE,
        &tags,
    )
}

/// Emits one heartbeat per key. Every key is attempted; the last failure is returned.
pub fn report_heartbeats<'a>(
    sender: &dyn Sender,
    keys: impl IntoIterator<Item = &'a HeartbeatKey>,
    component: &str,
    timestamp_millis: u64,
) -> Result<(), SendError> {
    let mut result = Ok(());
    for key in keys {
        if let Err(error) = sender.send_metric(
            HEARTBEAT_METRIC,
            1.0,
            timestamp_millis,
            &key.source,
            &key.point_tags(component),
        ) {
            result = Err(error);
        }
    }
    result
}

/// Replaces everything a metric name may not contain with `-`.
///
/// A leading `~` or `∆` marks internal and delta metrics and is kept.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .enumerate()
        .map(|(i, c)| {
            let allowed = c.is_ascii_alphanumeric()
                || c == '-'
                || c == '_'
                || c == '.'
                || (i == 0 && (c == '~' || c == '\u{2206}'));
            if allowed {
                c
            } else {
                '-'
            }
        })
        .collect()
}
