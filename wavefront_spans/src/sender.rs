use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The sender was closed and accepts nothing further.
    #[error("sender is closed")]
    Closed,
    /// Network or collector failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The data could not be put into the wire format.
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// One entry of a span's log, sent alongside the span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanLog {
    /// Microseconds since the unix epoch.
    pub timestamp: u64,
    pub fields: BTreeMap<String, String>,
}

/// A span converted for reporting, borrowing from the pipeline's working copy.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSpan<'a> {
    pub name: &'a str,
    pub start_millis: u64,
    pub duration_millis: u64,
    pub source: &'a str,
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parents: &'a [Uuid],
    pub follows_from: &'a [Uuid],
    pub tags: &'a [(String, String)],
    pub span_logs: &'a [SpanLog],
}

/// Delivers spans and metrics to the collector.
///
/// Implementations are called from the reporting thread and the heartbeat
/// thread, and must not assume an async runtime is running on either.
pub trait Sender: Send + Sync {
    fn send_span(&self, span: &OutboundSpan<'_>) -> Result<(), SendError>;

    fn send_metric(
        &self,
        name: &str,
        value: f64,
        timestamp_millis: u64,
        source: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), SendError>;

    /// `centroids` are (value, count) pairs.
    fn send_distribution(
        &self,
        name: &str,
        centroids: &[(f64, u32)],
        timestamp_millis: u64,
        source: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), SendError>;

    /// Pushes out anything buffered.
    fn flush(&self) -> Result<(), SendError>;

    /// Releases the sender. Nothing may be sent afterward.
    fn close(&self) -> Result<(), SendError>;
}
