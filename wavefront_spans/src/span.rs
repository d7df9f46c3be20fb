use std::{
    net::IpAddr,
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanKind {
    Server,
    Client,
    Producer,
    Consumer,
    Unset,
}
impl Default for SpanKind {
    fn default() -> Self {
        Self::Unset
    }
}

impl SpanKind {
    /// The lowercase name reported in the `span.kind` tag, if the kind is set.
    pub fn as_tag_value(&self) -> Option<&'static str> {
        match self {
            SpanKind::Server => Some("server"),
            SpanKind::Client => Some("client"),
            SpanKind::Producer => Some("producer"),
            SpanKind::Consumer => Some("consumer"),
            SpanKind::Unset => None,
        }
    }

    /// Parses the usual spellings of a span kind, ignoring case.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "server" => SpanKind::Server,
            "client" => SpanKind::Client,
            "producer" => SpanKind::Producer,
            "consumer" => SpanKind::Consumer,
            _ => SpanKind::Unset,
        }
    }
}

/// A timestamped note recorded while the span was open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Microseconds since the unix epoch.
    pub timestamp_micros: u64,
    pub value: String,
}

/// Identity and sampling flags of a span, as seen by the tracing framework.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// A unique identifier for a trace. All spans from the same trace share
    /// the same `trace_id`. An ID with all zeroes is considered invalid.
    pub trace_id: [u8; 16],

    /// A unique identifier for a span within a trace.
    pub span_id: [u8; 8],

    /// The `span_id` of this span's parent span. Root spans have none.
    pub parent_span_id: Option<[u8; 8]>,

    /// Debug traces are reported with a `debug=true` tag.
    pub debug: bool,

    pub sampled: Option<bool>,
}

impl TraceContext {
    pub fn span_id_u64(&self) -> u64 {
        u64::from_be_bytes(self.span_id)
    }

    /// The parent id, treating an all-zero id as absent.
    pub fn parent_id_u64(&self) -> Option<u64> {
        self.parent_span_id
            .map(u64::from_be_bytes)
            .filter(|id| *id != 0)
    }
}

/// A finished span in the shape the pipeline consumes.
///
/// Each tracing framework gets an adapter that maps its own representation
/// into this one; see [`crate::SpanSubscriber`] for the `tracing` adapter.
/// Identity lives only in the [`TraceContext`] delivered with the span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Span {
    /// Spans without a name are reported under a default operation name.
    pub name: Option<String>,

    /// Microseconds since the unix epoch. 0 means the span was never started.
    pub start_micros: u64,

    /// Microseconds since the unix epoch. 0 means the span was never finished.
    pub end_micros: u64,

    pub kind: SpanKind,

    /// Raw tags in the order they were first recorded.
    pub tags: Vec<(String, String)>,

    pub annotations: Vec<Annotation>,

    pub local_ip: Option<IpAddr>,

    /// Set when the traced operation failed.
    pub error: Option<String>,
}

impl Span {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Records a tag. A later value for the same key replaces the earlier one in place.
    pub fn put_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.tags.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.tags.push((key, value)),
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn annotate(&mut self, timestamp_micros: u64, value: impl Into<String>) {
        self.annotations.push(Annotation {
            timestamp_micros,
            value: value.into(),
        });
    }
}

pub fn epoch_micros(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
