//! Wavefront data format lines for spans, span logs, metrics and distributions.

use std::{collections::BTreeMap, fmt::Write};

use serde::Serialize;
use wavefront_spans::{sanitize, OutboundSpan, SendError, SpanLog};

/// Which `/report?f=` endpoint a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportFormat {
    Trace,
    SpanLogs,
    Wavefront,
    Histogram,
}

impl ReportFormat {
    pub const ALL: [ReportFormat; 4] = [
        ReportFormat::Trace,
        ReportFormat::SpanLogs,
        ReportFormat::Wavefront,
        ReportFormat::Histogram,
    ];

    pub fn query_value(&self) -> &'static str {
        match self {
            ReportFormat::Trace => "trace",
            ReportFormat::SpanLogs => "spanLogs",
            ReportFormat::Wavefront => "wavefront",
            ReportFormat::Histogram => "histogram",
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpanLogs<'a> {
    trace_id: String,
    span_id: String,
    logs: &'a [SpanLog],
    span: &'a str,
}

/// `"name" source="src" traceId=.. spanId=.. parent=.. "k"="v" start duration`
pub fn span_line(span: &OutboundSpan<'_>) -> Result<String, SendError> {
    require("span name", span.name)?;
    require("source", span.source)?;

    let mut line = String::with_capacity(256);
    line.push_str(&quote(span.name));
    line.push_str(" source=");
    line.push_str(&quote(span.source));
    let _ = write!(line, " traceId={} spanId={}", span.trace_id, span.span_id);
    for parent in span.parents {
        let _ = write!(line, " parent={parent}");
    }
    for follows_from in span.follows_from {
        let _ = write!(line, " followsFrom={follows_from}");
    }
    write_tags(&mut line, span.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
    let _ = writeln!(line, " {} {}", span.start_millis, span.duration_millis);
    Ok(line)
}

/// One JSON object per line, carrying the span line it belongs to.
pub fn span_logs_line(span: &OutboundSpan<'_>, span_line: &str) -> Result<String, SendError> {
    let mut line = serde_json::to_string(&SpanLogs {
        trace_id: span.trace_id.to_string(),
        span_id: span.span_id.to_string(),
        logs: span.span_logs,
        span: span_line.trim_end(),
    })
    .map_err(|error| SendError::Encoding(error.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// `"name" value timestamp source="src" "k"="v"`
pub fn metric_line(
    name: &str,
    value: f64,
    timestamp_millis: u64,
    source: &str,
    tags: &BTreeMap<String, String>,
) -> Result<String, SendError> {
    require("metric name", name)?;
    require("source", source)?;
    if !value.is_finite() {
        return Err(SendError::Encoding(format!("{name} has non-finite value {value}")));
    }

    let mut line = String::with_capacity(128);
    line.push_str(&quote(&sanitize(name)));
    let _ = write!(line, " {value} {timestamp_millis} source=");
    line.push_str(&quote(source));
    write_tags(&mut line, tags.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
    line.push('\n');
    Ok(line)
}

/// `!M timestamp #count centroid... "name" source="src" "k"="v"`
///
/// Minute granularity, with the timestamp in seconds.
pub fn distribution_line(
    name: &str,
    centroids: &[(f64, u32)],
    timestamp_millis: u64,
    source: &str,
    tags: &BTreeMap<String, String>,
) -> Result<String, SendError> {
    require("distribution name", name)?;
    require("source", source)?;
    if centroids.is_empty() {
        return Err(SendError::Encoding(format!("{name} has no centroids")));
    }

    let mut line = String::with_capacity(128);
    let _ = write!(line, "!M {}", timestamp_millis / 1000);
    for (value, count) in centroids {
        if !value.is_finite() {
            return Err(SendError::Encoding(format!(
                "{name} has non-finite centroid {value}"
            )));
        }
        let _ = write!(line, " #{count} {value}");
    }
    line.push(' ');
    line.push_str(&quote(&sanitize(name)));
    line.push_str(" source=");
    line.push_str(&quote(source));
    write_tags(&mut line, tags.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
    line.push('\n');
    Ok(line)
}

fn write_tags<'a>(
    line: &mut String,
    tags: impl Iterator<Item = (&'a str, &'a str)>,
) -> Result<(), SendError> {
    for (key, value) in tags {
        require("tag key", key)?;
        if value.is_empty() {
            return Err(SendError::Encoding(format!("tag {key} has no value")));
        }
        line.push(' ');
        line.push_str(&quote(&sanitize(key)));
        line.push('=');
        line.push_str(&quote(value));
    }
    Ok(())
}

fn require(what: &str, value: &str) -> Result<(), SendError> {
    if value.trim().is_empty() {
        Err(SendError::Encoding(format!("{what} may not be blank")))
    } else {
        Ok(())
    }
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
