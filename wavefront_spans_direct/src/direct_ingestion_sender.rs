use std::{
    collections::{BTreeMap, HashMap},
    error::Error,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use hyper::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    http::HeaderValue,
    Body, Request, Uri,
};
use wavefront_spans::{OutboundSpan, SendError, Sender};

use crate::{
    channel_connection::{default_trust_store, get_channel, insecure_trust_store, ChannelType},
    wire_format::{self, ReportFormat},
};

const RUNTIME_THREAD_NAME: &str = "wavefront-direct-ingestion";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reports to a Wavefront cluster's direct ingestion endpoint.
///
/// Lines are batched per data format and POSTed to `/report?f=<format>` when
/// a batch fills up or on `flush()`. Each POST blocks the calling thread until
/// the collector answers, so a failed batch surfaces on the send that filled it.
/// Requests run on a small runtime owned by the sender, so callers need no
/// runtime of their own.
pub struct DirectIngestionSender {
    client: ChannelType,
    server: String,
    authorization: HeaderValue,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    batches: Mutex<HashMap<ReportFormat, Vec<String>>>,
    batch_size: usize,
    closed: AtomicBool,
}

impl DirectIngestionSender {
    /// `server` is the cluster's base url, like `https://example.wavefront.com`.
    pub fn new(
        server: &str,
        token: &str,
        batch_size: usize,
        insecure: bool,
    ) -> Result<Self, Box<dyn Error>> {
        let server = server.trim_end_matches('/').to_string();
        // Fail now rather than on the first batch.
        let _: Uri = report_uri(&server, ReportFormat::Trace)?;
        let authorization = HeaderValue::from_str(&format!("Bearer {token}"))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(RUNTIME_THREAD_NAME)
            .enable_all()
            .build()?;

        Ok(Self {
            client: get_channel(if insecure {
                insecure_trust_store
            } else {
                default_trust_store
            }),
            server,
            authorization,
            runtime: Mutex::new(Some(runtime)),
            batches: Default::default(),
            batch_size: batch_size.max(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Lines waiting for their batch to fill, across all formats.
    pub fn pending_lines(&self) -> usize {
        self.lock_batches().values().map(Vec::len).sum()
    }

    fn lock_batches(&self) -> MutexGuard<'_, HashMap<ReportFormat, Vec<String>>> {
        self.batches.lock().expect("lock should not be poisoned")
    }

    fn enqueue(&self, format: ReportFormat, line: String) -> Result<(), SendError> {
        let mut batches = self.lock_batches();
        // close() drains under this lock, so a line accepted here is always sent.
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        let batch = batches.entry(format).or_default();
        batch.push(line);
        if self.batch_size <= batch.len() {
            let batch = mem::replace(batch, Vec::with_capacity(self.batch_size));
            // Other threads may keep batching while this one waits on the collector.
            drop(batches);
            return self.post(format, batch);
        }
        Ok(())
    }

    fn drain_batches(&self) -> Result<(), SendError> {
        let mut batches = mem::take(&mut *self.lock_batches());
        let mut result = Ok(());
        for format in ReportFormat::ALL {
            if let Some(batch) = batches.remove(&format).filter(|batch| !batch.is_empty()) {
                if let Err(error) = self.post(format, batch) {
                    result = Err(error);
                }
            }
        }
        result
    }

    fn post(&self, format: ReportFormat, lines: Vec<String>) -> Result<(), SendError> {
        let line_count = lines.len();
        let request = Request::post(report_uri(&self.server, format)?)
            .header(AUTHORIZATION, self.authorization.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(lines.concat()))
            .map_err(|error| SendError::Encoding(error.to_string()))?;

        let (result_sender, result) = flume::bounded(1);
        {
            let runtime = self.runtime.lock().expect("lock should not be poisoned");
            let runtime = runtime.as_ref().ok_or(SendError::Closed)?;
            runtime.spawn(send_batch(
                self.client.clone(),
                request,
                format,
                line_count,
                result_sender,
            ));
        }
        result.recv().unwrap_or_else(|_| {
            Err(SendError::Transport(
                "runtime stopped before the batch was sent".to_string(),
            ))
        })
    }
}

fn report_uri(server: &str, format: ReportFormat) -> Result<Uri, SendError> {
    format!("{server}/report?f={}", format.query_value())
        .parse()
        .map_err(|error: hyper::http::uri::InvalidUri| SendError::Encoding(error.to_string()))
}

async fn send_batch(
    client: ChannelType,
    request: Request<Body>,
    format: ReportFormat,
    line_count: usize,
    result_sender: flume::Sender<Result<(), SendError>>,
) {
    log::trace!("sending {line_count} {format:?} lines: {request:?}");
    let result = match tokio::time::timeout(REQUEST_TIMEOUT, client.request(request)).await {
        Ok(Ok(response)) if response.status().is_success() => Ok(()),
        Ok(Ok(response)) => {
            log::error!(
                "collector rejected {line_count} {format:?} lines: {}",
                response.status()
            );
            Err(SendError::Transport(format!("collector responded {}", response.status())))
        }
        Ok(Err(error)) => {
            log::error!("failed to send {line_count} {format:?} lines: {error:?}");
            Err(SendError::Transport(error.to_string()))
        }
        Err(_) => {
            log::error!("timed out sending {line_count} {format:?} lines");
            Err(SendError::Transport(format!("no response within {REQUEST_TIMEOUT:?}")))
        }
    };
    // The caller may have stopped waiting.
    let _ = result_sender.send(result);
}

impl Sender for DirectIngestionSender {
    fn send_span(&self, span: &OutboundSpan<'_>) -> Result<(), SendError> {
        let span_line = wire_format::span_line(span)?;
        if span.span_logs.is_empty() {
            return self.enqueue(ReportFormat::Trace, span_line);
        }
        let span_logs_line = wire_format::span_logs_line(span, &span_line)?;
        self.enqueue(ReportFormat::Trace, span_line)?;
        self.enqueue(ReportFormat::SpanLogs, span_logs_line)
    }

    fn send_metric(
        &self,
        name: &str,
        value: f64,
        timestamp_millis: u64,
        source: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), SendError> {
        let line = wire_format::metric_line(name, value, timestamp_millis, source, tags)?;
        self.enqueue(ReportFormat::Wavefront, line)
    }

    fn send_distribution(
        &self,
        name: &str,
        centroids: &[(f64, u32)],
        timestamp_millis: u64,
        source: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), SendError> {
        let line =
            wire_format::distribution_line(name, centroids, timestamp_millis, source, tags)?;
        self.enqueue(ReportFormat::Histogram, line)
    }

    fn flush(&self) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.drain_batches()
    }

    /// Sends what is batched, then stops the runtime. Only the first call does anything.
    fn close(&self) -> Result<(), SendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.drain_batches();
        if let Some(runtime) = self
            .runtime
            .lock()
            .expect("lock should not be poisoned")
            .take()
        {
            // Safe to call from within another runtime, unlike dropping it.
            runtime.shutdown_background();
        }
        log::info!("direct ingestion sender for {} closed", self.server);
        result
    }
}

impl Drop for DirectIngestionSender {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            log::warn!("unable to send the last batches: {error}");
        }
    }
}
