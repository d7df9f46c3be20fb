use std::{
    any::Any,
    collections::BTreeMap,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use dashmap::DashSet;
use uuid::Uuid;

use crate::{
    heartbeater::Heartbeater,
    red_metrics::{report_heartbeats, HeartbeatKey, RedMetrics, WAVEFRONT_GENERATED_COMPONENT},
    span_buffer::{QueueEntry, SpanBuffer},
    span_metrics::{SpanMetrics, SpanMetricsSnapshot, WarningLimiter},
    tag_list::{DefaultTags, TagList},
    ApplicationTags, HandlerConfig, OutboundSpan, Sender, Span, SpanLog, TraceContext,
};

/// Reported when a span has no name.
pub const DEFAULT_SPAN_NAME: &str = "defaultOperation";

const SENDING_THREAD_NAME: &str = "wavefront-span-reporter";
const HEARTBEAT_THREAD_NAME: &str = "wavefront-heart-beater";
const RUNTIME_METRIC_PREFIX: &str = "reporter.";
const HEARTBEAT_FIRST_RUN: Duration = Duration::from_secs(1);

/// Receives every span when it finishes.
pub trait SpanHandler: Send + Sync {
    /// Called on the thread that finished the span.
    ///
    /// Returns whether handlers after this one should still see the span.
    fn end(&self, context: TraceContext, span: Span) -> bool;
}

impl<T: SpanHandler + ?Sized> SpanHandler for Arc<T> {
    fn end(&self, context: TraceContext, span: Span) -> bool {
        (**self).end(context, span)
    }
}

/// Queues finished spans and reports them to a [`Sender`] from a background thread.
///
/// Finishing a span never blocks: when the queue is full the span is dropped
/// and counted. Along the way it derives RED metrics per operation and a
/// heartbeat per reporting application, both sent once per heartbeat interval.
pub struct WavefrontSpanHandler {
    reporter: Arc<Reporter>,
    drop_warnings: WarningLimiter,
    shutdown_timeout: Duration,
    stopped: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    sending_thread: Option<JoinHandle<()>>,
    // Disconnects when the sending thread exits, however it exits.
    sending_thread_finished: flume::Receiver<()>,
    heartbeater: Option<Heartbeater>,
}

/// The state shared with the sending and heartbeat threads.
struct Reporter {
    sender: Arc<dyn Sender>,
    buffer: SpanBuffer,
    metrics: SpanMetrics,
    red_metrics: RedMetrics,
    discovered_heartbeats: DashSet<HeartbeatKey>,
    application_tags: ApplicationTags,
    default_tags: DefaultTags,
    source: String,
    extract_runtime_metrics: bool,
    // Set when close() gave up waiting; the sending thread exits at its next span.
    abandoned: AtomicBool,
}

impl WavefrontSpanHandler {
    /// Starts the sending and heartbeat threads.
    pub fn new(config: HandlerConfig, sender: Arc<dyn Sender>) -> io::Result<Self> {
        let HandlerConfig {
            max_queue_size,
            application_tags,
            source,
            red_metrics_custom_tag_keys,
            extract_runtime_metrics,
            shutdown_timeout,
            heartbeat_interval,
            drop_warning_interval,
        } = config;

        let reporter = Arc::new(Reporter {
            sender,
            buffer: SpanBuffer::new(max_queue_size),
            metrics: SpanMetrics::default(),
            red_metrics: RedMetrics::new(red_metrics_custom_tag_keys),
            discovered_heartbeats: DashSet::new(),
            default_tags: DefaultTags::new(&application_tags),
            application_tags,
            source,
            extract_runtime_metrics,
            abandoned: AtomicBool::new(false),
        });

        let (finished_sender, sending_thread_finished) = flume::bounded::<()>(1);
        let sending_thread = {
            let reporter = reporter.clone();
            thread::Builder::new()
                .name(SENDING_THREAD_NAME.to_string())
                .spawn(move || {
                    let _finished = finished_sender;
                    reporter.run()
                })?
        };

        let heartbeater = {
            let reporter = reporter.clone();
            Heartbeater::start(
                HEARTBEAT_THREAD_NAME,
                heartbeat_interval.min(HEARTBEAT_FIRST_RUN),
                heartbeat_interval,
                move || reporter.heartbeat(),
            )
        };
        let heartbeater = match heartbeater {
            Ok(heartbeater) => heartbeater,
            Err(error) => {
                // Don't leave the sending thread parked on an empty buffer forever.
                let _ = reporter.buffer.offer(QueueEntry::Shutdown);
                return Err(error);
            }
        };

        log::info!(
            "reporting spans from {} with room for {} queued spans",
            reporter.source,
            reporter.buffer.capacity()
        );
        Ok(Self {
            reporter,
            drop_warnings: WarningLimiter::new(drop_warning_interval),
            shutdown_timeout,
            stopped: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                sending_thread: Some(sending_thread),
                sending_thread_finished,
                heartbeater: Some(heartbeater),
            }),
        })
    }

    pub fn metrics(&self) -> SpanMetricsSnapshot {
        self.reporter.metrics_snapshot()
    }

    pub fn default_tags(&self) -> &[(String, String)] {
        self.reporter.default_tags.tags()
    }

    pub fn discovered_heartbeats(&self) -> Vec<HeartbeatKey> {
        self.reporter
            .discovered_heartbeats
            .iter()
            .map(|key| key.key().clone())
            .collect()
    }

    /// Stops reporting: sends what it can of the queue and lets a heartbeat in
    /// progress finish, both within the shutdown timeout, then flushes and
    /// closes the sender.
    ///
    /// Failures are logged, never returned. Only the first call does anything.
    pub fn close(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mut lifecycle = self
            .lifecycle
            .lock()
            .expect("lifecycle mutex should not be poisoned");

        let deadline = Instant::now() + self.shutdown_timeout;
        if self
            .reporter
            .buffer
            .offer_timeout(QueueEntry::Shutdown, self.shutdown_timeout)
            .is_err()
        {
            log::warn!("span buffer stayed full during shutdown");
        }
        match lifecycle.sending_thread_finished.recv_deadline(deadline) {
            Err(flume::RecvTimeoutError::Timeout) => {
                log::warn!(
                    "reporting thread did not finish within {:?}; abandoning {} queued spans",
                    self.shutdown_timeout,
                    self.reporter.buffer.size()
                );
                self.reporter.abandoned.store(true, Ordering::Release);
                // In case the buffer drained before the flag was seen.
                let _ = self.reporter.buffer.offer(QueueEntry::Shutdown);
                // Detach: the thread leaves at its next span.
                lifecycle.sending_thread.take();
            }
            _ => {
                if let Some(thread) = lifecycle.sending_thread.take() {
                    if thread.join().is_err() {
                        log::warn!("reporting thread panicked");
                    }
                }
            }
        }
        if let Some(mut heartbeater) = lifecycle.heartbeater.take() {
            if !heartbeater.stop(deadline) {
                log::warn!(
                    "heartbeat did not finish within {:?}; abandoning it",
                    self.shutdown_timeout
                );
            }
        }

        // A detached heartbeat may still try to send; the closed sender refuses it.
        if let Err(error) = self.reporter.sender.flush() {
            log::warn!("unable to flush wavefront sender: {error}");
        }
        if let Err(error) = self.reporter.sender.close() {
            log::warn!("unable to close wavefront sender: {error}");
        }
        self.reporter.discovered_heartbeats.clear();
        log::info!("wavefront span handler closed");
    }

    fn report_dropped(&self, span: &Span) {
        let dropped = self.reporter.metrics.report_dropped();
        if let Some(suppressed) = self.drop_warnings.try_acquire() {
            log::warn!(
                "buffer full or closed, dropping span: {:?}. Total spans dropped: {dropped} ({suppressed} more since the last warning)",
                span.name
            );
        }
    }
}

impl SpanHandler for WavefrontSpanHandler {
    fn end(&self, context: TraceContext, span: Span) -> bool {
        self.reporter.metrics.report_received();
        if self.stopped.load(Ordering::Acquire) {
            self.report_dropped(&span);
            return true;
        }
        if let Err(QueueEntry::Span { span, .. }) =
            self.reporter.buffer.offer(QueueEntry::Span { context, span })
        {
            self.report_dropped(&span);
        }
        // Regardless of the outcome, other handlers should run.
        true
    }
}

impl Drop for WavefrontSpanHandler {
    fn drop(&mut self) {
        self.close()
    }
}

impl Reporter {
    fn run(&self) {
        loop {
            let (context, span) = match self.buffer.take() {
                QueueEntry::Shutdown => {
                    log::info!("reporting thread stopping");
                    return;
                }
                QueueEntry::Span { context, span } => (context, span),
            };
            if self.abandoned.load(Ordering::Acquire) {
                log::info!("reporting thread abandoned");
                return;
            }
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| self.send(&context, &span)))
            {
                log::warn!("error processing buffer: {}", panic_message(&*panic));
                self.metrics.report_error();
            }
        }
    }

    fn send(&self, context: &TraceContext, span: &Span) {
        let trace_id = Uuid::from_bytes(context.trace_id);
        let span_id = Uuid::from_u64_pair(0, context.span_id_u64());
        let parents: Vec<Uuid> = context
            .parent_id_u64()
            .map(|parent| Uuid::from_u64_pair(0, parent))
            .into_iter()
            .collect();

        let name = span
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_SPAN_NAME);

        let start_millis = span.start_micros / 1000;
        let finish_millis = span.end_micros / 1000;
        let duration_millis = duration_millis(start_millis, finish_millis);
        let duration_micros = if span.start_micros != 0 && span.end_micros != 0 {
            span.end_micros.saturating_sub(span.start_micros)
        } else {
            0
        };

        let span_logs = span_logs(span);
        let tags = TagList::new(&self.default_tags, context, span);

        let sent = self.sender.send_span(&OutboundSpan {
            name,
            start_millis,
            duration_millis,
            source: &self.source,
            trace_id,
            span_id,
            parents: &parents,
            follows_from: &[],
            tags: &tags.tags,
            span_logs: &span_logs,
        });
        match sent {
            Ok(()) => {
                let heartbeat = self.red_metrics.report(
                    name,
                    &self.application_tags,
                    &self.source,
                    &tags.component,
                    tags.is_error,
                    duration_micros,
                    &tags.tags,
                );
                self.discovered_heartbeats.insert(heartbeat);
            }
            Err(error) => {
                log::debug!("error sending span {context:?}: {error}");
                self.metrics.report_error();
            }
        }
    }

    fn heartbeat(&self) {
        let now = epoch_millis();
        let keys: Vec<HeartbeatKey> = self
            .discovered_heartbeats
            .iter()
            .map(|key| key.key().clone())
            .collect();
        if let Err(error) =
            report_heartbeats(&*self.sender, &keys, WAVEFRONT_GENERATED_COMPONENT, now)
        {
            log::warn!("cannot report heartbeat metric to wavefront: {error}");
        }
        log::debug!(
            "heartbeat for {} keys, {} operations with RED metrics",
            keys.len(),
            self.red_metrics.pending()
        );
        if let Err(error) = self.red_metrics.flush(&*self.sender, now) {
            log::warn!("cannot report span RED metrics to wavefront: {error}");
        }
        if self.extract_runtime_metrics {
            self.report_runtime_metrics(now);
        }
        // Batching senders would otherwise hold everything until close.
        if let Err(error) = self.sender.flush() {
            log::warn!("unable to flush wavefront sender: {error}");
        }
    }

    fn report_runtime_metrics(&self, now: u64) {
        let tags: BTreeMap<String, String> = self
            .default_tags
            .tags()
            .iter()
            .cloned()
            .collect();
        for (name, value) in self.metrics_snapshot().named_values() {
            let name = format!("{RUNTIME_METRIC_PREFIX}{name}");
            if let Err(error) = self.sender.send_metric(&name, value, now, &self.source, &tags) {
                log::warn!("cannot report {name} to wavefront: {error}");
                return;
            }
        }
    }

    fn metrics_snapshot(&self) -> SpanMetricsSnapshot {
        SpanMetricsSnapshot {
            received: self.metrics.received(),
            dropped: self.metrics.dropped(),
            errors: self.metrics.errors(),
            queue_size: self.buffer.size() as u64,
            queue_remaining_capacity: self.buffer.remaining_capacity() as u64,
        }
    }
}

/// Spans with an unset start or finish have no duration. Any other span lasts at least 1 milli.
pub fn duration_millis(start_millis: u64, finish_millis: u64) -> u64 {
    if start_millis != 0 && finish_millis != 0 {
        finish_millis.saturating_sub(start_millis).max(1)
    } else {
        0
    }
}

fn span_logs(span: &Span) -> Vec<SpanLog> {
    span.annotations
        .iter()
        .map(|annotation| SpanLog {
            timestamp: annotation.timestamp_micros,
            fields: BTreeMap::from([("annotation".to_string(), annotation.value.clone())]),
        })
        .collect()
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        thread,
        time::{Duration, Instant},
    };

    use uuid::Uuid;

    use super::{duration_millis, SpanHandler, WavefrontSpanHandler};
    use crate::{
        sender::recording::RecordingSender, ApplicationTags, HandlerConfig, OutboundSpan,
        SendError, Sender, Span, SpanKind, TraceContext,
    };

    fn set_up_logging() {
        static INITIALIZE_LOGGER_ONCE: std::sync::Once = std::sync::Once::new();
        INITIALIZE_LOGGER_ONCE.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }

    fn config(max_queue_size: usize) -> HandlerConfig {
        HandlerConfig {
            max_queue_size,
            application_tags: ApplicationTags::new("app1", "svc1"),
            source: "source".to_string(),
            extract_runtime_metrics: false,
            shutdown_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn handler(
        config: HandlerConfig,
        sender: &Arc<RecordingSender>,
    ) -> WavefrontSpanHandler {
        set_up_logging();
        WavefrontSpanHandler::new(config, sender.clone()).expect("threads should start")
    }

    fn context(span_id: u8) -> TraceContext {
        TraceContext {
            trace_id: [0, 0, 0, 0, 0, 0, 0, 0, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
            span_id: [0, 0, 0, 0, 0, 0, 0, span_id],
            ..Default::default()
        }
    }

    fn timed_span(name: &str) -> Span {
        Span {
            name: Some(name.to_string()),
            start_micros: 1_600_000_000_000_000,
            end_micros: 1_600_000_000_002_500,
            ..Default::default()
        }
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Holds span or metric sends until released, so tests can fill the buffer
    /// or stall a heartbeat.
    struct GatedSender {
        inner: Arc<RecordingSender>,
        gate: Mutex<()>,
        entered: AtomicUsize,
        gate_metrics: bool,
    }
    impl GatedSender {
        fn new(inner: &Arc<RecordingSender>, gate_metrics: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: inner.clone(),
                gate: Mutex::new(()),
                entered: AtomicUsize::new(0),
                gate_metrics,
            })
        }

        fn spans(inner: &Arc<RecordingSender>) -> Arc<Self> {
            Self::new(inner, false)
        }

        fn metrics(inner: &Arc<RecordingSender>) -> Arc<Self> {
            Self::new(inner, true)
        }

        fn pass(&self) {
            self.entered.fetch_add(1, Ordering::SeqCst);
            drop(self.gate.lock().expect("local lock should work"));
        }
    }
    impl Sender for GatedSender {
        fn send_span(&self, span: &OutboundSpan<'_>) -> Result<(), SendError> {
            if !self.gate_metrics {
                self.pass();
            }
            self.inner.send_span(span)
        }
        fn send_metric(
            &self,
            name: &str,
            value: f64,
            timestamp_millis: u64,
            source: &str,
            tags: &std::collections::BTreeMap<String, String>,
        ) -> Result<(), SendError> {
            if self.gate_metrics {
                self.pass();
            }
            self.inner
                .send_metric(name, value, timestamp_millis, source, tags)
        }
        fn send_distribution(
            &self,
            name: &str,
            centroids: &[(f64, u32)],
            timestamp_millis: u64,
            source: &str,
            tags: &std::collections::BTreeMap<String, String>,
        ) -> Result<(), SendError> {
            self.inner
                .send_distribution(name, centroids, timestamp_millis, source, tags)
        }
        fn flush(&self) -> Result<(), SendError> {
            self.inner.flush()
        }
        fn close(&self) -> Result<(), SendError> {
            self.inner.close()
        }
    }

    #[test]
    fn duration_floor() {
        assert_eq!(0, duration_millis(0, 0));
        assert_eq!(0, duration_millis(0, 1000));
        assert_eq!(0, duration_millis(1000, 0));
        assert_eq!(1, duration_millis(1000, 1000));
        assert_eq!(250, duration_millis(1000, 1250));
    }

    #[test]
    fn sends() {
        let sender = Arc::new(RecordingSender::default());
        let handler = handler(config(10_000), &sender);

        assert!(handler.end(context(0x7f), Span::default()));
        handler.close();

        let spans = sender.sent_spans();
        assert_eq!(1, spans.len());
        let span = &spans[0];
        assert_eq!("defaultOperation", span.name);
        assert_eq!("source", span.source);
        assert_eq!(
            Uuid::parse_str("00000000-0000-0000-7fff-ffffffffffff").expect("uuid literal"),
            span.trace_id
        );
        assert_eq!(
            Uuid::parse_str("00000000-0000-0000-0000-00000000007f").expect("uuid literal"),
            span.span_id
        );
        assert!(span.parents.is_empty());
        assert_eq!(0, span.start_millis);
        assert_eq!(0, span.duration_millis);
    }

    #[test]
    fn server_span_scenario() {
        let sender = Arc::new(RecordingSender::default());
        let handler = handler(config(16), &sender);

        let mut span = timed_span("GET /x");
        span.kind = SpanKind::Server;
        span.put_tag("http.status_code", "200");
        let mut context = context(1);
        context.parent_span_id = Some([0, 0, 0, 0, 0, 0, 0, 9]);
        handler.end(context, span);
        handler.close();

        let spans = sender.sent_spans();
        assert_eq!(1, spans.len());
        let expected: Vec<(String, String)> = [
            ("application", "app1"),
            ("service", "svc1"),
            ("cluster", "none"),
            ("shard", "none"),
            ("http.status_code", "200"),
            ("span.kind", "server"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(expected, spans[0].tags);
        assert_eq!("GET /x", spans[0].name);
        assert_eq!(1_600_000_000_000, spans[0].start_millis);
        assert_eq!(2, spans[0].duration_millis);
        assert_eq!(vec![Uuid::from_u64_pair(0, 9)], spans[0].parents);
    }

    #[test]
    fn annotations_become_span_logs() {
        let sender = Arc::new(RecordingSender::default());
        let handler = handler(config(16), &sender);

        let mut span = timed_span("op");
        span.annotate(1_600_000_000_001_000, "cache miss");
        handler.end(context(1), span);
        handler.close();

        let spans = sender.sent_spans();
        assert_eq!(1, spans[0].span_logs.len());
        assert_eq!(1_600_000_000_001_000, spans[0].span_logs[0].timestamp);
        assert_eq!(
            Some("cache miss"),
            spans[0].span_logs[0]
                .fields
                .get("annotation")
                .map(String::as_str)
        );
    }

    #[test]
    fn queued_spans_are_counted_then_all_sent() {
        let inner = Arc::new(RecordingSender::default());
        let gated = GatedSender::spans(&inner);
        set_up_logging();
        let handler =
            WavefrontSpanHandler::new(config(100), gated.clone()).expect("threads should start");

        let gate = gated.gate.lock().expect("local lock should work");
        // The first span is taken off the queue and held in the sender.
        handler.end(context(0), timed_span("held"));
        wait_until(|| gated.entered.load(Ordering::SeqCst) == 1);

        for i in 1..=100u8 {
            handler.end(context(i), timed_span(&format!("op-{i}")));
        }
        let metrics = handler.metrics();
        assert_eq!(100, metrics.queue_size);
        assert_eq!(0, metrics.queue_remaining_capacity);
        assert_eq!(101, metrics.received);
        assert_eq!(0, metrics.dropped);

        drop(gate);
        handler.close();
        assert_eq!(101, inner.sent_spans().len());
        assert_eq!(0, handler.metrics().errors);
    }

    #[test]
    fn drops_beyond_capacity_and_keeps_order() {
        let inner = Arc::new(RecordingSender::default());
        let gated = GatedSender::spans(&inner);
        set_up_logging();
        let handler =
            WavefrontSpanHandler::new(config(2), gated.clone()).expect("threads should start");

        let gate = gated.gate.lock().expect("local lock should work");
        handler.end(context(0), timed_span("held"));
        wait_until(|| gated.entered.load(Ordering::SeqCst) == 1);

        handler.end(context(1), timed_span("first"));
        handler.end(context(2), timed_span("second"));
        handler.end(context(3), timed_span("third"));

        let metrics = handler.metrics();
        assert_eq!(4, metrics.received);
        assert_eq!(1, metrics.dropped);

        drop(gate);
        handler.close();
        let names: Vec<String> = inner.sent_spans().into_iter().map(|s| s.name).collect();
        assert_eq!(vec!["held", "first", "second"], names);
    }

    #[test]
    fn send_failures_are_counted_and_the_loop_continues() {
        let sender = Arc::new(RecordingSender::default());
        sender.fail_spans.store(true, Ordering::Relaxed);
        let handler = handler(config(16), &sender);

        for i in 0..3 {
            handler.end(context(i), timed_span("op"));
        }
        wait_until(|| handler.metrics().errors == 3);

        sender.fail_spans.store(false, Ordering::Relaxed);
        handler.end(context(4), timed_span("op"));
        handler.close();

        assert_eq!(1, sender.sent_spans().len());
        assert_eq!(3, handler.metrics().errors);
    }

    #[test]
    fn close_is_idempotent() {
        let sender = Arc::new(RecordingSender::default());
        let handler = handler(config(16), &sender);

        handler.close();
        handler.close();
        drop(handler);

        assert_eq!(1, sender.flushes.load(Ordering::Relaxed));
        assert_eq!(1, sender.closes.load(Ordering::Relaxed));
    }

    #[test]
    fn stops_in_time() {
        let sender = Arc::new(RecordingSender::default());
        let handler = handler(config(16), &sender);

        let started = Instant::now();
        handler.close();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(1, sender.flushes.load(Ordering::Relaxed));
        assert_eq!(1, sender.closes.load(Ordering::Relaxed));
    }

    #[test]
    fn spans_after_close_are_dropped() {
        let sender = Arc::new(RecordingSender::default());
        let handler = handler(config(16), &sender);
        handler.close();

        assert!(handler.end(context(1), timed_span("late")));
        assert_eq!(1, handler.metrics().received);
        assert_eq!(1, handler.metrics().dropped);
        assert!(sender.sent_spans().is_empty());
    }

    #[test]
    fn abandons_a_stuck_reporting_thread() {
        let inner = Arc::new(RecordingSender::default());
        let gated = GatedSender::spans(&inner);
        set_up_logging();
        let mut config = config(4);
        config.shutdown_timeout = Duration::from_millis(50);
        let handler =
            WavefrontSpanHandler::new(config, gated.clone()).expect("threads should start");

        let gate = gated.gate.lock().expect("local lock should work");
        handler.end(context(0), timed_span("stuck"));
        wait_until(|| gated.entered.load(Ordering::SeqCst) == 1);
        handler.end(context(1), timed_span("never sent"));

        let started = Instant::now();
        handler.close();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(1 <= inner.flushes.load(Ordering::Relaxed));
        assert_eq!(1, inner.closes.load(Ordering::Relaxed));

        drop(gate);
        // The stuck span completes, the queued one is abandoned.
        wait_until(|| inner.sent_spans().len() == 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(1, inner.sent_spans().len());
    }

    #[test]
    fn abandons_a_stuck_heartbeat() {
        let inner = Arc::new(RecordingSender::default());
        let gated = GatedSender::metrics(&inner);
        set_up_logging();
        let mut config = config(4);
        config.shutdown_timeout = Duration::from_millis(100);
        config.heartbeat_interval = Duration::from_millis(10);
        config.extract_runtime_metrics = true;
        let gate = gated.gate.lock().expect("local lock should work");
        let handler =
            WavefrontSpanHandler::new(config, gated.clone()).expect("threads should start");
        wait_until(|| gated.entered.load(Ordering::SeqCst) == 1);

        let started = Instant::now();
        handler.close();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(1, inner.closes.load(Ordering::Relaxed));
        drop(gate);
    }

    #[test]
    fn heartbeats_flush_the_sender() {
        let sender = Arc::new(RecordingSender::default());
        let mut config = config(16);
        config.heartbeat_interval = Duration::from_millis(10);
        let handler = handler(config, &sender);

        handler.end(context(1), timed_span("op"));
        wait_until(|| 2 <= sender.flushes.load(Ordering::Relaxed));
        assert_eq!(0, sender.closes.load(Ordering::Relaxed));
        handler.close();
    }

    #[test]
    fn heartbeat_survives_a_panicking_sender() {
        let sender = Arc::new(RecordingSender::default());
        sender.panic_metrics_once.store(true, Ordering::Relaxed);
        let mut config = config(16);
        config.heartbeat_interval = Duration::from_millis(10);
        config.extract_runtime_metrics = true;
        let handler = handler(config, &sender);

        wait_until(|| {
            sender
                .sent_metrics()
                .iter()
                .any(|m| m.name == "reporter.spans.received")
        });
        assert!(!sender.panic_metrics_once.load(Ordering::Relaxed));
        handler.close();
    }

    #[test]
    fn discovers_heartbeats_and_clears_them_on_close() {
        let sender = Arc::new(RecordingSender::default());
        let mut config = config(16);
        config.red_metrics_custom_tag_keys = vec!["tenant".to_string()];
        let handler = handler(config, &sender);

        let mut span = timed_span("a");
        span.put_tag("tenant", "acme");
        handler.end(context(1), span);
        handler.end(context(2), timed_span("b"));
        handler.end(context(3), timed_span("c"));
        let mut span = timed_span("d");
        span.put_tag("component", "grpc");
        handler.end(context(4), span);
        let mut span = timed_span("e");
        span.put_tag("component", "jdbc");
        handler.end(context(5), span);
        wait_until(|| sender.sent_spans().len() == 5);

        let heartbeats = handler.discovered_heartbeats();
        assert_eq!(4, heartbeats.len());
        assert!(heartbeats
            .iter()
            .any(|key| key.custom_tags.get("tenant").map(String::as_str) == Some("acme")));
        let component_of = |key: &crate::HeartbeatKey| key.custom_tags.get("component").cloned();
        let mut components: Vec<Option<String>> = heartbeats.iter().map(component_of).collect();
        components.sort();
        components.dedup();
        assert_eq!(
            vec![
                Some("grpc".to_string()),
                Some("jdbc".to_string()),
                Some("none".to_string())
            ],
            components
        );
        assert!(heartbeats.iter().all(|key| key.application == "app1"));

        handler.close();
        assert!(handler.discovered_heartbeats().is_empty());
    }

    #[test]
    fn failed_sends_do_not_feed_red_metrics() {
        let sender = Arc::new(RecordingSender::default());
        sender.fail_spans.store(true, Ordering::Relaxed);
        let handler = handler(config(16), &sender);

        handler.end(context(1), timed_span("op"));
        wait_until(|| handler.metrics().errors == 1);
        assert!(handler.discovered_heartbeats().is_empty());
        handler.close();
    }

    #[test]
    fn heartbeat_reports_red_and_runtime_metrics() {
        let sender = Arc::new(RecordingSender::default());
        let mut config = config(16);
        config.heartbeat_interval = Duration::from_millis(20);
        config.extract_runtime_metrics = true;
        let handler = handler(config, &sender);

        let mut span = timed_span("GET /x");
        span.put_tag("component", "http");
        handler.end(context(1), span);

        wait_until(|| {
            let metrics = sender.sent_metrics();
            metrics.iter().any(|m| m.name == "~component.heartbeat")
                && metrics
                    .iter()
                    .any(|m| m.name.ends_with("app1.svc1.GET--x.invocation.count"))
                && metrics.iter().any(|m| m.name == "reporter.spans.received")
        });
        handler.close();

        let metrics = sender.sent_metrics();
        let heartbeat = metrics
            .iter()
            .find(|m| m.name == "~component.heartbeat")
            .expect("heartbeat was sent");
        assert_eq!("source", heartbeat.source);
        assert_eq!(
            Some("wavefront-generated"),
            heartbeat.tags.get("component").map(String::as_str)
        );
        let invocation = metrics
            .iter()
            .find(|m| m.name.ends_with("GET--x.invocation.count"))
            .expect("invocations were sent");
        assert_eq!(
            Some("http"),
            invocation.tags.get("component").map(String::as_str)
        );
        let received = metrics
            .iter()
            .find(|m| m.name == "reporter.spans.received")
            .expect("runtime metrics were sent");
        assert_eq!(1.0, received.value);
    }

    #[test]
    fn heartbeat_failures_do_not_stop_the_schedule() {
        let sender = Arc::new(RecordingSender::default());
        sender.fail_metrics.store(true, Ordering::Relaxed);
        let mut config = config(16);
        config.heartbeat_interval = Duration::from_millis(10);
        let handler = handler(config, &sender);

        handler.end(context(1), timed_span("op"));
        wait_until(|| sender.sent_spans().len() == 1);
        thread::sleep(Duration::from_millis(40));

        sender.fail_metrics.store(false, Ordering::Relaxed);
        wait_until(|| {
            sender
                .sent_metrics()
                .iter()
                .any(|m| m.name == "~component.heartbeat")
        });
        handler.close();
    }

    #[test]
    fn concurrent_producers() {
        let sender = Arc::new(RecordingSender::default());
        let handler = Arc::new(handler(config(10_000), &sender));

        let producers: Vec<_> = (0..4u8)
            .map(|producer| {
                let handler = handler.clone();
                thread::spawn(move || {
                    for i in 0..250u32 {
                        let mut span = Span::new(format!("op-{producer}"));
                        span.put_tag("seq", i.to_string());
                        handler.end(context(producer), span);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("producer should not panic");
        }
        handler.close();

        let spans = sender.sent_spans();
        assert_eq!(1000, spans.len());
        assert_eq!(1000, handler.metrics().received);
        // Each producer's spans arrive in the order it submitted them.
        for producer in 0..4u8 {
            let name = format!("op-{producer}");
            let sequence: Vec<u32> = spans
                .iter()
                .filter(|span| span.name == name)
                .filter_map(|span| {
                    span.tags
                        .iter()
                        .find(|(k, _)| k == "seq")
                        .and_then(|(_, v)| v.parse().ok())
                })
                .collect();
            assert_eq!((0..250).collect::<Vec<u32>>(), sequence);
        }
    }
}
