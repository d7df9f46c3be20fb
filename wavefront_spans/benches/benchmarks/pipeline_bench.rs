use std::{collections::BTreeMap, sync::Arc, time::Duration};

use criterion::{black_box, criterion_group, Criterion};
use tracing::{metadata::LevelFilter, Instrument, Level};
use wavefront_spans::{
    ApplicationTags, HandlerConfig, OutboundSpan, SendError, Sender, Span, SpanHandler,
    SpanSubscriber, TraceContext, WavefrontSpanHandler,
};

struct NoSender;
impl Sender for NoSender {
    fn send_span(&self, _span: &OutboundSpan<'_>) -> Result<(), SendError> {
        Ok(())
    }
    fn send_metric(
        &self,
        _name: &str,
        _value: f64,
        _timestamp_millis: u64,
        _source: &str,
        _tags: &BTreeMap<String, String>,
    ) -> Result<(), SendError> {
        Ok(())
    }
    fn send_distribution(
        &self,
        _name: &str,
        _centroids: &[(f64, u32)],
        _timestamp_millis: u64,
        _source: &str,
        _tags: &BTreeMap<String, String>,
    ) -> Result<(), SendError> {
        Ok(())
    }
    fn flush(&self) -> Result<(), SendError> {
        Ok(())
    }
    fn close(&self) -> Result<(), SendError> {
        Ok(())
    }
}

struct NoHandler;
impl SpanHandler for NoHandler {
    fn end(&self, _context: TraceContext, _span: Span) -> bool {
        true
    }
}

fn handler(max_queue_size: usize) -> Arc<WavefrontSpanHandler> {
    let config = HandlerConfig {
        max_queue_size,
        application_tags: ApplicationTags::new("bench", "bench"),
        heartbeat_interval: Duration::from_secs(3600),
        drop_warning_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    Arc::new(
        WavefrontSpanHandler::new(config, Arc::new(NoSender))
            .expect("reporting threads should start"),
    )
}

fn bench_span() -> Span {
    let mut span = Span::new("GET /bench");
    span.start_micros = 1_600_000_000_000_000;
    span.end_micros = 1_600_000_000_001_000;
    span.put_tag("http.method", "GET");
    span.put_tag("component", "bench");
    span
}

fn ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("Ingest");

    let accepting = handler(1 << 20);
    group.bench_function("end with room", |bencher| {
        bencher.iter(|| black_box(accepting.end(TraceContext::default(), bench_span())))
    });
    accepting.close();

    // A closed handler takes the drop path on every span.
    let dropping = handler(1);
    dropping.close();
    group.bench_function("end while dropping", |bencher| {
        bencher.iter(|| black_box(dropping.end(TraceContext::default(), bench_span())))
    });
}

fn subscriber(c: &mut Criterion) {
    let mut group = c.benchmark_group("Subscriber");

    let subscriber = SpanSubscriber::new(LevelFilter::DEBUG, NoHandler, |_| true);
    tracing::subscriber::with_default(subscriber, || {
        group.bench_function("root and child", |bencher| {
            bencher.iter(|| {
                let span = tracing::span!(Level::INFO, "bench", some = tracing::field::Empty);
                let _guard = black_box(span.enter());
                span.record("some", 42);
                {
                    let child_span = tracing::span!(parent: &span, Level::DEBUG, "subspan");
                    let _a = async {}.instrument(child_span);
                }
            })
        });
    });
}

criterion_group!(benches, ingest, subscriber);
