use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{atomic::AtomicU64, Mutex},
};

use thread_local::ThreadLocal;
use tracing::{metadata::LevelFilter, span, Level, Subscriber};

use crate::{span_recorder::SpanRecorder, Span, SpanHandler};

/// A `tracing` subscriber that turns closed spans into [`Span`]s for a [`SpanHandler`].
///
/// Spans are handed over synchronously on the thread that closes them.
/// Events become annotations on the innermost entered span.
pub struct SpanSubscriber<Handler, FnShouldRecord> {
    id_counter: AtomicU64,
    current_spans: Mutex<HashMap<span::Id, SpanRecorder>>,
    level: Option<Level>,
    active_span_stack: ThreadLocal<Mutex<Vec<span::Id>>>,
    handler: Handler,
    should_record_span: FnShouldRecord,
    local_ip: Option<IpAddr>,
}

impl<Handler: SpanHandler, FnShouldRecord: Fn(&Span) -> bool>
    SpanSubscriber<Handler, FnShouldRecord>
{
    pub fn new(level: LevelFilter, handler: Handler, should_record_span: FnShouldRecord) -> Self {
        Self {
            id_counter: Default::default(),
            current_spans: Default::default(),
            level: level.into_level(),
            active_span_stack: ThreadLocal::new(),
            handler,
            should_record_span,
            local_ip: None,
        }
    }

    /// Reported on every span as the `ipv4` or `ipv6` tag.
    pub fn with_local_ip(mut self, local_ip: IpAddr) -> Self {
        self.local_ip = Some(local_ip);
        self
    }

    fn insert_new_span(&self, id: span::Id, recorder: SpanRecorder) {
        let mut spans = self
            .current_spans
            .lock()
            .expect("span mutex should not be poisoned");
        spans.insert(id, recorder);
    }

    fn use_span<T>(&self, id: &span::Id, use_it: impl FnOnce(&mut SpanRecorder) -> T) -> Option<T> {
        let mut spans = self
            .current_spans
            .lock()
            .expect("span mutex should not be poisoned");

        spans.get_mut(id).map(use_it)
    }

    fn possibly_remove_span(
        &self,
        id: &span::Id,
        use_it: impl FnOnce(&mut SpanRecorder) -> bool,
    ) -> Option<SpanRecorder> {
        let mut spans = self
            .current_spans
            .lock()
            .expect("span mutex should not be poisoned");

        match spans.get_mut(id).map(use_it) {
            Some(true) => spans.remove(id),
            _ => None,
        }
    }

    fn start_child_of(&self, parent: &span::Id, attributes: &span::Attributes<'_>) -> Option<SpanRecorder> {
        self.use_span(parent, |parent| {
            SpanRecorder::start_child(attributes, &parent.context)
        })
    }

    fn active_span(&self) -> Option<span::Id> {
        self.active_span_stack
            .get_or_default()
            .lock()
            .expect("threadlocal current")
            .last()
            .cloned()
    }
}

impl<
        Handler: SpanHandler + 'static,
        FnShouldRecord: Fn(&Span) -> bool + Send + Sync + 'static,
    > Subscriber for SpanSubscriber<Handler, FnShouldRecord>
{
    fn enabled(&self, metadata: &tracing::Metadata<'_>) -> bool {
        match &self.level {
            Some(level) => metadata.level() <= level,
            None => false,
        }
    }

    fn max_level_hint(&self) -> Option<LevelFilter> {
        Some(LevelFilter::from(self.level))
    }

    fn new_span(&self, attributes: &span::Attributes<'_>) -> span::Id {
        let mut id = self
            .id_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        // tracing ids may not be 0.
        while id == 0 {
            id = self
                .id_counter
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        log::trace!("new span: {id} - {attributes:?}");

        let parent = match attributes.parent() {
            Some(parent) => Some(parent.clone()),
            None if attributes.is_contextual() => self.active_span(),
            None => None,
        };
        let recorder = match parent {
            Some(parent) => self
                .start_child_of(&parent, attributes)
                .unwrap_or_else(|| {
                    log::debug!("could not find parent span {parent:?} - starting new root");
                    SpanRecorder::start_root(attributes)
                }),
            None => SpanRecorder::start_root(attributes),
        };

        let id = span::Id::from_u64(id);
        self.insert_new_span(id.clone(), recorder);
        id
    }

    fn record(&self, span: &span::Id, values: &span::Record<'_>) {
        self.use_span(span, |span| values.record(span));
    }

    fn record_follows_from(&self, _span: &span::Id, _follows: &span::Id) {}

    fn event(&self, event: &tracing::Event<'_>) {
        let span = match event.parent() {
            Some(parent) => Some(parent.clone()),
            None if event.is_contextual() => self.active_span(),
            None => None,
        };
        if let Some(id) = span {
            self.use_span(&id, |span| span.record_event(event));
        }
    }

    fn enter(&self, span: &span::Id) {
        let mut active_span_stack = self
            .active_span_stack
            .get_or_default()
            .lock()
            .expect("threadlocal enter");
        log::trace!(
            "entering span. Current: {:?}, entering: {:?}",
            *active_span_stack,
            span
        );
        active_span_stack.push(span.clone());
    }

    fn exit(&self, span: &span::Id) {
        let mut active_span_stack = self
            .active_span_stack
            .get_or_default()
            .lock()
            .expect("threadlocal exit");
        if active_span_stack.last() == Some(span) {
            active_span_stack.pop();
        } else {
            log::trace!(
                "tried to exit non-active span. Current: {:?}, attempted: {:?}",
                *active_span_stack,
                span
            );
        }
    }

    fn current_span(&self) -> tracing_core::span::Current {
        match self.active_span() {
            Some(id) => match self.use_span(&id, |span| span.metadata) {
                Some(metadata) => tracing_core::span::Current::new(id, metadata),
                None => tracing_core::span::Current::none(),
            },
            None => tracing_core::span::Current::none(),
        }
    }

    fn clone_span(&self, id: &span::Id) -> span::Id {
        self.use_span(id, |span| span.ref_count += 1);
        id.clone()
    }

    fn try_close(&self, id: span::Id) -> bool {
        let closed = self.possibly_remove_span(&id, |span| {
            span.ref_count -= 1;
            span.ref_count == 0
        });
        match closed {
            Some(recorder) => {
                let (context, mut span) = recorder.finish();
                span.local_ip = self.local_ip;
                log::trace!("closed span {context:?}: {span:?}");
                if (self.should_record_span)(&span) {
                    self.handler.end(context, span);
                }
                true
            }
            None => false,
        }
    }
}
