use std::{fmt::Debug, time::SystemTime};

use tracing::{field::Visit, span::Attributes, Metadata};

use crate::{span::epoch_micros, Span, SpanKind, TraceContext};

/// Fields that set the span kind rather than becoming tags.
const SPAN_KIND_FIELDS: [&str; 2] = ["span.kind", "otel.kind"];
/// Field that replaces the span's name.
const SPAN_NAME_FIELD: &str = "otel.name";
const MESSAGE_FIELD: &str = "message";

/// A span that is still open, as tracked by [`crate::SpanSubscriber`].
#[derive(Debug)]
pub(crate) struct SpanRecorder {
    pub ref_count: usize,
    pub metadata: &'static Metadata<'static>,
    pub context: TraceContext,
    pub span: Span,
}

impl SpanRecorder {
    pub fn start_root(attributes: &Attributes) -> Self {
        let mut trace_id: [u8; 16] = rand::random();
        // Keep the trace id valid.
        if trace_id == [0; 16] {
            trace_id[15] = 1;
        }
        Self::start(attributes, trace_id, None)
    }

    pub fn start_child(attributes: &Attributes, parent: &TraceContext) -> Self {
        Self::start(attributes, parent.trace_id, Some(parent.span_id))
    }

    fn start(
        attributes: &Attributes,
        trace_id: [u8; 16],
        parent_span_id: Option<[u8; 8]>,
    ) -> Self {
        let metadata = attributes.metadata();
        let mut recorder = Self {
            ref_count: 1,
            metadata,
            context: TraceContext {
                trace_id,
                span_id: random_span_id(),
                parent_span_id,
                ..Default::default()
            },
            span: Span {
                name: Some(metadata.name().to_string()),
                start_micros: epoch_micros(SystemTime::now()),
                ..Default::default()
            },
        };
        attributes.values().record(&mut recorder);
        recorder
    }

    pub fn record_event(&mut self, event: &tracing::Event<'_>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        self.span
            .annotate(epoch_micros(SystemTime::now()), visitor.into_annotation());
    }

    pub fn finish(mut self) -> (TraceContext, Span) {
        self.span.end_micros = epoch_micros(SystemTime::now());
        (self.context, self.span)
    }

    fn record_value(&mut self, field: &tracing::field::Field, value: String) {
        let name = field.name();
        if SPAN_KIND_FIELDS.contains(&name) {
            self.span.kind = SpanKind::parse(&value);
        } else if name == SPAN_NAME_FIELD {
            self.span.name = Some(value);
        } else {
            self.span.put_tag(name, value);
        }
    }
}

fn random_span_id() -> [u8; 8] {
    loop {
        let span_id: [u8; 8] = rand::random();
        if span_id != [0; 8] {
            return span_id;
        }
    }
}

impl Visit for SpanRecorder {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn Debug) {
        self.record_value(field, format!("{value:?}"));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.record_value(field, value.to_string());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.record_value(field, value.to_string());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.record_value(field, value.to_string());
    }

    fn record_i128(&mut self, field: &tracing::field::Field, value: i128) {
        self.record_value(field, value.to_string());
    }

    fn record_u128(&mut self, field: &tracing::field::Field, value: u128) {
        self.record_value(field, value.to_string());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.record_value(field, value.to_string());
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.record_value(field, value.to_owned());
    }

    fn record_error(
        &mut self,
        _field: &tracing::field::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        // Any recorded error marks the whole span as failed.
        self.span.error = Some(value.to_string());
    }
}

/// Flattens an event into a single annotation: the message, then `key=value` for every other field.
#[derive(Default)]
struct EventVisitor {
    message: Option<String>,
    fields: Vec<String>,
}

impl EventVisitor {
    fn into_annotation(self) -> String {
        let mut parts = Vec::with_capacity(1 + self.fields.len());
        parts.extend(self.message);
        parts.extend(self.fields);
        parts.join(" ")
    }
}

impl Visit for EventVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn Debug) {
        if field.name() == MESSAGE_FIELD {
            self.message = Some(format!("{value:?}"));
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == MESSAGE_FIELD {
            self.message = Some(value.to_owned());
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }

    fn record_error(
        &mut self,
        field: &tracing::field::Field,
        value: &(dyn std::error::Error + 'static),
    ) {
        self.fields.push(format!("{}={value}", field.name()));
    }
}
