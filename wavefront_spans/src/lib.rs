//! A span reporting pipeline for Wavefront.
//!
//! [`wavefront-spans`] takes finished spans from your tracing framework,
//! queues them without ever blocking the thread that finished them, and
//! forwards them to a [`Sender`] from a background thread. Along the way it
//! derives RED (rate, error, duration) metrics per operation and a heartbeat
//! per reporting application.
//!
//! Telemetry is sacrificed before latency: when the queue is full, spans are
//! dropped and counted. Nothing is retried.
//!
//! The pipeline does not care where spans come from. [`SpanSubscriber`]
//! adapts `tracing`; anything else can call [`SpanHandler::end`] directly.
//!
//! # Examples
//!
//! ## Log instead of sending
//! ```rust
//! use std::{collections::BTreeMap, sync::Arc};
//! use wavefront_spans::{OutboundSpan, SendError, Sender};
//!
//! // First, we implement a sender.
//! struct LogSender;
//! impl Sender for LogSender {
//!     fn send_span(&self, span: &OutboundSpan<'_>) -> Result<(), SendError> {
//!         log::info!("span: {span:?}");
//!         Ok(())
//!     }
//!     fn send_metric(&self, name: &str, value: f64, _: u64, _: &str, _: &BTreeMap<String, String>) -> Result<(), SendError> {
//!         log::info!("{name}: {value}");
//!         Ok(())
//!     }
//!     fn send_distribution(&self, name: &str, centroids: &[(f64, u32)], _: u64, _: &str, _: &BTreeMap<String, String>) -> Result<(), SendError> {
//!         log::info!("{name}: {centroids:?}");
//!         Ok(())
//!     }
//!     fn flush(&self) -> Result<(), SendError> { Ok(()) }
//!     fn close(&self) -> Result<(), SendError> { Ok(()) }
//! }
//!
//! // Next, we configure a handler and a subscriber that feeds it.
//! let handler = Arc::new(
//!     wavefront_spans::WavefrontSpanHandler::new(
//!         wavefront_spans::HandlerConfig::new(wavefront_spans::ApplicationTags::new("shop", "checkout")),
//!         Arc::new(LogSender),
//!     )
//!     .expect("I should be able to start the reporting threads"),
//! );
//! let level = "debug".parse().unwrap();
//! let subscriber = wavefront_spans::SpanSubscriber::new(level, handler.clone(), |_| true);
//!
//! // Finally, we install the subscriber.
//! tracing::subscriber::set_global_default(subscriber)
//!     .expect("I should be able to set the global trace subscriber");
//!
//! // Now the rest of your application reports spans. Close the handler on the way out.
//! handler.close();
//! ```
//!

mod application_tags;
mod config;
mod heartbeater;
mod red_metrics;
mod sender;
mod span;
mod span_buffer;
mod span_handler;
mod span_metrics;
mod span_recorder;
mod span_subscriber;

pub mod tag_list;

pub use application_tags::ApplicationTags;
pub use application_tags::NULL_TAG_VAL;
pub use config::HandlerConfig;
pub use red_metrics::sanitize;
pub use red_metrics::HeartbeatKey;
pub use red_metrics::HEARTBEAT_METRIC;
pub use red_metrics::TRACING_DERIVED_PREFIX;
pub use sender::OutboundSpan;
pub use sender::SendError;
pub use sender::Sender;
pub use sender::SpanLog;
pub use span::epoch_micros;
pub use span::Annotation;
pub use span::Span;
pub use span::SpanKind;
pub use span::TraceContext;
pub use span_buffer::DEFAULT_MAX_QUEUE_SIZE;
pub use span_handler::duration_millis;
pub use span_handler::SpanHandler;
pub use span_handler::WavefrontSpanHandler;
pub use span_handler::DEFAULT_SPAN_NAME;
pub use span_metrics::SpanMetricsSnapshot;
pub use span_subscriber::SpanSubscriber;
