//! A [`wavefront-spans`] sender that talks to Wavefront directly.
//!
//! [`wavefront-spans-direct`] encodes spans, span logs, metrics and
//! distributions in the Wavefront data format and POSTs them to a cluster's
//! direct ingestion endpoint, authenticated with an API token. No proxy is
//! needed.
//!
//! Lines are batched per format. There's not a background timer in here: a
//! batch is sent as soon as it is full, and the span handler flushes after
//! every heartbeat and on close. Used without a handler, flush yourself:
//! ```rust
//! use wavefront_spans::Sender;
//!
//! fn periodic_job(sender: &wavefront_spans_direct::DirectIngestionSender) {
//!     if let Err(error) = sender.flush() {
//!         log::warn!("flush failed: {error}");
//!     }
//! }
//! ```
//!
//! # Examples
//!
//! ## Report `tracing` spans
//! ```rust
//! use std::sync::Arc;
//!
//! // First, we set up our sender.
//! let batch_size = 1024;
//! let insecure = false;
//! let sender = wavefront_spans_direct::DirectIngestionSender::new(
//!     "https://example.wavefront.com",
//!     &std::env::var("WAVEFRONT_TOKEN").unwrap_or_else(|_| "none".to_string()),
//!     batch_size,
//!     insecure,
//! ).expect("should be able to make a direct ingestion sender");
//!
//! // Next, we hand it to a span handler, and the handler to a subscriber.
//! let handler = Arc::new(
//!     wavefront_spans::WavefrontSpanHandler::new(
//!         wavefront_spans::HandlerConfig::new(wavefront_spans::ApplicationTags::new("shop", "checkout")),
//!         Arc::new(sender),
//!     )
//!     .expect("should be able to start the reporting threads"),
//! );
//! let level = "debug".parse().unwrap();
//! let subscriber = wavefront_spans::SpanSubscriber::new(level, handler.clone(), |_| true);
//!
//! // Finally, we install the subscriber.
//! tracing::subscriber::set_global_default(subscriber)
//!     .expect("I should be able to set the global trace subscriber");
//!
//! // Now the rest of your application will report spans to Wavefront.
//! ```
//!

mod channel_connection;
mod direct_ingestion_sender;
mod wire_format;

pub use direct_ingestion_sender::DirectIngestionSender;
pub use wire_format::{
    distribution_line, metric_line, span_line, span_logs_line, ReportFormat,
};
