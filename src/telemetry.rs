//! Logging and distributed tracing setup
//!
//! Log lines go through [`LineCap`], which truncates every line to a fixed
//! byte length so signed trust reports cannot flood the log. Spans are
//! exported over OTLP when an endpoint is configured.

use std::borrow::Cow;
use std::io::{self, Write};

use opentelemetry::trace::TraceError;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self as sdktrace, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;

pub const SERVICE_NAME: &str = "isecl-k8s-controller";

/// Default cap on the length of one log line, in bytes
pub const DEFAULT_LOG_MAX_LENGTH: usize = 1500;

/// Build the OpenTelemetry layer exporting spans to the OTLP collector.
///
/// The endpoint comes from `OTEL_EXPORTER_OTLP_ENDPOINT`. The batch exporter
/// runs on the tokio runtime and is installed as the global provider, so
/// [`shutdown_telemetry`] flushes it.
pub fn init_telemetry<S>(_subscriber: &S) -> Result<OpenTelemetryLayer<S, Tracer>, TraceError>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let mut exporter = opentelemetry_otlp::new_exporter().tonic();
    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        exporter = exporter.with_endpoint(endpoint);
    }

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", SERVICE_NAME),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])),
        )
        .install_batch(runtime::Tokio)?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush pending spans and stop the exporter
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// [`MakeWriter`] that caps each line written through it at `max_len` bytes.
///
/// A cap of zero disables truncation.
#[derive(Clone, Copy, Debug)]
pub struct LineCap<M> {
    inner: M,
    max_len: usize,
}

impl<M> LineCap<M> {
    pub fn new(inner: M, max_len: usize) -> Self {
        Self { inner, max_len }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for LineCap<M> {
    type Writer = CappedWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        CappedWriter {
            inner: self.inner.make_writer(),
            max_len: self.max_len,
        }
    }
}

pub struct CappedWriter<W> {
    inner: W,
    max_len: usize,
}

impl<W: Write> Write for CappedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_all(&cap_lines(buf, self.max_len))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn cap_lines(buf: &[u8], max_len: usize) -> Cow<'_, [u8]> {
    if max_len == 0 || buf.split(|b| *b == b'\n').all(|line| line.len() <= max_len) {
        return Cow::Borrowed(buf);
    }

    let mut capped = Vec::with_capacity(buf.len());
    for (i, line) in buf.split(|b| *b == b'\n').enumerate() {
        if i > 0 {
            capped.push(b'\n');
        }
        capped.extend_from_slice(&line[..char_boundary(line, max_len)]);
    }
    Cow::Owned(capped)
}

/// Largest cut point not past `max_len` that does not split a UTF-8 sequence
fn char_boundary(line: &[u8], max_len: usize) -> usize {
    if line.len() <= max_len {
        return line.len();
    }
    let mut cut = max_len;
    while cut > 0 && (line[cut] & 0xC0) == 0x80 {
        cut -= 1;
    }
    cut
}
