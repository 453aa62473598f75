use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Keeps the non-blocking writers alive; dropping it flushes buffered
/// JSONL lines to disk.
pub(crate) struct TracingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Initialize the layered tracing subscriber.
///
/// Layers:
/// 1. Console, always on, filtered by `RUST_LOG` (default `info`)
/// 2. JSONL file, enabled by `COURIER_TRACE_FILE`, filtered at `debug`
pub(crate) fn init() -> TracingGuard {
    let mut guards = Vec::new();

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer().with_target(false).with_filter(console_filter);

    let jsonl_layer = if let Ok(trace_file) = std::env::var("COURIER_TRACE_FILE") {
        let (dir, filename) = split_trace_path(&trace_file);
        let file_appender = tracing_appender::rolling::never(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);

        let jsonl_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        Some(jsonl_layer(non_blocking, jsonl_filter))
    } else {
        None
    };

    Registry::default()
        .with(console_layer)
        .with(jsonl_layer)
        .init();

    TracingGuard { _guards: guards }
}

/// One JSON object per line, carrying the span list, the source location and
/// span open/close events.
pub(crate) fn jsonl_layer<S, W>(writer: W, filter: EnvFilter) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_writer(writer)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(filter)
}

fn split_trace_path(trace_file: &str) -> (PathBuf, String) {
    let path = Path::new(trace_file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let filename = path.file_name().map_or_else(
        || "courier-traces.jsonl".to_owned(),
        |f| f.to_string_lossy().into_owned(),
    );
    (dir, filename)
}
