//! Logging and metrics setup

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Metric names emitted through the `metrics` facade
pub mod metric {
    pub const FRAMES_PUBLISHED: &str = "framecast_frames_published_total";
    pub const ITERATIONS_SKIPPED: &str = "framecast_iterations_skipped_total";
    pub const ACTIVE_SESSIONS: &str = "framecast_active_sessions";
    pub const CHUNKS_SENT: &str = "framecast_chunks_sent_total";
    pub const CAPTURE_LATENCY: &str = "framecast_capture_latency_seconds";
}

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init(default_filter: &str) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.try_init()?;
    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(metric::FRAMES_PUBLISHED, "Frames published to the frame cell");
    metrics::describe_counter!(
        metric::ITERATIONS_SKIPPED,
        "Capture iterations dropped, labelled by failure reason"
    );
    metrics::describe_gauge!(metric::ACTIVE_SESSIONS, "Connected /video_feed clients");
    metrics::describe_counter!(metric::CHUNKS_SENT, "Multipart chunks handed to clients");
    metrics::describe_histogram!(
        metric::CAPTURE_LATENCY,
        metrics::Unit::Seconds,
        "Time from frame capture to publication"
    );
}
