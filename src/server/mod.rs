//! HTTP surface: viewer page, MJPEG stream, detection query and health.
//!
//! Handlers only ever read the `FrameCell`; each `/video_feed` client gets its
//! own `StreamSession` task so a slow client cannot hold up anyone else.

mod detections;
mod page;
pub mod stream;

pub use detections::{latest_detections, Health};
pub use page::render_index;
pub use stream::{
    multipart_chunk, SessionEnd, StreamSession, StreamSettings, MULTIPART_CONTENT_TYPE,
};

use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pipeline::{CaptureStatus, FrameCell};
use crate::Config;

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    pub cell: Arc<FrameCell>,
    pub capture: Arc<CaptureStatus>,
    pub settings: StreamSettings,
    pub shutdown: CancellationToken,
    /// Drain time `serve` allows open connections once shutdown starts
    pub shutdown_grace: Duration,
    page: Bytes,
    sessions: Arc<SessionCounters>,
}

#[derive(Debug, Default)]
struct SessionCounters {
    next_id: AtomicU64,
    active: AtomicUsize,
}

impl AppState {
    pub fn new(
        cell: Arc<FrameCell>,
        capture: Arc<CaptureStatus>,
        config: &Config,
        shutdown: CancellationToken,
    ) -> Self {
        let page = render_index(
            config.capture.width,
            config.capture.height,
            config.detection.enabled,
        );
        Self {
            cell,
            capture,
            settings: StreamSettings::from_config(&config.stream),
            shutdown,
            shutdown_grace: config.server.shutdown_grace(),
            page: Bytes::from(page),
            sessions: Arc::new(SessionCounters::default()),
        }
    }

    /// Number of `/video_feed` sessions currently running
    pub fn active_sessions(&self) -> usize {
        self.sessions.active.load(Ordering::Acquire)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(page::index))
        .route("/video_feed", get(stream::video_feed))
        .route("/detections", get(detections::detections))
        .route("/health", get(detections::health))
        .with_state(state)
}

/// Serve until the state's shutdown token is cancelled.
///
/// Connections get `shutdown_grace` to finish after cancellation. A client
/// that has stopped reading can hold its connection open indefinitely, so
/// after the grace period `serve` returns without waiting for it.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let grace = state.shutdown_grace;
    info!("Serving on http://{}", listener.local_addr()?);

    let graceful = shutdown.clone();
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result,
        _ = shutdown.cancelled() => {}
    }

    match tokio::time::timeout(grace, &mut server).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Connections still open {grace:?} after shutdown, no longer waiting");
            Ok(())
        }
    }
}
