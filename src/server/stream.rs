//! `/video_feed`: one `StreamSession` task per connected client.
//!
//! The session polls the `FrameCell` on its own cadence and pushes complete
//! multipart chunks into a depth-1 channel that backs the response body. When
//! the client goes away hyper drops the body, the channel closes, and the next
//! send tells the session to stop.

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use super::{AppState, SessionCounters};
use crate::error::PipelineError;
use crate::pipeline::FrameCell;
use crate::telemetry::metric;
use crate::StreamConfig;

pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
const CHUNK_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const CHUNK_TRAILER: &[u8] = b"\r\n";

/// Frame one JPEG as a complete multipart part
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut chunk = BytesMut::with_capacity(CHUNK_HEADER.len() + jpeg.len() + CHUNK_TRAILER.len());
    chunk.extend_from_slice(CHUNK_HEADER);
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(CHUNK_TRAILER);
    chunk.freeze()
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Wait between checks while the cell is empty
    pub poll_interval: Duration,
    /// Pause after each emitted chunk
    pub frame_interval: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            frame_interval: config.frame_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the connection
    Disconnected,
    /// The process is shutting down
    Shutdown,
}

/// Per-client emitter.
///
/// Delivery is at-most-current-value: pacing is not tied to the producer, so
/// a session may send the same frame twice or skip frames. It never sends a
/// frame older than one it already sent because the cell's sequence only grows.
pub struct StreamSession {
    cell: Arc<FrameCell>,
    settings: StreamSettings,
    shutdown: CancellationToken,
    sink: flume::Sender<Bytes>,
}

impl StreamSession {
    pub fn new(
        cell: Arc<FrameCell>,
        settings: StreamSettings,
        shutdown: CancellationToken,
        sink: flume::Sender<Bytes>,
    ) -> Self {
        Self {
            cell,
            settings,
            shutdown,
            sink,
        }
    }

    pub async fn run(self) -> SessionEnd {
        loop {
            let Some(packet) = self.cell.snapshot() else {
                if let Some(end) = self.wait_for_frame().await {
                    return end;
                }
                continue;
            };

            // The chunk is complete before it reaches the writer, so a failed
            // send never leaves half a part on the wire
            let chunk = multipart_chunk(&packet.jpeg);
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                sent = self.sink.send_async(chunk) => {
                    if let Err(err) = sent.map_err(|_| PipelineError::ClientWrite) {
                        debug!(sequence = packet.sequence, "{err}");
                        return SessionEnd::Disconnected;
                    }
                }
            }
            metrics::counter!(metric::CHUNKS_SENT).increment(1);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                _ = tokio::time::sleep(self.settings.frame_interval) => {}
            }
        }
    }

    async fn wait_for_frame(&self) -> Option<SessionEnd> {
        if self.sink.is_disconnected() {
            return Some(SessionEnd::Disconnected);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Some(SessionEnd::Shutdown),
            _ = self.cell.published() => None,
            _ = tokio::time::sleep(self.settings.poll_interval) => None,
        }
    }
}

/// Keeps the active-session count and gauge in step with the session task
struct SessionGuard {
    counters: Arc<SessionCounters>,
}

impl SessionGuard {
    fn new(counters: Arc<SessionCounters>) -> Self {
        let active = counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::gauge!(metric::ACTIVE_SESSIONS).set(active as f64);
        Self { counters }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let active = self.counters.active.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::gauge!(metric::ACTIVE_SESSIONS).set(active as f64);
    }
}

pub(super) async fn video_feed(State(state): State<AppState>) -> Response {
    let (sink, chunks) = flume::bounded::<Bytes>(1);
    let id = state.sessions.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let session = StreamSession::new(
        state.cell.clone(),
        state.settings,
        state.shutdown.child_token(),
        sink,
    );
    let guard = SessionGuard::new(state.sessions.clone());

    tokio::spawn(
        async move {
            let _guard = guard;
            info!("Client connected to stream");
            let end = session.run().await;
            match end {
                SessionEnd::Disconnected => info!("Client disconnected from stream"),
                SessionEnd::Shutdown => debug!("Stream closed for shutdown"),
            }
        }
        .instrument(info_span!("stream_session", session = id)),
    );

    let body = Body::from_stream(chunks.into_stream().map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;
    use tokio::time::timeout;

    fn settings() -> StreamSettings {
        StreamSettings {
            poll_interval: Duration::from_millis(5),
            frame_interval: Duration::from_millis(2),
        }
    }

    fn start(
        cell: &Arc<FrameCell>,
        token: &CancellationToken,
    ) -> (tokio::task::JoinHandle<SessionEnd>, flume::Receiver<Bytes>) {
        let (tx, rx) = flume::bounded(1);
        let session = StreamSession::new(cell.clone(), settings(), token.clone(), tx);
        (tokio::spawn(session.run()), rx)
    }

    fn payload(chunk: &[u8]) -> &[u8] {
        &chunk[CHUNK_HEADER.len()..chunk.len() - CHUNK_TRAILER.len()]
    }

    #[test]
    fn chunk_layout() {
        let chunk = multipart_chunk(b"JPEG");
        assert_eq!(
            &chunk[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n"
        );
    }

    #[tokio::test]
    async fn waits_silently_until_first_publish() {
        let cell = Arc::new(FrameCell::new());
        let token = CancellationToken::new();
        let (_session, rx) = start(&cell, &token);

        assert!(timeout(Duration::from_millis(50), rx.recv_async()).await.is_err());

        cell.publish(Bytes::from_static(b"first"), Vec::new());
        let chunk = timeout(Duration::from_secs(1), rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk, multipart_chunk(b"first"));
    }

    #[tokio::test]
    async fn dropped_receiver_ends_session() {
        let cell = Arc::new(FrameCell::new());
        cell.publish(Bytes::from_static(b"frame"), Vec::new());
        let token = CancellationToken::new();
        let (session, rx) = start(&cell, &token);

        rx.recv_async().await.unwrap();
        drop(rx);
        let end = timeout(Duration::from_secs(1), session).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_before_any_frame_ends_session() {
        let cell = Arc::new(FrameCell::new());
        let token = CancellationToken::new();
        let (session, rx) = start(&cell, &token);
        drop(rx);

        let end = timeout(Duration::from_secs(1), session).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_ends_blocked_session() {
        let cell = Arc::new(FrameCell::new());
        cell.publish(Bytes::from_static(b"frame"), Vec::new());
        let token = CancellationToken::new();
        // Never read: the session ends up parked on a full channel
        let (session, _rx) = start(&cell, &token);

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let end = timeout(Duration::from_secs(1), session).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Shutdown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stalled_client_does_not_hold_up_others() {
        let cell = Arc::new(FrameCell::new());
        let token = CancellationToken::new();

        let producer_cell = cell.clone();
        let producer_token = token.clone();
        let producer = thread::spawn(move || {
            let mut i = 0u64;
            while !producer_token.is_cancelled() {
                i += 1;
                producer_cell.publish(Bytes::from(i.to_be_bytes().to_vec()), Vec::new());
                thread::sleep(Duration::from_millis(1));
            }
            i
        });

        let (_stalled, _stalled_rx) = start(&cell, &token);
        let healthy: Vec<_> = (0..3).map(|_| start(&cell, &token)).collect();

        for (_, rx) in &healthy {
            for _ in 0..10 {
                timeout(Duration::from_secs(2), rx.recv_async())
                    .await
                    .expect("healthy session starved")
                    .unwrap();
            }
        }

        token.cancel();
        let published = producer.join().unwrap();
        assert!(published > 10, "producer was slowed down");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_arrive_in_publish_order() {
        let cell = Arc::new(FrameCell::new());
        let token = CancellationToken::new();
        let (_session, rx) = start(&cell, &token);

        let producer_cell = cell.clone();
        let producer = thread::spawn(move || {
            for i in 1..=200u64 {
                producer_cell.publish(Bytes::from(i.to_be_bytes().to_vec()), Vec::new());
                thread::sleep(Duration::from_micros(500));
            }
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut last = 0u64;
        while last < 200 && Instant::now() < deadline {
            let Ok(Ok(chunk)) = timeout(Duration::from_millis(500), rx.recv_async()).await else {
                break;
            };
            let seq = u64::from_be_bytes(payload(&chunk).try_into().unwrap());
            assert!(seq >= last, "saw frame {seq} after {last}");
            last = seq;
        }
        producer.join().unwrap();
        token.cancel();
        assert!(last > 0);
    }
}
