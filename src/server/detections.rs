use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::detect::Detection;
use crate::pipeline::FrameCell;

/// Detections paired with the most recently published frame; empty before
/// the first publish
pub fn latest_detections(cell: &FrameCell) -> Vec<Detection> {
    cell.snapshot()
        .map(|packet| packet.detections.clone())
        .unwrap_or_default()
}

pub(super) async fn detections(State(state): State<AppState>) -> Json<Vec<Detection>> {
    Json(latest_detections(&state.cell))
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub capture_state: &'static str,
    pub has_frame: bool,
    pub frames_published: u64,
    pub frames_skipped: u64,
    /// Time since the current frame was captured, `None` before the first publish
    pub last_frame_age_ms: Option<u64>,
    /// Capture-to-publish time of the current frame
    pub last_capture_latency_ms: Option<u64>,
    pub active_sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<Health> {
    let packet = state.cell.snapshot();
    Json(Health {
        capture_state: state.capture.state().as_str(),
        has_frame: packet.is_some(),
        frames_published: packet.as_ref().map_or(0, |packet| packet.sequence),
        frames_skipped: state.capture.skipped(),
        last_frame_age_ms: packet
            .as_ref()
            .map(|packet| millis(packet.captured_at.elapsed())),
        last_capture_latency_ms: packet.as_ref().map(|packet| millis(packet.latency())),
        active_sessions: state.active_sessions(),
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn empty_before_first_publish() {
        let cell = FrameCell::new();
        assert!(latest_detections(&cell).is_empty());
    }

    #[test]
    fn follows_latest_publish() {
        let cell = FrameCell::new();
        let person = Detection::new([10.0, 20.0, 30.0, 60.0], 0.9, 0, "person");
        cell.publish(Bytes::from_static(b"a"), vec![person.clone()]);
        assert_eq!(latest_detections(&cell), vec![person]);

        cell.publish(Bytes::from_static(b"b"), Vec::new());
        assert!(latest_detections(&cell).is_empty());
    }
}
