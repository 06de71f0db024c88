//! Producer loop: acquire → detect → annotate → encode → publish.
//!
//! The loop owns the capture device and runs on its own OS thread because
//! device reads and inference block. It is the only writer of the `FrameCell`.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn};

use super::FrameCell;
use crate::capture::{decode_frame, CaptureDevice, Frame};
use crate::detect::{Detection, Detector};
use crate::error::PipelineError;
use crate::render::{annotate, encode_jpeg};
use crate::telemetry::metric;
use crate::CaptureConfig;

/// Lifecycle of the capture loop as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Opening,
    Running,
    /// Exited on shutdown or end of stream
    Stopped,
    /// Exited because the device failed to open or to deliver a frame
    Failed,
}

impl CaptureState {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureState::Opening => "opening",
            CaptureState::Running => "running",
            CaptureState::Stopped => "stopped",
            CaptureState::Failed => "failed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => CaptureState::Opening,
            1 => CaptureState::Running,
            2 => CaptureState::Stopped,
            _ => CaptureState::Failed,
        }
    }
}

/// Read-only view of the loop's progress, shared with the HTTP layer
#[derive(Debug, Default)]
pub struct CaptureStatus {
    state: AtomicU8,
    skipped: AtomicU64,
}

impl CaptureStatus {
    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Iterations dropped because inference or encoding failed
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    fn set(&self, state: CaptureState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Why the capture loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    EndOfStream,
    DeviceOpenFailed,
    AcquisitionFailed,
}

pub struct CaptureLoop {
    device: Box<dyn CaptureDevice>,
    detector: Option<Box<dyn Detector>>,
    cell: Arc<FrameCell>,
    status: Arc<CaptureStatus>,
    shutdown: CancellationToken,
    width: u32,
    height: u32,
    jpeg_quality: u8,
    pin_core: Option<usize>,
}

impl CaptureLoop {
    pub fn new<D: CaptureDevice + 'static>(
        device: D,
        cell: Arc<FrameCell>,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            device: Box::new(device),
            detector: None,
            cell,
            status: Arc::new(CaptureStatus::default()),
            shutdown: CancellationToken::new(),
            width: config.width,
            height: config.height,
            jpeg_quality: 85,
            pin_core: config.pin_core,
        }
    }

    /// Run inference and burn in annotations each iteration
    pub fn with_detector(mut self, detector: Option<Box<dyn Detector>>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    /// Stop after the current iteration once `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn status(&self) -> Arc<CaptureStatus> {
        self.status.clone()
    }

    /// Run the loop on a dedicated, optionally core-pinned, thread
    pub fn spawn(self) -> std::io::Result<JoinHandle<LoopExit>> {
        let pin_core = self.pin_core;
        thread::Builder::new()
            .name("framecast-capture".into())
            .spawn(move || {
                if let Some(core) = pin_core {
                    pin_current_thread(core);
                }
                self.run()
            })
    }

    /// Run the loop on the calling thread until it stops
    pub fn run(mut self) -> LoopExit {
        let span = info_span!("capture", device = %self.device.name());
        let _guard = span.enter();

        let exit = self.run_until_stopped();
        self.device.close();
        self.status.set(match exit {
            LoopExit::Shutdown | LoopExit::EndOfStream => CaptureState::Stopped,
            LoopExit::DeviceOpenFailed | LoopExit::AcquisitionFailed => CaptureState::Failed,
        });
        info!(?exit, published = self.cell.published_count(), "Capture loop stopped");
        exit
    }

    fn run_until_stopped(&mut self) -> LoopExit {
        self.status.set(CaptureState::Opening);
        if let Err(err) = self.device.open(self.width, self.height) {
            let err = PipelineError::DeviceOpen(err);
            error!("{err}; the stream will stay empty");
            return LoopExit::DeviceOpenFailed;
        }

        self.status.set(CaptureState::Running);
        info!(
            "Capture running at {}x{} (detector: {})",
            self.width,
            self.height,
            self.detector.as_ref().map_or("off", |d| d.name())
        );

        while !self.shutdown.is_cancelled() {
            let frame = match self.device.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Capture device reached end of stream");
                    return LoopExit::EndOfStream;
                }
                Err(err) => {
                    error!("{}", PipelineError::FrameAcquisition(err));
                    return LoopExit::AcquisitionFailed;
                }
            };

            let device_sequence = frame.meta.sequence;
            let captured_at = frame.timestamp;
            match self.process(frame) {
                Ok((jpeg, detections)) => {
                    let count = detections.len();
                    let sequence = self.cell.publish_captured(jpeg, detections, captured_at);
                    let latency = captured_at.elapsed();
                    metrics::counter!(metric::FRAMES_PUBLISHED).increment(1);
                    metrics::histogram!(metric::CAPTURE_LATENCY).record(latency.as_secs_f64());
                    trace!(sequence, device_sequence, detections = count, ?latency, "Published frame");
                }
                Err(err) => {
                    self.status.skipped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(metric::ITERATIONS_SKIPPED, "reason" => err.kind())
                        .increment(1);
                    warn!(device_sequence, "Skipping frame: {err}");
                }
            }
        }

        debug!("Shutdown requested");
        LoopExit::Shutdown
    }

    fn process(&mut self, frame: Frame) -> Result<(Bytes, Vec<Detection>), PipelineError> {
        let Some(detector) = self.detector.as_mut() else {
            // Nothing to draw: pre-encoded frames go out untouched
            if frame.is_encoded() {
                return Ok((frame.data, Vec::new()));
            }
            let image = decode_frame(&frame)?;
            return Ok((encode_jpeg(&image, self.jpeg_quality)?, Vec::new()));
        };

        let image = decode_frame(&frame)?;
        let detections = detector.infer(&image)?;
        let annotated = annotate(image, &detections);
        let jpeg = encode_jpeg(&annotated, self.jpeg_quality)?;
        Ok((jpeg, detections))
    }
}

fn pin_current_thread(core: usize) {
    let target = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|id| id.id == core);
    match target {
        Some(id) if core_affinity::set_for_current(id) => info!("Capture thread pinned to core {core}"),
        _ => warn!("Could not pin capture thread to core {core}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CaptureError, DetectError};
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    type Script = VecDeque<Result<Option<Frame>, CaptureError>>;

    struct ScriptedDevice {
        fail_open: bool,
        script: Script,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedDevice {
        fn new(script: Script) -> Self {
            Self {
                fail_open: false,
                script,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl CaptureDevice for ScriptedDevice {
        fn name(&self) -> &str {
            "scripted"
        }

        fn open(&mut self, _width: u32, _height: u32) -> Result<(), CaptureError> {
            if self.fail_open {
                return Err(CaptureError::Unavailable("no camera".into()));
            }
            Ok(())
        }

        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            self.script.pop_front().unwrap_or(Ok(None))
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Returns the fixture detection, failing on the listed call numbers
    struct FixtureDetector {
        calls: usize,
        fail_on: Vec<usize>,
    }

    impl Detector for FixtureDetector {
        fn name(&self) -> &'static str {
            "fixture"
        }

        fn infer(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, DetectError> {
            self.calls += 1;
            if self.fail_on.contains(&self.calls) {
                return Err(DetectError::Backend("model crashed".into()));
            }
            Ok(vec![fixture()])
        }
    }

    fn fixture() -> Detection {
        Detection::new([0.0, 0.0, 1.0, 1.0], 0.75, 7, "widget")
    }

    fn rgb_frame(sequence: u64) -> Result<Option<Frame>, CaptureError> {
        Ok(Some(Frame::from_rgb(
            RgbImage::from_pixel(2, 2, Rgb([50, 100, 150])),
            sequence,
        )))
    }

    fn capture_loop(device: ScriptedDevice, cell: &Arc<FrameCell>) -> CaptureLoop {
        CaptureLoop::new(device, cell.clone(), &CaptureConfig::default())
    }

    #[test]
    fn device_open_failure_publishes_nothing() {
        let cell = Arc::new(FrameCell::new());
        let mut device = ScriptedDevice::new(Script::from([rgb_frame(1)]));
        device.fail_open = true;
        let capture = capture_loop(device, &cell);
        let status = capture.status();

        assert_eq!(capture.run(), LoopExit::DeviceOpenFailed);
        assert!(cell.snapshot().is_none());
        assert_eq!(status.state(), CaptureState::Failed);
    }

    #[test]
    fn acquisition_failure_is_terminal() {
        let cell = Arc::new(FrameCell::new());
        let device = ScriptedDevice::new(Script::from([
            rgb_frame(1),
            Err(CaptureError::Io(std::io::Error::other("unplugged"))),
            rgb_frame(3),
        ]));
        let closed = device.closed.clone();

        assert_eq!(capture_loop(device, &cell).run(), LoopExit::AcquisitionFailed);
        assert_eq!(cell.published_count(), 1);
        assert!(closed.load(Ordering::SeqCst), "device was not released");
    }

    #[test]
    fn end_of_stream_stops_cleanly() {
        let cell = Arc::new(FrameCell::new());
        let device = ScriptedDevice::new(Script::from([rgb_frame(1), rgb_frame(2)]));
        let capture = capture_loop(device, &cell);
        let status = capture.status();

        assert_eq!(capture.run(), LoopExit::EndOfStream);
        assert_eq!(cell.published_count(), 2);
        assert_eq!(status.state(), CaptureState::Stopped);
    }

    #[test]
    fn detections_are_published_with_their_frame() {
        let cell = Arc::new(FrameCell::new());
        let device = ScriptedDevice::new(Script::from([rgb_frame(1)]));
        let detector = FixtureDetector { calls: 0, fail_on: vec![] };

        capture_loop(device, &cell)
            .with_detector(Some(Box::new(detector)))
            .run();

        let packet = cell.snapshot().unwrap();
        assert_eq!(packet.detections, vec![fixture()]);
        assert_eq!(&packet.jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn packet_carries_frame_capture_time() {
        let cell = Arc::new(FrameCell::new());
        let mut frame = Frame::from_rgb(RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])), 1);
        frame.timestamp -= std::time::Duration::from_millis(25);
        let captured_at = frame.timestamp;
        let device = ScriptedDevice::new(Script::from([Ok(Some(frame))]));

        capture_loop(device, &cell).run();
        let packet = cell.snapshot().unwrap();
        assert_eq!(packet.captured_at, captured_at);
        assert!(packet.latency() >= std::time::Duration::from_millis(25));
    }

    #[test]
    fn inference_failure_skips_only_that_iteration() {
        let cell = Arc::new(FrameCell::new());
        let device =
            ScriptedDevice::new(Script::from([rgb_frame(1), rgb_frame(2), rgb_frame(3)]));
        let detector = FixtureDetector { calls: 0, fail_on: vec![2] };
        let capture = capture_loop(device, &cell).with_detector(Some(Box::new(detector)));
        let status = capture.status();

        assert_eq!(capture.run(), LoopExit::EndOfStream);
        assert_eq!(cell.published_count(), 2);
        assert_eq!(status.skipped(), 1);
    }

    #[test]
    fn undecodable_frame_is_skipped() {
        let cell = Arc::new(FrameCell::new());
        let corrupt = Frame::from_jpeg(Bytes::from_static(b"garbage"), 2, 2, 1);
        let device = ScriptedDevice::new(Script::from([Ok(Some(corrupt)), rgb_frame(2)]));
        let detector = FixtureDetector { calls: 0, fail_on: vec![] };
        let capture = capture_loop(device, &cell).with_detector(Some(Box::new(detector)));
        let status = capture.status();

        assert_eq!(capture.run(), LoopExit::EndOfStream);
        assert_eq!(cell.published_count(), 1);
        assert_eq!(status.skipped(), 1);
    }

    #[test]
    fn encoded_frames_pass_through_without_detector() {
        let cell = Arc::new(FrameCell::new());
        let jpeg = Bytes::from_static(b"\xFF\xD8device-jpeg\xFF\xD9");
        let device = ScriptedDevice::new(Script::from([Ok(Some(Frame::from_jpeg(
            jpeg.clone(),
            2,
            2,
            1,
        )))]));

        capture_loop(device, &cell).run();
        let packet = cell.snapshot().unwrap();
        assert_eq!(packet.jpeg, jpeg);
        assert!(packet.detections.is_empty());
    }

    #[test]
    fn cancelled_token_stops_before_reading() {
        let cell = Arc::new(FrameCell::new());
        let device = ScriptedDevice::new(Script::from([rgb_frame(1)]));
        let closed = device.closed.clone();
        let token = CancellationToken::new();
        token.cancel();

        let exit = capture_loop(device, &cell).with_shutdown(token).run();
        assert_eq!(exit, LoopExit::Shutdown);
        assert!(cell.snapshot().is_none());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn spawned_loop_runs_on_its_own_thread() {
        let cell = Arc::new(FrameCell::new());
        let device = ScriptedDevice::new(Script::from([rgb_frame(1)]));
        let handle = capture_loop(device, &cell).spawn().unwrap();

        assert_eq!(handle.join().unwrap(), LoopExit::EndOfStream);
        assert_eq!(cell.published_count(), 1);
    }
}
