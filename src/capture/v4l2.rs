//! V4L2 capture with memory-mapped buffers

use std::path::Path;
use std::time::Instant;

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{CaptureDevice, Frame, FrameMetadata, PixelFormat};
use crate::error::CaptureError;
use crate::CaptureConfig;

/// Path value that asks `open` to probe for the first usable device
pub const AUTO_DEVICE: &str = "auto";

/// V4L2 camera. The device node is opened lazily by `open`.
pub struct V4l2Capture {
    config: CaptureConfig,
    device: Option<Box<Device>>,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    sequence: u64,
}

impl V4l2Capture {
    pub fn new(config: CaptureConfig) -> Self {
        let format = config.format;
        Self {
            config,
            device: None,
            stream: None,
            width: 0,
            height: 0,
            stride: 0,
            format,
            sequence: 0,
        }
    }

    fn fourcc(format: PixelFormat) -> FourCC {
        match format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
            PixelFormat::Nv12 => FourCC::new(b"NV12"),
        }
    }

    fn from_fourcc(fourcc: FourCC) -> Option<PixelFormat> {
        match &fourcc.repr {
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv4),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"NV12" => Some(PixelFormat::Nv12),
            _ => None,
        }
    }
}

impl CaptureDevice for V4l2Capture {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn open(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
        let (path, requested) = if self.config.device == AUTO_DEVICE {
            auto_detect_device()?
        } else {
            (self.config.device.clone(), self.config.format)
        };
        info!("Opening V4L2 device {} at {}x{}", path, width, height);

        let device = Device::with_path(&path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::NotCapture(path));
        }

        let mut fmt = device.format()?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = Self::fourcc(requested);
        // Drivers may adjust size and format, so keep what was negotiated
        let fmt = device.set_format(&fmt)?;
        let format = Self::from_fourcc(fmt.fourcc)
            .ok_or_else(|| CaptureError::Unavailable(format!("driver chose {}", fmt.fourcc)))?;
        if (fmt.width, fmt.height) != (width, height) {
            warn!(
                "Driver adjusted resolution to {}x{} (requested {}x{})",
                fmt.width, fmt.height, width, height
            );
        }

        let stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, self.config.buffer_count)?;
        info!(
            "Capture stream started with {} buffers ({:?})",
            self.config.buffer_count, format
        );

        self.width = fmt.width;
        self.height = fmt.height;
        self.stride = fmt.stride;
        self.format = format;
        self.device = Some(Box::new(device));
        self.stream = Some(stream);
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.config.device))]
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let stream = self.stream.as_mut().ok_or(CaptureError::NotOpen)?;

        let (buf, meta) = stream.next()?;
        let timestamp = Instant::now();
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;

        Ok(Some(Frame {
            data,
            meta: FrameMetadata {
                sequence: self.sequence,
                width: self.width,
                height: self.height,
                stride: self.stride,
                format: self.format,
            },
            timestamp,
        }))
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("Capture stream stopped");
        }
        self.device = None;
    }
}

/// Auto-detect best capture device, preferring MJPEG over YUYV
pub fn auto_detect_device() -> Result<(String, PixelFormat), CaptureError> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        for fmt in formats {
            if fmt.fourcc == FourCC::new(b"MJPG") {
                info!("Found MJPEG device: {} - {}", path, caps.card);
                return Ok((path, PixelFormat::Mjpeg));
            } else if fmt.fourcc == FourCC::new(b"YUYV") {
                info!("Found YUYV device: {} - {}", path, caps.card);
                return Ok((path, PixelFormat::Yuyv4));
            }
        }
    }

    Err(CaptureError::Unavailable(
        "no suitable capture device found".into(),
    ))
}
