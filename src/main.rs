//! framecast: capture, detect, annotate, and serve the result as MJPEG

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use framecast::pipeline::{CaptureLoop, FrameCell, LoopExit};
use framecast::server::{self, AppState};
use framecast::{capture, detect, telemetry, CaptureSource, Config};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Source {
    TestPattern,
    V4l2,
}

impl From<Source> for CaptureSource {
    fn from(source: Source) -> Self {
        match source {
            Source::TestPattern => CaptureSource::TestPattern,
            Source::V4l2 => CaptureSource::V4l2,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "FRAMECAST_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<IpAddr>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Frame source
    #[arg(long, value_enum)]
    source: Option<Source>,

    /// Capture device path, or "auto"
    #[arg(long)]
    device: Option<String>,

    /// Stream frames without running detection
    #[arg(long)]
    no_detect: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(source) = self.source {
            config.capture.source = source.into();
        }
        if let Some(device) = &self.device {
            config.capture.device = device.clone();
        }
        if self.no_detect {
            config.detection.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).wrap_err("loading configuration")?;
    args.apply(&mut config);
    config.validate()?;

    telemetry::init(&config.log.filter).map_err(|e| eyre!("installing subscriber: {e}"))?;
    info!("framecast launching...");
    info!(
        source = ?config.capture.source,
        width = config.capture.width,
        height = config.capture.height,
        detection = config.detection.enabled,
        "Capture configured"
    );

    let shutdown = CancellationToken::new();
    let cell = Arc::new(FrameCell::new());

    let device = capture::from_config(&config.capture)?;
    let capture = CaptureLoop::new(device, cell.clone(), &config.capture)
        .with_detector(detect::from_config(&config.detection))
        .with_jpeg_quality(config.stream.jpeg_quality)
        .with_shutdown(shutdown.clone());
    let status = capture.status();
    let capture_handle = capture.spawn().wrap_err("spawning capture thread")?;

    let addr = config.server.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
        }
        signal_token.cancel();
    });

    let state = AppState::new(cell, status, &config, shutdown.clone());
    let served = server::serve(listener, state).await;
    shutdown.cancel();

    let exit = tokio::task::spawn_blocking(move || capture_handle.join())
        .await?
        .map_err(|_| eyre!("capture thread panicked"))?;
    match exit {
        LoopExit::Shutdown | LoopExit::EndOfStream => info!(?exit, "Capture finished"),
        LoopExit::DeviceOpenFailed | LoopExit::AcquisitionFailed => {
            warn!(?exit, "Capture ended with a device failure")
        }
    }

    served.wrap_err("HTTP server")?;
    info!("framecast shutting down");
    Ok(())
}
