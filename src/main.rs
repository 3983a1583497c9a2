//! QC edge service: camera streaming and on-demand inspection

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::WrapErr, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use qc_edge::capture::{CaptureSettings, DeviceLink, FrameSource, SimulatedLink, V4l2Link};
use qc_edge::control::ControlSurface;
use qc_edge::detect::{DetectionService, InferSettings};
use qc_edge::pipeline::stream::StreamSettings;
use qc_edge::pipeline::{FrameCache, StreamMultiplexer};
use qc_edge::server::{self, AppState};
use qc_edge::{CameraAdapter, CameraConfig, Config};

const DEFAULT_CONFIG_PATH: &str = "config/infer.json";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qc_edge=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("QC edge launching...");

    let config = load_config()?;

    let control = Arc::new(ControlSurface::new());
    let cache = Arc::new(FrameCache::new());
    let source = Arc::new(FrameSource::new(
        device_link(&config.camera),
        CaptureSettings::from(&config.camera),
        Arc::clone(&control),
        Arc::clone(&cache),
    ));

    // Startup failure leaves the camera stopped; the service still serves.
    if let Err(err) = source.start() {
        warn!("Camera not running: {}", err);
    }

    let mux = StreamMultiplexer::new(Arc::clone(&cache), StreamSettings::from(&config.stream));
    // No model backend is compiled in; /infer reports the model as not loaded.
    let detection = DetectionService::new(None, InferSettings::from(&config));

    let app = server::router(
        AppState {
            source: Arc::clone(&source),
            mux: mux.clone(),
            detection,
        },
        &config.server.allowed_origins,
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .wrap_err_with(|| format!("Failed to bind to {}", config.server.bind))?;

    let shutdown = async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", err);
        }
        info!("Shutdown requested");
        mux.close();
    };
    server::start(listener, app, shutdown).await?;

    // The capture loop can be parked in a read for one timeout.
    tokio::task::spawn_blocking(move || source.stop())
        .await
        .wrap_err("Failed to stop camera")?;

    info!("QC edge shutting down");
    Ok(())
}

fn load_config() -> Result<Config> {
    let explicit = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("QC_EDGE_CONFIG").ok())
        .map(PathBuf::from);

    match explicit {
        Some(path) => {
            info!("Loading config from {}", path.display());
            Config::load(&path).wrap_err("Failed to load configuration")
        }
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                info!("Loading config from {}", path.display());
                Config::load(&path).wrap_err("Failed to load configuration")
            } else {
                warn!("{} not found, using defaults", DEFAULT_CONFIG_PATH);
                Config::from_env().wrap_err("Failed to load configuration")
            }
        }
    }
}

fn device_link(camera: &CameraConfig) -> Box<dyn DeviceLink> {
    match camera.adapter {
        CameraAdapter::V4l2 => Box::new(V4l2Link::new(camera.into())),
        CameraAdapter::Simulated => Box::new(
            SimulatedLink::new(camera.width, camera.height)
                .with_format(camera.format)
                .with_frame_interval(Duration::from_millis(camera.sim_frame_interval_ms)),
        ),
    }
}
