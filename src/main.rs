//! Aperture capture daemon

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aperture::capture::{CameraManager, DeviceSession};
use aperture::{sink, utils, Backend, CaptureError, Config, SinkKind};
use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments; anything not given here comes from the
/// configuration file and `APERTURE__*` environment variables.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "APERTURE_CONFIG")]
    config: Option<PathBuf>,

    /// Use this backend for every configured camera
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Frame sink
    #[arg(long, value_enum)]
    sink: Option<SinkKind>,

    /// Stop after this many seconds (0 runs until Ctrl-C)
    #[arg(short = 't', long)]
    duration: Option<u64>,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aperture=info"));

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
}

/// Open, configure and start one session per configured camera.
fn start_sessions(
    config: &Config,
    v4l2: &dyn CameraManager,
    virtual_cameras: &dyn CameraManager,
) -> std::result::Result<Vec<DeviceSession>, CaptureError> {
    let mut sessions = Vec::with_capacity(config.cameras.len());

    for (index, camera) in config.cameras.iter().enumerate() {
        let (manager, id) = match camera.backend {
            Backend::Virtual => (virtual_cameras, camera.device_id(index)),
            Backend::V4l2 => (
                v4l2,
                camera.device_id(index).or_else(utils::auto_detect_device),
            ),
        };
        let id = id.ok_or_else(|| {
            CaptureError::NotFound(format!("no capture device found for camera {}", index))
        })?;

        let sink = sink::from_config(&config.sink, index)?;
        let mut session = DeviceSession::open(manager, &id, index, sink)?;
        session.configure(camera.role, &camera.stream_request())?;
        session.set_controls(camera.controls)?;
        session.start()?;
        sessions.push(session);
    }

    Ok(sessions)
}

fn log_stats(sessions: &[DeviceSession]) {
    for session in sessions {
        let stats = session.stats();
        info!(
            device = session.index(),
            "{}: {} delivered, {} dropped ({} map / {} sink failures), {} sequence gaps",
            session.device_id(),
            stats.frames_delivered,
            stats.frames_dropped,
            stats.map_failures,
            stats.sink_failures,
            stats.sequence_gaps
        );
        if stats.mappings_open > 0 {
            warn!(device = session.index(), "{} mappings still open", stats.mappings_open);
        }
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("Aperture launching...");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).wrap_err("invalid configuration")?;
    if let Some(backend) = args.backend {
        for camera in &mut config.cameras {
            camera.backend = backend;
        }
    }
    if let Some(kind) = args.sink {
        config.sink.kind = kind;
    }
    if let Some(duration) = args.duration {
        config.pipeline.run_for_secs = duration;
    }
    aperture::CONFIG.store(Arc::new(config.clone()));

    let v4l2 = aperture::camera_manager(Backend::V4l2, &config.cameras);
    let virtual_cameras = aperture::camera_manager(Backend::Virtual, &config.cameras);

    let mut sessions = match start_sessions(&config, v4l2.as_ref(), virtual_cameras.as_ref()) {
        Ok(sessions) => sessions,
        Err(e) => {
            let stage = e.stage();
            error!("Camera setup failed during {}: {}", stage, e);
            return Err(e).wrap_err(format!("camera setup failed at {} stage", stage));
        }
    };

    let deadline = (config.pipeline.run_for_secs > 0)
        .then(|| Instant::now() + Duration::from_secs(config.pipeline.run_for_secs));
    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.pipeline.stats_interval_secs.max(1)));
    ticker.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    let timeout = wait_for_deadline(deadline);
    tokio::pin!(ctrl_c, timeout);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                }
                info!("Interrupted");
                break;
            }
            _ = &mut timeout => {
                info!("Run time of {}s elapsed", config.pipeline.run_for_secs);
                break;
            }
            _ = ticker.tick() => log_stats(&sessions),
        }
    }

    for session in &mut sessions {
        session.stop();
    }
    log_stats(&sessions);

    info!("Aperture shutting down");
    Ok(())
}
