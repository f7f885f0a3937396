use anyhow::Result;
use rollcall_core::{DetectorOptions, FaceAnalyzer, FaceDetector, RecognitionBackend, ScrfdDetector};
use rollcall_ledger::{AttendanceLedger, MemoryLedger, SqliteLedger};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod tracker;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::{SessionDeps, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        camera = %config.camera_device,
        models = %config.model_dir.display(),
        "rollcalld starting"
    );

    // Missing models degrade the pipeline instead of stopping the daemon.
    let options = DetectorOptions {
        min_face_size: config.min_face_size as f32,
        ..DetectorOptions::default()
    };
    let detector: Option<Box<dyn FaceDetector>> =
        match ScrfdDetector::load(&config.scrfd_model_path(), options) {
            Ok(detector) => {
                tracing::info!(path = %config.scrfd_model_path().display(), "SCRFD detector loaded");
                Some(Box::new(detector))
            }
            Err(e) => {
                tracing::warn!(error = %e, "face detector unavailable; frames will show no faces");
                None
            }
        };

    let backend = match RecognitionBackend::load(&config.model_dir) {
        Ok(backend) => Some(backend),
        Err(e) => {
            tracing::warn!(error = %e, "recognition disabled; faces will not be marked");
            None
        }
    };

    let ledger: Arc<dyn AttendanceLedger> = match &config.db_path {
        Some(path) => Arc::new(SqliteLedger::open(path)?),
        None => {
            tracing::warn!("no database path configured; marks are kept in memory only");
            Arc::new(MemoryLedger::new())
        }
    };

    let deps = SessionDeps {
        analyzer: Arc::new(Mutex::new(FaceAnalyzer::new(detector, backend))),
        policy: config.policy,
        ledger,
        clock: Arc::new(SystemClock),
    };

    let session_bus = config.session_bus;
    let service = AttendanceService::new(config, deps);
    let registry = service.registry();

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    // Close every camera before exiting.
    tokio::task::spawn_blocking(move || registry.stop_all()).await?;

    Ok(())
}
