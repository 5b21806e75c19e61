use anyhow::{Context, Result};
use rollcall_core::{
    AttendanceEngine, AttendanceLedger, CosineMatcher, EmbeddingStore, FaceAnalyzer,
    ScannerController,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod dbus_interface;
mod store;

const BUS_NAME: &str = "io.rollcall.Attendance1";
const OBJECT_PATH: &str = "/io/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = config::Config::load()?;

    let store = Arc::new(
        store::SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    let gallery = Arc::new(EmbeddingStore::open(config.embedding_dim, store.clone())?);
    let ledger = AttendanceLedger::new(store, config.attendance_window()?);

    let analyzer = FaceAnalyzer::load(&config.model_dir, config.analyzer_config())
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    tracing::info!(model_dir = %config.model_dir.display(), "face models loaded");

    let engine = Arc::new(AttendanceEngine::new(
        analyzer,
        gallery,
        Box::new(CosineMatcher::new(config.match_policy())),
        ledger,
    )?);

    let cameras = Arc::new(capture::V4l2Cameras {
        width: config.frame_width,
        height: config.frame_height,
        warmup_frames: config.warmup_frames,
    });
    let controller = Arc::new(ScannerController::new(
        engine,
        cameras,
        config.scanner_config(),
    ));

    let service =
        dbus_interface::AttendanceService::new(Arc::clone(&controller), config.default_camera.clone());
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME}"))?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        name = BUS_NAME,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    // Scanner stops wait on worker threads.
    tokio::task::spawn_blocking(move || controller.stop_all()).await?;

    Ok(())
}
