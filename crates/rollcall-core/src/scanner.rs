//! Live scanner sessions.
//!
//! Each camera gets one [`ScannerSession`]. A running session owns a named
//! OS thread that opens the camera, then loops capture → engine → publish
//! until told to stop. The camera never leaves that thread and is dropped
//! on every exit path. Readers get the latest [`ScanSnapshot`] from a
//! `watch` channel and never wait on the loop.

use crate::engine::{AttendanceEngine, FaceOutcome};
use crate::types::MatchResult;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScannerError {
    #[error("scanner is already starting or stopping")]
    AlreadyRunning,
    #[error("scanner is in error state ({0}); stop it before restarting")]
    Faulted(String),
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("invalid camera id: {0:?}")]
    InvalidCamera(String),
}

/// Camera capture failure reported by a [`FrameSource`] or [`CameraProvider`].
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct CaptureError(pub String);

/// An open camera. Dropping it releases the device.
pub trait FrameSource {
    fn capture(&mut self) -> Result<RgbImage, CaptureError>;
}

/// Opens cameras by id.
pub trait CameraProvider: Send + Sync {
    fn open(&self, camera_id: &str) -> Result<Box<dyn FrameSource>, CaptureError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScannerConfig {
    /// Pause between the end of one cycle and the next capture.
    pub frame_interval: Duration,
    pub acquire_timeout: Duration,
    pub release_timeout: Duration,
    /// Consecutive capture failures treated as a lost device.
    pub max_capture_failures: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(200),
            acquire_timeout: Duration::from_secs(5),
            release_timeout: Duration::from_secs(5),
            max_capture_failures: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    Idle,
    Starting,
    Active,
    Stopping,
    Error,
}

/// Latest published scan cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanSnapshot {
    pub session_id: Option<Uuid>,
    /// Increases by one per published cycle within a session.
    pub sequence: u64,
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub frame: Option<Arc<RgbImage>>,
    pub faces: Vec<FaceOutcome>,
    pub error: Option<String>,
}

impl ScanSnapshot {
    /// Match result of the best face, or `no_face` when none was seen.
    pub fn primary_result(&self) -> MatchResult {
        self.faces
            .iter()
            .find_map(|f| f.result.clone())
            .unwrap_or_else(MatchResult::no_face)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StartOutcome {
    pub session_id: Uuid,
    /// True when the session was already active and nothing was acquired.
    pub already_running: bool,
}

#[derive(Debug, Clone)]
pub struct ScannerStatus {
    pub camera_id: String,
    pub state: ScannerState,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub latest: Arc<ScanSnapshot>,
}

struct WorkerHandle {
    stop_tx: mpsc::Sender<()>,
    exited_rx: mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

struct Lifecycle {
    state: ScannerState,
    session_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    worker: Option<WorkerHandle>,
}

impl Lifecycle {
    fn is_current(&self, session_id: Uuid) -> bool {
        self.session_id == Some(session_id)
    }
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    snapshot: watch::Sender<Arc<ScanSnapshot>>,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, session_id: Uuid, message: String) {
        let mut life = self.lifecycle();
        if life.is_current(session_id) && life.state != ScannerState::Idle {
            life.state = ScannerState::Error;
            life.last_error = Some(message);
        }
    }
}

/// Scanner for one camera.
pub struct ScannerSession {
    camera_id: String,
    engine: Arc<AttendanceEngine>,
    cameras: Arc<dyn CameraProvider>,
    config: ScannerConfig,
    shared: Arc<Shared>,
}

impl ScannerSession {
    pub fn new(
        camera_id: &str,
        engine: Arc<AttendanceEngine>,
        cameras: Arc<dyn CameraProvider>,
        config: ScannerConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(ScanSnapshot::default()));
        Self {
            camera_id: camera_id.to_string(),
            engine,
            cameras,
            config,
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle {
                    state: ScannerState::Idle,
                    session_id: None,
                    started_at: None,
                    last_error: None,
                    worker: None,
                }),
                snapshot,
            }),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn state(&self) -> ScannerState {
        self.shared.lifecycle().state
    }

    /// Acquire the camera and begin scanning.
    ///
    /// Blocks until the camera is open or `acquire_timeout` elapses.
    pub fn start(&self) -> Result<StartOutcome, ScannerError> {
        let session_id = Uuid::new_v4();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);
        {
            let mut life = self.shared.lifecycle();
            match life.state {
                ScannerState::Active => {
                    if let Some(id) = life.session_id {
                        return Ok(StartOutcome {
                            session_id: id,
                            already_running: true,
                        });
                    }
                }
                ScannerState::Starting | ScannerState::Stopping => {
                    return Err(ScannerError::AlreadyRunning);
                }
                ScannerState::Error => {
                    let reason = life.last_error.clone().unwrap_or_default();
                    return Err(ScannerError::Faulted(reason));
                }
                ScannerState::Idle => {}
            }

            self.shared.snapshot.send_replace(Arc::new(ScanSnapshot {
                session_id: Some(session_id),
                ..ScanSnapshot::default()
            }));

            let (stop_tx, stop_rx) = mpsc::channel();
            let (exited_tx, exited_rx) = mpsc::channel();
            let worker = Worker {
                session_id,
                camera_id: self.camera_id.clone(),
                engine: Arc::clone(&self.engine),
                shared: Arc::clone(&self.shared),
                config: self.config,
            };
            let cameras = Arc::clone(&self.cameras);
            let spawned = thread::Builder::new()
                .name(format!("rollcall-scan-{}", self.camera_id))
                .spawn(move || worker.run(cameras.as_ref(), ready_tx, stop_rx, exited_tx));

            let thread = match spawned {
                Ok(t) => t,
                Err(e) => {
                    life.state = ScannerState::Error;
                    life.last_error = Some(format!("cannot spawn scanner thread: {e}"));
                    return Err(ScannerError::ResourceUnavailable(e.to_string()));
                }
            };

            life.state = ScannerState::Starting;
            life.session_id = Some(session_id);
            life.started_at = Some(Utc::now());
            life.last_error = None;
            life.worker = Some(WorkerHandle {
                stop_tx,
                exited_rx,
                thread,
            });
        }

        tracing::info!(camera_id = %self.camera_id, %session_id, "scanner starting");

        let failure = match ready_rx.recv_timeout(self.config.acquire_timeout) {
            Ok(Ok(())) => None,
            Ok(Err(message)) => Some(message),
            Err(RecvTimeoutError::Timeout) => Some(format!(
                "camera not acquired within {:?}",
                self.config.acquire_timeout
            )),
            Err(RecvTimeoutError::Disconnected) => Some("scanner thread exited during start".into()),
        };

        let mut life = self.shared.lifecycle();
        match life.state {
            ScannerState::Starting if life.is_current(session_id) => {}
            ScannerState::Error if life.is_current(session_id) => {
                let reason = life.last_error.clone().unwrap_or_default();
                return Err(ScannerError::ResourceUnavailable(reason));
            }
            // stop() ran while we were waiting for the camera.
            _ => {
                return Err(ScannerError::ResourceUnavailable(
                    "scanner stopped during start".into(),
                ))
            }
        }

        match failure {
            None => {
                life.state = ScannerState::Active;
                tracing::info!(camera_id = %self.camera_id, %session_id, "scanner active");
                Ok(StartOutcome {
                    session_id,
                    already_running: false,
                })
            }
            Some(message) => {
                // Dropping the handle closes the stop channel; a worker still
                // blocked in open() exits as soon as the open returns.
                drop(life.worker.take());
                life.state = ScannerState::Error;
                life.last_error = Some(message.clone());
                tracing::error!(camera_id = %self.camera_id, error = %message, "scanner failed to start");
                Err(ScannerError::ResourceUnavailable(message))
            }
        }
    }

    /// Stop scanning and release the camera. Stopping an idle scanner is a no-op.
    pub fn stop(&self) -> Result<(), ScannerError> {
        let (session_id, worker) = {
            let mut life = self.shared.lifecycle();
            match life.state {
                ScannerState::Idle | ScannerState::Stopping => return Ok(()),
                ScannerState::Starting | ScannerState::Active | ScannerState::Error => {}
            }
            life.state = ScannerState::Stopping;
            (life.session_id, life.worker.take())
        };

        if let Some(worker) = worker {
            // The worker may already be gone; a failed send is fine.
            let _ = worker.stop_tx.send(());
            match worker.exited_rx.recv_timeout(self.config.release_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.thread.join().is_err() {
                        tracing::warn!(camera_id = %self.camera_id, "scanner thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let message = format!(
                        "camera not released within {:?}",
                        self.config.release_timeout
                    );
                    if let Some(id) = session_id {
                        self.shared.fail(id, message.clone());
                    }
                    tracing::error!(camera_id = %self.camera_id, error = %message, "scanner stop timed out");
                    return Err(ScannerError::ResourceUnavailable(message));
                }
            }
        }

        let mut life = self.shared.lifecycle();
        if life.session_id == session_id {
            life.state = ScannerState::Idle;
            life.started_at = None;
            life.last_error = None;
        }
        tracing::info!(camera_id = %self.camera_id, "scanner stopped");
        Ok(())
    }

    /// Latest snapshot. Never blocks on the scan loop.
    pub fn snapshot(&self) -> Arc<ScanSnapshot> {
        Arc::clone(&*self.shared.snapshot.borrow())
    }

    /// Push-style access to snapshots as they are published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ScanSnapshot>> {
        self.shared.snapshot.subscribe()
    }

    pub fn status(&self) -> ScannerStatus {
        let life = self.shared.lifecycle();
        ScannerStatus {
            camera_id: self.camera_id.clone(),
            state: life.state,
            session_id: life.session_id,
            started_at: life.started_at,
            last_error: life.last_error.clone(),
            latest: self.snapshot(),
        }
    }
}

impl Drop for ScannerSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(camera_id = %self.camera_id, error = %e, "scanner not stopped cleanly");
        }
    }
}

/// State moved onto the scanner thread.
struct Worker {
    session_id: Uuid,
    camera_id: String,
    engine: Arc<AttendanceEngine>,
    shared: Arc<Shared>,
    config: ScannerConfig,
}

/// Signals thread exit after the camera is gone. An active session whose
/// thread dies (panic included) is moved to `Error`.
struct ExitGuard {
    session_id: Uuid,
    shared: Arc<Shared>,
    exited_tx: mpsc::Sender<()>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        {
            let mut life = self.shared.lifecycle();
            if life.is_current(self.session_id) && life.state == ScannerState::Active {
                let reason = if thread::panicking() {
                    "scanner thread panicked"
                } else {
                    "scanner thread exited"
                };
                life.state = ScannerState::Error;
                life.last_error = Some(reason.to_string());
            }
        }
        let _ = self.exited_tx.send(());
    }
}

impl Worker {
    fn run(
        self,
        cameras: &dyn CameraProvider,
        ready_tx: mpsc::SyncSender<Result<(), String>>,
        stop_rx: mpsc::Receiver<()>,
        exited_tx: mpsc::Sender<()>,
    ) {
        // Declared before the camera so it drops after it.
        let _exit = ExitGuard {
            session_id: self.session_id,
            shared: Arc::clone(&self.shared),
            exited_tx,
        };

        let mut camera = match cameras.open(&self.camera_id) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("cannot open camera {}: {e}", self.camera_id)));
                return;
            }
        };
        if ready_tx.send(Ok(())).is_err() {
            tracing::warn!(camera_id = %self.camera_id, "start abandoned; releasing camera");
            return;
        }

        let mut sequence = 0u64;
        let mut failures = 0u32;
        loop {
            if !self.cycle(camera.as_mut(), &mut sequence, &mut failures) {
                break;
            }
            match stop_rx.recv_timeout(self.config.frame_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!(camera_id = %self.camera_id, cycles = sequence, "scanner loop finished");
    }

    /// One capture → process → publish cycle. Returns false when the
    /// device is considered lost.
    fn cycle(&self, camera: &mut dyn FrameSource, sequence: &mut u64, failures: &mut u32) -> bool {
        let captured_at = Utc::now();
        *sequence += 1;

        let frame = match camera.capture() {
            Ok(f) => {
                *failures = 0;
                Arc::new(f)
            }
            Err(e) => {
                *failures += 1;
                tracing::warn!(
                    camera_id = %self.camera_id,
                    error = %e,
                    consecutive = *failures,
                    "frame capture failed"
                );
                self.publish(*sequence, captured_at, None, Vec::new(), Some(e.to_string()));

                if *failures >= self.config.max_capture_failures {
                    let message = format!("camera lost after {} failed captures: {e}", *failures);
                    tracing::error!(camera_id = %self.camera_id, error = %message, "scanner faulted");
                    self.shared.fail(self.session_id, message);
                    return false;
                }
                return true;
            }
        };

        match self.engine.process_frame(&self.camera_id, &frame, captured_at) {
            Ok(faces) => self.publish(*sequence, captured_at, Some(frame), faces, None),
            Err(e) => {
                tracing::warn!(camera_id = %self.camera_id, error = %e, "frame processing failed");
                self.publish(*sequence, captured_at, Some(frame), Vec::new(), Some(e.to_string()));
            }
        }
        true
    }

    fn publish(
        &self,
        sequence: u64,
        captured_at: DateTime<Utc>,
        frame: Option<Arc<RgbImage>>,
        faces: Vec<FaceOutcome>,
        error: Option<String>,
    ) {
        self.shared.snapshot.send_replace(Arc::new(ScanSnapshot {
            session_id: Some(self.session_id),
            sequence,
            captured_at: Some(captured_at),
            frame,
            faces,
            error,
        }));
    }
}

/// Registry of per-camera scanner sessions.
pub struct ScannerController {
    engine: Arc<AttendanceEngine>,
    cameras: Arc<dyn CameraProvider>,
    config: ScannerConfig,
    sessions: Mutex<HashMap<String, Arc<ScannerSession>>>,
}

impl ScannerController {
    pub fn new(
        engine: Arc<AttendanceEngine>,
        cameras: Arc<dyn CameraProvider>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            engine,
            cameras,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<AttendanceEngine> {
        &self.engine
    }

    /// Session for `camera_id`, created idle on first use.
    pub fn session(&self, camera_id: &str) -> Result<Arc<ScannerSession>, ScannerError> {
        let camera_id = camera_id.trim();
        if camera_id.is_empty() {
            return Err(ScannerError::InvalidCamera(camera_id.to_string()));
        }
        let mut sessions = self.sessions();
        let session = sessions.entry(camera_id.to_string()).or_insert_with(|| {
            Arc::new(ScannerSession::new(
                camera_id,
                Arc::clone(&self.engine),
                Arc::clone(&self.cameras),
                self.config,
            ))
        });
        Ok(Arc::clone(session))
    }

    pub fn start(&self, camera_id: &str) -> Result<StartOutcome, ScannerError> {
        self.session(camera_id)?.start()
    }

    pub fn stop(&self, camera_id: &str) -> Result<(), ScannerError> {
        match self.existing(camera_id) {
            Some(session) => session.stop(),
            None => Ok(()),
        }
    }

    /// Status of `camera_id`; cameras never started report `Idle`.
    pub fn status(&self, camera_id: &str) -> Result<ScannerStatus, ScannerError> {
        Ok(self.session(camera_id)?.status())
    }

    pub fn snapshot(&self, camera_id: &str) -> Option<Arc<ScanSnapshot>> {
        self.existing(camera_id).map(|s| s.snapshot())
    }

    pub fn active_count(&self) -> usize {
        self.sessions()
            .values()
            .filter(|s| s.state() == ScannerState::Active)
            .count()
    }

    /// Stop every session, logging failures.
    pub fn stop_all(&self) {
        let sessions: Vec<Arc<ScannerSession>> = self.sessions().values().cloned().collect();
        for session in sessions {
            if let Err(e) = session.stop() {
                tracing::warn!(camera_id = session.camera_id(), error = %e, "failed to stop scanner");
            }
        }
    }

    fn existing(&self, camera_id: &str) -> Option<Arc<ScannerSession>> {
        self.sessions().get(camera_id.trim()).cloned()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<ScannerSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
