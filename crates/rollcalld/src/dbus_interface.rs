use crate::config::Config;
use crate::engine::{
    lock, spawn_session, AnnotatedFrame, MarkResult, SessionDeps, SessionError, SessionHandle,
};
use image::RgbImage;
use rollcall_core::{FaceAnalyzer, RecognitionBackend};
use rollcall_hw::frame::encode_jpeg;
use rollcall_hw::{Camera, CameraError};
use rollcall_ledger::{attendance_stats, ContextId, LedgerError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

const SNAPSHOT_QUALITY: u8 = 85;

struct ActiveSession {
    handle: SessionHandle,
    latest: Arc<Mutex<Option<RgbImage>>>,
}

/// Running sessions by id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, ActiveSession>>>,
}

impl SessionRegistry {
    fn insert(&self, session: ActiveSession) {
        lock(&self.inner).insert(session.handle.id().to_string(), session);
    }

    fn remove(&self, id: &str) -> Option<ActiveSession> {
        lock(&self.inner).remove(id)
    }

    /// Drop sessions whose thread has already ended (camera lost, viewer gone).
    fn reap(&self) {
        let finished: Vec<ActiveSession> = {
            let mut sessions = lock(&self.inner);
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in finished {
            let id = session.handle.id().to_string();
            if let Some(report) = session.handle.stop() {
                tracing::info!(session = %id, reason = ?report.reason, "session reaped");
            }
        }
    }

    fn latest_frame(&self, id: &str) -> Option<Option<RgbImage>> {
        lock(&self.inner)
            .get(id)
            .map(|s| lock(&s.latest).clone())
    }

    fn summaries(&self) -> Vec<serde_json::Value> {
        lock(&self.inner)
            .values()
            .map(|s| {
                serde_json::json!({
                    "id": s.handle.id(),
                    "context_id": s.handle.context_id(),
                    "state": s.handle.state(),
                })
            })
            .collect()
    }

    /// Stop every session and wait for the cameras to close.
    pub fn stop_all(&self) {
        let sessions: Vec<ActiveSession> = lock(&self.inner).drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.handle.stop();
        }
    }
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    config: Config,
    deps: SessionDeps,
    sessions: SessionRegistry,
}

impl AttendanceService {
    pub fn new(config: Config, deps: SessionDeps) -> Self {
        Self {
            config,
            deps,
            sessions: SessionRegistry::default(),
        }
    }

    pub fn registry(&self) -> SessionRegistry {
        self.sessions.clone()
    }

    /// Run blocking ledger work off the async executor.
    async fn with_ledger<T, F>(&self, f: F) -> fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn rollcall_ledger::AttendanceLedger) -> Result<T, LedgerError> + Send + 'static,
    {
        let ledger = Arc::clone(&self.deps.ledger);
        tokio::task::spawn_blocking(move || f(ledger.as_ref()))
            .await
            .map_err(|e| fdo::Error::Failed(format!("ledger task failed: {e}")))?
            .map_err(|e| {
                tracing::error!(error = %e, "ledger operation failed");
                fdo::Error::IOError(e.to_string())
            })
    }

    /// Run work that needs the analyzer off the async executor. Sessions hold
    /// the analyzer lock for a whole inference.
    async fn with_analyzer<T, F>(&self, f: F) -> fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FaceAnalyzer) -> T + Send + 'static,
    {
        let analyzer = Arc::clone(&self.deps.analyzer);
        tokio::task::spawn_blocking(move || f(&mut lock(&analyzer)))
            .await
            .map_err(|e| fdo::Error::Failed(format!("analyzer task failed: {e}")))
    }

    async fn roster(&self) -> fdo::Result<Vec<String>> {
        self.with_analyzer(|analyzer| {
            analyzer
                .enrollment()
                .map(|set| set.iter().map(|id| id.as_str().to_string()).collect())
                .unwrap_or_default()
        })
        .await
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Open the camera and start marking attendance for a context.
    async fn start_session(
        &self,
        context_id: i64,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<String> {
        self.sessions.reap();

        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(session = %session_id, context_id, "start_session requested");

        let ctx = crate::engine::SessionContext {
            session_id: session_id.clone(),
            context_id,
            mirror: self.config.mirror,
            warmup_frames: self.config.warmup_frames,
        };
        let (tx, rx) = mpsc::channel(self.config.frame_buffer);
        let deps = self.deps.clone();
        let device = self.config.camera_device.clone();

        let handle = tokio::task::spawn_blocking(move || {
            spawn_session(ctx, deps, move || Camera::open(&device), tx)
        })
        .await
        .map_err(|e| fdo::Error::Failed(format!("session start task failed: {e}")))?
        .map_err(session_error)?;

        let latest = Arc::new(Mutex::new(None));
        tokio::spawn(forward_frames(rx, Arc::clone(&latest), emitter.to_owned()));
        self.sessions.insert(ActiveSession { handle, latest });

        Ok(session_id)
    }

    /// Stop a session and release the camera. Returns false for unknown ids.
    async fn stop_session(&self, session_id: &str) -> fdo::Result<bool> {
        let Some(session) = self.sessions.remove(session_id) else {
            return Ok(false);
        };
        let report = tokio::task::spawn_blocking(move || session.handle.stop())
            .await
            .map_err(|e| fdo::Error::Failed(format!("session stop task failed: {e}")))?;
        if let Some(report) = report {
            tracing::info!(
                session = session_id,
                frames = report.frames,
                created = report.marks_created,
                "session stopped"
            );
        }
        Ok(true)
    }

    /// Attendance percentages for a context as JSON.
    async fn stats(&self, context_id: i64) -> fdo::Result<String> {
        let roster = self.roster().await?;
        let stats = self
            .with_ledger(move |ledger| attendance_stats(ledger, context_id, roster))
            .await?;
        to_json(&stats)
    }

    /// Marks for a context as a JSON array, newest first.
    async fn records(&self, context_id: i64) -> fdo::Result<String> {
        let marks = self
            .with_ledger(move |ledger| ledger.records_for(context_id))
            .await?;
        to_json(&marks)
    }

    /// Contexts with at least one mark as a JSON array.
    async fn contexts(&self) -> fdo::Result<String> {
        let ids: Vec<ContextId> = self.with_ledger(|ledger| ledger.contexts()).await?;
        to_json(&ids)
    }

    /// Delete one mark (administrative correction).
    async fn remove_mark(&self, context_id: i64, identity: &str, day: &str) -> fdo::Result<bool> {
        let day = parse_day(day)?;
        let identity = identity.to_string();
        tracing::info!(context_id, identity = %identity, %day, "remove_mark requested");
        self.with_ledger(move |ledger| ledger.remove(context_id, &identity, day))
            .await
    }

    /// Latest annotated frame of a session as JPEG; empty before the first frame.
    async fn snapshot(&self, session_id: &str) -> fdo::Result<Vec<u8>> {
        let frame = self
            .sessions
            .latest_frame(session_id)
            .ok_or_else(|| fdo::Error::InvalidArgs(format!("no session {session_id}")))?;
        let Some(image) = frame else {
            return Ok(Vec::new());
        };
        tokio::task::spawn_blocking(move || encode_jpeg(&image, SNAPSHOT_QUALITY))
            .await
            .map_err(|e| fdo::Error::Failed(format!("encode task failed: {e}")))?
            .map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        self.sessions.reap();
        let (detector, backend, enrolled) = self
            .with_analyzer(|analyzer| {
                (
                    analyzer.has_detector(),
                    analyzer.backend_kind().map(|k| k.to_string()),
                    analyzer.enrollment().map_or(0, |e| e.len()),
                )
            })
            .await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.config.camera_device,
            "detector_loaded": detector,
            "backend": backend,
            "enrolled": enrolled,
            "database": self
                .config
                .db_path
                .as_ref()
                .map_or_else(|| "memory".to_string(), |p| p.display().to_string()),
            "sessions": self.sessions.summaries(),
        })
        .to_string())
    }

    /// Reload the trained artifacts and swap the backend in one step.
    ///
    /// On failure recognition is disabled until the next successful reload.
    async fn reload_models(&self) -> fdo::Result<String> {
        let model_dir = self.config.model_dir.clone();
        let loaded = tokio::task::spawn_blocking(move || RecognitionBackend::load(&model_dir))
            .await
            .map_err(|e| fdo::Error::Failed(format!("reload task failed: {e}")))?
            .map_err(|e| e.to_string());

        match loaded {
            Ok(backend) => {
                let summary = serde_json::json!({
                    "backend": backend.kind().to_string(),
                    "enrolled": backend.enrollment().len(),
                })
                .to_string();
                self.with_analyzer(move |analyzer| drop(analyzer.replace_backend(Some(backend))))
                    .await?;
                Ok(summary)
            }
            Err(reason) => {
                tracing::warn!(error = %reason, "reload failed; recognition disabled");
                self.with_analyzer(|analyzer| drop(analyzer.replace_backend(None)))
                    .await?;
                Err(fdo::Error::Failed(format!("reload failed: {reason}")))
            }
        }
    }

    /// Emitted once for every newly created mark.
    #[zbus(signal)]
    async fn attendance_marked(
        emitter: &SignalEmitter<'_>,
        context_id: i64,
        identity: &str,
        day: &str,
        time: &str,
    ) -> zbus::Result<()>;
}

/// Viewer side of a session: keeps the latest frame and announces new marks.
async fn forward_frames(
    mut rx: mpsc::Receiver<AnnotatedFrame>,
    latest: Arc<Mutex<Option<RgbImage>>>,
    emitter: SignalEmitter<'static>,
) {
    while let Some(frame) = rx.recv().await {
        tracing::debug!(
            session = %frame.session_id,
            sequence = frame.sequence,
            faces = frame.faces.len(),
            "frame delivered"
        );
        for mark in frame
            .marks
            .iter()
            .filter(|m| m.result == MarkResult::Created)
        {
            let day = mark.day.to_string();
            let time = mark.time.to_string();
            if let Err(e) = AttendanceService::attendance_marked(
                &emitter,
                frame.context_id,
                &mark.identity,
                &day,
                &time,
            )
            .await
            {
                tracing::warn!(error = %e, "failed to emit AttendanceMarked");
            }
        }
        *lock(&latest) = Some(frame.image);
    }
}

fn session_error(e: SessionError) -> fdo::Error {
    tracing::error!(error = %e, "session failed to start");
    match e {
        SessionError::Camera(CameraError::DeviceNotFound(dev)) => {
            fdo::Error::FileNotFound(format!("camera not found: {dev}"))
        }
        SessionError::Camera(CameraError::DeviceBusy(dev)) => {
            fdo::Error::LimitsExceeded(format!("camera busy: {dev}"))
        }
        SessionError::Camera(CameraError::Open { path, source })
            if source.kind() == std::io::ErrorKind::PermissionDenied =>
        {
            fdo::Error::AccessDenied(format!("camera {path}: {source}"))
        }
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn parse_day(day: &str) -> fdo::Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| fdo::Error::InvalidArgs(format!("day '{day}': {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}
