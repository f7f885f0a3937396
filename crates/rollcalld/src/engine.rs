//! Streaming session engine.
//!
//! Each session runs on its own OS thread and owns its camera and dedup
//! tracker. Frames are handled strictly one at a time: capture, detect,
//! classify, resolve, mark, annotate, then a blocking send into a bounded
//! channel. The send is the only backpressure point.

use crate::tracker::SessionTracker;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use image::{Rgb, RgbImage};
use rollcall_core::{BoundingBox, ConfidencePolicy, FaceAnalyzer, RecognitionOutcome};
use rollcall_hw::frame::{draw_box, equalize_histogram, rgb_to_gray};
use rollcall_hw::{CameraError, FrameSource};
use rollcall_ledger::{AttendanceLedger, ContextId, RecordOutcome};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const BOX_THICKNESS: u32 = 2;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn session thread: {0}")]
    Spawn(std::io::Error),
    #[error("session thread exited during startup")]
    ThreadExited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Capturing,
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// The source reported end of stream.
    SourceEnded,
    /// A frame could not be read; nothing from it was processed.
    CaptureFailed(String),
    /// The viewer dropped its receiver.
    ConsumerDisconnected,
    /// Stopped by the owner.
    Cancelled,
}

/// Wall clock used to date attendance marks.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local time of the host.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Per-session parameters.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub context_id: ContextId,
    pub mirror: bool,
    pub warmup_frames: usize,
}

/// Collaborators shared by all sessions.
#[derive(Clone)]
pub struct SessionDeps {
    pub analyzer: Arc<Mutex<FaceAnalyzer>>,
    pub policy: ConfidencePolicy,
    pub ledger: Arc<dyn AttendanceLedger>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceAnnotation {
    pub bbox: BoundingBox,
    pub name: String,
    /// `None` when no recognition backend produced a score.
    pub score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkResult {
    Created,
    AlreadyExists,
    Failed(String),
}

/// A ledger write attempted while processing a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkEvent {
    pub identity: String,
    pub day: NaiveDate,
    pub time: NaiveTime,
    pub result: MarkResult,
}

/// What a session emits per frame.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub session_id: String,
    pub context_id: ContextId,
    pub sequence: u32,
    pub image: RgbImage,
    pub faces: Vec<FaceAnnotation>,
    pub marks: Vec<MarkEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub frames: u64,
    pub marks_created: u64,
    pub marks_existing: u64,
    pub ledger_failures: u64,
    pub reason: CloseReason,
}

#[derive(Default)]
struct Tally {
    frames: u64,
    created: u64,
    existing: u64,
    failures: u64,
}

/// Cancellation flag and observable state, shared with the session thread.
pub struct SessionControl {
    cancel: AtomicBool,
    state: Mutex<SessionState>,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self {
            cancel: AtomicBool::new(false),
            state: Mutex::new(SessionState::Idle),
        }
    }
}

impl SessionControl {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        lock(&self.state).clone()
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("recovering poisoned lock");
        poisoned.into_inner()
    })
}

/// Run one session to completion on the calling thread.
pub fn run_session<S: FrameSource + ?Sized>(
    ctx: &SessionContext,
    deps: &SessionDeps,
    source: &mut S,
    sink: &mpsc::Sender<AnnotatedFrame>,
    control: &SessionControl,
) -> SessionReport {
    let mut tracker = SessionTracker::new();
    let mut tracker_day: Option<NaiveDate> = None;
    let mut tally = Tally::default();
    let mut warmup = ctx.warmup_frames;

    control.set_state(SessionState::Capturing);
    tracing::info!(
        session = %ctx.session_id,
        context_id = ctx.context_id,
        "session capturing"
    );

    let reason = loop {
        if control.is_cancelled() {
            break CloseReason::Cancelled;
        }

        let mut frame = match source.capture() {
            Ok(frame) => frame,
            Err(CameraError::EndOfStream) => break CloseReason::SourceEnded,
            Err(CameraError::Timeout(waited)) => {
                tracing::debug!(session = %ctx.session_id, ?waited, "no frame yet");
                continue;
            }
            Err(e) => {
                tracing::warn!(session = %ctx.session_id, error = %e, "frame read failed");
                break CloseReason::CaptureFailed(e.to_string());
            }
        };

        if warmup > 0 {
            warmup -= 1;
            continue;
        }
        if ctx.mirror {
            frame.mirror();
        }

        let sequence = frame.sequence;
        let captured = frame.timestamp;
        let Some(image) = frame.into_image() else {
            tracing::warn!(session = %ctx.session_id, sequence, "short frame buffer");
            break CloseReason::CaptureFailed(format!("frame {sequence} has a short buffer"));
        };
        tally.frames += 1;

        // Marks are per day; a session left open past midnight starts over.
        let now = deps.clock.now();
        if tracker_day != Some(now.date()) {
            if tracker_day.is_some() {
                tracing::info!(session = %ctx.session_id, day = %now.date(), "new day, tracker reset");
                tracker.reset();
            }
            tracker_day = Some(now.date());
        }

        let annotated = process_frame(ctx, deps, &mut tracker, &mut tally, now, sequence, image);
        tracing::trace!(
            session = %ctx.session_id,
            sequence,
            elapsed_ms = captured.elapsed().as_millis() as u64,
            "frame ready"
        );
        if sink.blocking_send(annotated).is_err() {
            break CloseReason::ConsumerDisconnected;
        }
    };

    let seen = tracker.len();
    tracker.reset();
    tracing::info!(
        session = %ctx.session_id,
        frames = tally.frames,
        seen,
        created = tally.created,
        existing = tally.existing,
        ledger_failures = tally.failures,
        reason = ?reason,
        "session closed"
    );
    control.set_state(SessionState::Closed(reason.clone()));

    SessionReport {
        frames: tally.frames,
        marks_created: tally.created,
        marks_existing: tally.existing,
        ledger_failures: tally.failures,
        reason,
    }
}

fn process_frame(
    ctx: &SessionContext,
    deps: &SessionDeps,
    tracker: &mut SessionTracker,
    tally: &mut Tally,
    now: NaiveDateTime,
    sequence: u32,
    mut image: RgbImage,
) -> AnnotatedFrame {
    let (width, height) = image.dimensions();
    let mut gray = rgb_to_gray(image.as_raw());
    equalize_histogram(&mut gray);

    let resolved: Vec<(BoundingBox, Option<RecognitionOutcome>)> = {
        let mut analyzer = lock(&deps.analyzer);
        let detections = match analyzer.detect_and_classify(&gray, width, height) {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(session = %ctx.session_id, sequence, error = %e, "detection failed");
                Vec::new()
            }
        };
        let enrollment = analyzer.enrollment();
        detections
            .into_iter()
            .map(|d| {
                let outcome = d
                    .prediction
                    .zip(enrollment)
                    .map(|(prediction, enrollment)| deps.policy.resolve(&prediction, enrollment));
                (d.bbox, outcome)
            })
            .collect()
    };
    tracing::debug!(session = %ctx.session_id, sequence, faces = resolved.len(), "frame processed");

    let mut faces = Vec::with_capacity(resolved.len());
    let mut marks = Vec::new();
    for (bbox, outcome) in resolved {
        if let Some(RecognitionOutcome::Known { identity, .. }) = &outcome {
            if !tracker.already_seen(identity.as_str()) {
                marks.push(record_mark(ctx, deps, tracker, tally, now, identity.as_str()));
            }
        }

        let (name, score, color) = match &outcome {
            Some(o @ RecognitionOutcome::Known { .. }) => {
                (o.display_name().to_string(), Some(o.display_score()), KNOWN_COLOR)
            }
            Some(o) => (o.display_name().to_string(), Some(o.display_score()), UNKNOWN_COLOR),
            None => (RecognitionOutcome::UNKNOWN_NAME.to_string(), None, UNKNOWN_COLOR),
        };
        if let Some((x, y, w, h)) = bbox.clamp_to(width, height) {
            draw_box(&mut image, x as i32, y as i32, w, h, color, BOX_THICKNESS);
        }
        faces.push(FaceAnnotation { bbox, name, score });
    }

    AnnotatedFrame {
        session_id: ctx.session_id.clone(),
        context_id: ctx.context_id,
        sequence,
        image,
        faces,
        marks,
    }
}

/// Write one mark. The tracker is only updated once the ledger has answered,
/// so a failed write is attempted again on the next sighting.
fn record_mark(
    ctx: &SessionContext,
    deps: &SessionDeps,
    tracker: &mut SessionTracker,
    tally: &mut Tally,
    now: NaiveDateTime,
    identity: &str,
) -> MarkEvent {
    let day = now.date();
    let time = now.time().with_nanosecond(0).unwrap_or(now.time());

    let result = match deps.ledger.record(ctx.context_id, identity, day, time) {
        Ok(RecordOutcome::Created) => {
            tracker.mark_seen(identity);
            tally.created += 1;
            tracing::info!(
                session = %ctx.session_id,
                context_id = ctx.context_id,
                identity,
                %day,
                %time,
                "attendance marked"
            );
            MarkResult::Created
        }
        Ok(RecordOutcome::AlreadyExists) => {
            tracker.mark_seen(identity);
            tally.existing += 1;
            tracing::debug!(context_id = ctx.context_id, identity, %day, "already marked today");
            MarkResult::AlreadyExists
        }
        Err(e) => {
            tally.failures += 1;
            tracing::warn!(
                context_id = ctx.context_id,
                identity,
                error = %e,
                "ledger write failed; will retry on next sighting"
            );
            MarkResult::Failed(e.to_string())
        }
    };

    MarkEvent {
        identity: identity.to_string(),
        day,
        time,
        result,
    }
}

/// Owner's handle to a running session thread.
pub struct SessionHandle {
    id: String,
    context_id: ContextId,
    control: Arc<SessionControl>,
    thread: Option<JoinHandle<Option<SessionReport>>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel and wait for the thread. The camera is closed when this returns.
    pub fn stop(mut self) -> Option<SessionReport> {
        self.control.cancel();
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(report) => report,
            Err(_) => {
                tracing::error!(session = %self.id, "session thread panicked");
                None
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.control.cancel();
        }
    }
}

/// Open a source on a new thread and run a session on it.
///
/// Returns once the source is open. An open failure (device busy, missing)
/// is returned here and no session runs; there is no retry.
pub fn spawn_session<F, S>(
    ctx: SessionContext,
    deps: SessionDeps,
    open: F,
    sink: mpsc::Sender<AnnotatedFrame>,
) -> Result<SessionHandle, SessionError>
where
    F: FnOnce() -> Result<S, CameraError> + Send + 'static,
    S: FrameSource,
{
    let control = Arc::new(SessionControl::default());
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), CameraError>>();

    let id = ctx.session_id.clone();
    let context_id = ctx.context_id;
    let thread_control = Arc::clone(&control);

    let thread = std::thread::Builder::new()
        .name(format!("rollcall-session-{id}"))
        .spawn(move || {
            let mut source = match open() {
                Ok(source) => source,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return None;
                }
            };
            if ready_tx.send(Ok(())).is_err() {
                return None;
            }
            Some(run_session(
                &ctx,
                &deps,
                &mut source,
                &sink,
                &thread_control,
            ))
        })
        .map_err(SessionError::Spawn)?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            tracing::info!(session = %id, context_id, "session started");
            Ok(SessionHandle {
                id,
                context_id,
                control,
                thread: Some(thread),
            })
        }
        Ok(Err(e)) => {
            let _ = thread.join();
            tracing::error!(session = %id, error = %e, "session failed to start");
            Err(SessionError::Camera(e))
        }
        Err(_) => {
            let _ = thread.join();
            Err(SessionError::ThreadExited)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::backend::GalleryEntry;
    use rollcall_core::{
        DetectorError, Embedder, Embedding, FaceDetector, RecognitionBackend, RecognizerError,
    };
    use rollcall_hw::{DeviceLock, Frame};
    use rollcall_ledger::{LedgerError, MemoryLedger};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const W: u32 = 64;
    const H: u32 = 48;

    fn frame(sequence: u32) -> Frame {
        Frame::new(vec![90; (W * H * 3) as usize], W, H, sequence)
    }

    /// Yields scripted frames, then ends; or repeats forever.
    struct ScriptedSource {
        frames: VecDeque<Result<Frame, CameraError>>,
        endless: bool,
        next_seq: u32,
        _lock: Option<DeviceLock>,
    }

    impl ScriptedSource {
        fn frames(n: u32) -> Self {
            Self {
                frames: (0..n).map(|i| Ok(frame(i))).collect(),
                endless: false,
                next_seq: n,
                _lock: None,
            }
        }

        fn endless() -> Self {
            Self {
                endless: true,
                ..Self::frames(0)
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn capture(&mut self) -> Result<Frame, CameraError> {
            if let Some(next) = self.frames.pop_front() {
                return next;
            }
            if self.endless {
                std::thread::sleep(Duration::from_millis(2));
                self.next_seq += 1;
                return Ok(frame(self.next_seq));
            }
            Err(CameraError::EndOfStream)
        }
    }

    struct ScriptedDetector {
        boxes: Vec<BoundingBox>,
        fail: bool,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(
            &mut self,
            _: &[u8],
            _: u32,
            _: u32,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            if self.fail {
                return Err(DetectorError::InferenceFailed("scripted".into()));
            }
            Ok(self.boxes.clone())
        }
    }

    /// Embeds by horizontal position: left is ada, middle is bo, right is a stranger.
    struct PositionEmbedder;

    impl Embedder for PositionEmbedder {
        fn embed(
            &mut self,
            _: &[u8],
            _: u32,
            _: u32,
            face: &BoundingBox,
        ) -> Result<Embedding, RecognizerError> {
            let values = if face.x < 10.0 {
                vec![1.0, 0.0]
            } else if face.x < 30.0 {
                vec![0.0, 1.0]
            } else {
                vec![-1.0, 0.0]
            };
            Ok(Embedding::new(values))
        }
    }

    fn face_at(x: f32) -> BoundingBox {
        BoundingBox {
            x,
            y: 5.0,
            width: 10.0,
            height: 10.0,
            confidence: 0.9,
            landmarks: None,
        }
    }

    const ADA: f32 = 2.0;
    const BO: f32 = 20.0;
    const STRANGER: f32 = 40.0;

    fn analyzer(boxes: Vec<BoundingBox>, with_backend: bool) -> Arc<Mutex<FaceAnalyzer>> {
        let backend = with_backend.then(|| {
            RecognitionBackend::nearest_neighbor(
                Box::new(PositionEmbedder),
                vec![
                    GalleryEntry {
                        name: "ada".into(),
                        embedding: vec![1.0, 0.0],
                    },
                    GalleryEntry {
                        name: "bo".into(),
                        embedding: vec![0.0, 1.0],
                    },
                ],
            )
        });
        let detector = ScriptedDetector { boxes, fail: false };
        Arc::new(Mutex::new(FaceAnalyzer::new(
            Some(Box::new(detector)),
            backend,
        )))
    }

    /// Counts `record` calls; the first `failures` calls fail.
    #[derive(Default)]
    struct CountingLedger {
        inner: MemoryLedger,
        calls: AtomicUsize,
        failures: AtomicUsize,
    }

    impl CountingLedger {
        fn failing(n: usize) -> Self {
            let ledger = Self::default();
            ledger.failures.store(n, Ordering::SeqCst);
            ledger
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl AttendanceLedger for CountingLedger {
        fn record(
            &self,
            context_id: ContextId,
            identity: &str,
            day: NaiveDate,
            time: NaiveTime,
        ) -> Result<RecordOutcome, LedgerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(LedgerError::Corrupt("disk unavailable".into()));
            }
            self.inner.record(context_id, identity, day, time)
        }

        fn records_for(
            &self,
            context_id: ContextId,
        ) -> Result<Vec<rollcall_ledger::AttendanceMark>, LedgerError> {
            self.inner.records_for(context_id)
        }

        fn remove(
            &self,
            context_id: ContextId,
            identity: &str,
            day: NaiveDate,
        ) -> Result<bool, LedgerError> {
            self.inner.remove(context_id, identity, day)
        }

        fn contexts(&self) -> Result<Vec<ContextId>, LedgerError> {
            self.inner.contexts()
        }
    }

    struct FixedClock;

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 5, 6)
                .and_then(|d| d.and_hms_milli_opt(9, 15, 30, 250))
                .unwrap()
        }
    }

    /// Two readings on 2024-05-06 late evening, then the next morning.
    #[derive(Default)]
    struct MidnightClock {
        calls: AtomicUsize,
    }

    impl Clock for MidnightClock {
        fn now(&self) -> NaiveDateTime {
            let (day, hour) = match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => (6, 23),
                _ => (7, 8),
            };
            NaiveDate::from_ymd_opt(2024, 5, day)
                .and_then(|d| d.and_hms_opt(hour, 59, 0))
                .unwrap()
        }
    }

    fn deps(analyzer: Arc<Mutex<FaceAnalyzer>>, ledger: Arc<CountingLedger>) -> SessionDeps {
        SessionDeps {
            analyzer,
            policy: ConfidencePolicy::default(),
            ledger,
            clock: Arc::new(FixedClock),
        }
    }

    fn ctx(id: &str) -> SessionContext {
        SessionContext {
            session_id: id.into(),
            context_id: 7,
            mirror: false,
            warmup_frames: 0,
        }
    }

    fn run(
        ctx: &SessionContext,
        deps: &SessionDeps,
        source: &mut ScriptedSource,
    ) -> (SessionReport, Vec<AnnotatedFrame>) {
        let (tx, mut rx) = mpsc::channel(64);
        let report = run_session(ctx, deps, source, &tx, &SessionControl::default());
        drop(tx);
        let mut emitted = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            emitted.push(frame);
        }
        (report, emitted)
    }

    #[test]
    fn test_repeat_sighting_does_not_reach_ledger() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(vec![face_at(ADA)], true), Arc::clone(&ledger));

        let (report, emitted) = run(&ctx("s1"), &deps, &mut ScriptedSource::frames(3));

        assert_eq!(ledger.calls(), 1);
        assert_eq!(report.frames, 3);
        assert_eq!(report.marks_created, 1);
        assert_eq!(report.reason, CloseReason::SourceEnded);
        assert_eq!(ledger.records_for(7).unwrap().len(), 1);

        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[0].marks.len(), 1);
        assert_eq!(emitted[0].marks[0].result, MarkResult::Created);
        assert_eq!(emitted[0].marks[0].time, NaiveTime::from_hms_opt(9, 15, 30).unwrap());
        assert!(emitted[1].marks.is_empty());
        assert_eq!(emitted[2].faces[0].name, "ada");
    }

    #[test]
    fn test_session_past_midnight_marks_new_day() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = SessionDeps {
            clock: Arc::new(MidnightClock::default()),
            ..deps(analyzer(vec![face_at(ADA)], true), Arc::clone(&ledger))
        };

        let (report, emitted) = run(&ctx("s1"), &deps, &mut ScriptedSource::frames(4));

        assert_eq!(ledger.calls(), 2);
        assert_eq!(report.marks_created, 2);
        assert_eq!(emitted[0].marks[0].result, MarkResult::Created);
        assert!(emitted[1].marks.is_empty());
        assert_eq!(emitted[2].marks[0].result, MarkResult::Created);
        assert_eq!(emitted[2].marks[0].day, NaiveDate::from_ymd_opt(2024, 5, 7).unwrap());
        assert!(emitted[3].marks.is_empty());

        let days: Vec<NaiveDate> = ledger.records_for(7).unwrap().iter().map(|m| m.day).collect();
        assert_eq!(
            days,
            [
                NaiveDate::from_ymd_opt(2024, 5, 7).unwrap(),
                NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
            ]
        );
    }

    #[test]
    fn test_capture_timeout_keeps_session_open() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(vec![face_at(ADA)], true), Arc::clone(&ledger));
        let mut source = ScriptedSource::frames(1);
        source
            .frames
            .push_back(Err(CameraError::Timeout(Duration::from_millis(500))));
        source.frames.push_back(Ok(frame(5)));

        let (report, emitted) = run(&ctx("s1"), &deps, &mut source);

        assert_eq!(report.reason, CloseReason::SourceEnded);
        assert_eq!(report.frames, 2);
        assert_eq!(emitted[1].sequence, 5);
        assert_eq!(ledger.calls(), 1);
    }

    #[test]
    fn test_two_faces_one_frame() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(
            analyzer(vec![face_at(ADA), face_at(BO), face_at(STRANGER)], true),
            Arc::clone(&ledger),
        );

        let (report, emitted) = run(&ctx("s1"), &deps, &mut ScriptedSource::frames(2));

        assert_eq!(ledger.calls(), 2);
        assert_eq!(report.marks_created, 2);
        let names: Vec<&str> = emitted[0].faces.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["ada", "bo", "Unknown"]);
        // Stranger is sqrt(2) from the nearest entry; display score clamps at 0.
        assert_eq!(emitted[0].faces[2].score, Some(0.0));
        assert_eq!(emitted[0].image.get_pixel(ADA as u32, 5), &KNOWN_COLOR);
        assert_eq!(emitted[0].image.get_pixel(STRANGER as u32, 5), &UNKNOWN_COLOR);
    }

    #[test]
    fn test_concurrent_sessions_mark_once() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(vec![face_at(ADA)], true), Arc::clone(&ledger));

        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let deps = deps.clone();
                std::thread::spawn(move || run(&ctx(id), &deps, &mut ScriptedSource::frames(4)).0)
            })
            .collect();
        let reports: Vec<SessionReport> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let created: u64 = reports.iter().map(|r| r.marks_created).sum();
        let existing: u64 = reports.iter().map(|r| r.marks_existing).sum();
        assert_eq!(created, 1);
        assert_eq!(existing, 1);
        assert_eq!(ledger.calls(), 2);
        assert_eq!(ledger.records_for(7).unwrap().len(), 1);
    }

    #[test]
    fn test_ledger_fault_is_retried() {
        let ledger = Arc::new(CountingLedger::failing(1));
        let deps = deps(analyzer(vec![face_at(BO)], true), Arc::clone(&ledger));

        let (report, emitted) = run(&ctx("s1"), &deps, &mut ScriptedSource::frames(3));

        assert_eq!(ledger.calls(), 2);
        assert_eq!(report.ledger_failures, 1);
        assert_eq!(report.marks_created, 1);
        assert!(matches!(emitted[0].marks[0].result, MarkResult::Failed(_)));
        assert_eq!(emitted[1].marks[0].result, MarkResult::Created);
        assert!(emitted[2].marks.is_empty());
    }

    #[test]
    fn test_no_backend_shows_boxes_without_marking() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(vec![face_at(ADA)], false), Arc::clone(&ledger));

        let (report, emitted) = run(&ctx("s1"), &deps, &mut ScriptedSource::frames(2));

        assert_eq!(ledger.calls(), 0);
        assert_eq!(report.frames, 2);
        assert_eq!(emitted[0].faces.len(), 1);
        assert_eq!(emitted[0].faces[0].name, "Unknown");
        assert_eq!(emitted[0].faces[0].score, None);
    }

    #[test]
    fn test_detector_failure_keeps_session_running() {
        let ledger = Arc::new(CountingLedger::default());
        let detector = ScriptedDetector {
            boxes: vec![face_at(ADA)],
            fail: true,
        };
        let analyzer = Arc::new(Mutex::new(FaceAnalyzer::new(Some(Box::new(detector)), None)));
        let deps = deps(analyzer, ledger);

        let (report, emitted) = run(&ctx("s1"), &deps, &mut ScriptedSource::frames(2));
        assert_eq!(report.reason, CloseReason::SourceEnded);
        assert_eq!(emitted.len(), 2);
        assert!(emitted.iter().all(|f| f.faces.is_empty()));
    }

    #[test]
    fn test_failed_read_ends_session() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(vec![face_at(ADA)], true), ledger);
        let mut source = ScriptedSource::frames(1);
        source
            .frames
            .push_back(Err(CameraError::CaptureFailed("unplugged".into())));
        source.frames.push_back(Ok(frame(9)));

        let (report, emitted) = run(&ctx("s1"), &deps, &mut source);

        assert!(matches!(report.reason, CloseReason::CaptureFailed(ref m) if m.contains("unplugged")));
        assert_eq!(report.frames, 1);
        assert_eq!(emitted.len(), 1);
    }

    #[test]
    fn test_short_buffer_is_not_emitted() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(Vec::new(), false), ledger);
        let mut source = ScriptedSource::frames(0);
        source.frames.push_back(Ok(Frame::new(vec![0; 10], W, H, 0)));

        let (report, emitted) = run(&ctx("s1"), &deps, &mut source);
        assert!(matches!(report.reason, CloseReason::CaptureFailed(_)));
        assert!(emitted.is_empty());
    }

    #[test]
    fn test_consumer_disconnect_ends_session() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(Vec::new(), false), ledger);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let control = SessionControl::default();
        let report = run_session(&ctx("s1"), &deps, &mut ScriptedSource::endless(), &tx, &control);

        assert_eq!(report.reason, CloseReason::ConsumerDisconnected);
        assert_eq!(report.frames, 1);
        assert_eq!(
            control.state(),
            SessionState::Closed(CloseReason::ConsumerDisconnected)
        );
    }

    #[test]
    fn test_warmup_and_mirror() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(Vec::new(), false), ledger);
        let ctx = SessionContext {
            mirror: true,
            warmup_frames: 2,
            ..ctx("s1")
        };
        let mut source = ScriptedSource::frames(0);
        for seq in 0..3 {
            let mut f = frame(seq);
            f.rgb[..3].copy_from_slice(&[255, 0, 0]);
            source.frames.push_back(Ok(f));
        }

        let (report, emitted) = run(&ctx, &deps, &mut source);

        assert_eq!(report.frames, 1);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].sequence, 2);
        assert_eq!(emitted[0].image.get_pixel(W - 1, 0), &Rgb([255, 0, 0]));
    }

    fn locked_source(node: PathBuf) -> impl FnOnce() -> Result<ScriptedSource, CameraError> {
        move || {
            let lock = DeviceLock::acquire(&node)?;
            Ok(ScriptedSource {
                _lock: Some(lock),
                ..ScriptedSource::endless()
            })
        }
    }

    fn drain(mut rx: mpsc::Receiver<AnnotatedFrame>) -> std::thread::JoinHandle<usize> {
        std::thread::spawn(move || {
            let mut n = 0;
            while rx.blocking_recv().is_some() {
                n += 1;
            }
            n
        })
    }

    #[test]
    fn test_camera_is_exclusive_and_released_on_stop() {
        let node = tempfile::NamedTempFile::new().unwrap();
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(Vec::new(), false), ledger);

        let (tx1, rx1) = mpsc::channel(2);
        let viewer = drain(rx1);
        let first = spawn_session(
            ctx("first"),
            deps.clone(),
            locked_source(node.path().to_path_buf()),
            tx1,
        )
        .unwrap();
        assert_eq!(first.id(), "first");
        assert_eq!(first.context_id(), 7);

        let (tx2, _rx2) = mpsc::channel(2);
        let second = spawn_session(
            ctx("second"),
            deps.clone(),
            locked_source(node.path().to_path_buf()),
            tx2,
        );
        assert!(matches!(
            second,
            Err(SessionError::Camera(CameraError::DeviceBusy(_)))
        ));

        let report = first.stop().unwrap();
        assert_eq!(report.reason, CloseReason::Cancelled);
        assert!(viewer.join().unwrap() as u64 <= report.frames);

        let (tx3, rx3) = mpsc::channel(2);
        let viewer = drain(rx3);
        let third = spawn_session(
            ctx("third"),
            deps,
            locked_source(node.path().to_path_buf()),
            tx3,
        )
        .unwrap();
        assert!(!third.is_finished());
        third.stop().unwrap();
        viewer.join().unwrap();
    }

    /// Holds the device but never delivers a frame.
    struct StalledSource {
        _lock: DeviceLock,
    }

    impl FrameSource for StalledSource {
        fn capture(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(Duration::from_millis(5));
            Err(CameraError::Timeout(Duration::from_millis(5)))
        }
    }

    #[test]
    fn test_stop_releases_stalled_camera() {
        let node = tempfile::NamedTempFile::new().unwrap();
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(Vec::new(), false), ledger);
        let path = node.path().to_path_buf();
        let (tx, _rx) = mpsc::channel(1);

        let handle = spawn_session(
            ctx("stalled"),
            deps,
            move || {
                Ok(StalledSource {
                    _lock: DeviceLock::acquire(&path)?,
                })
            },
            tx,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(handle.state(), SessionState::Capturing);

        let report = handle.stop().unwrap();
        assert_eq!(report.reason, CloseReason::Cancelled);
        assert_eq!(report.frames, 0);
        DeviceLock::acquire(node.path()).unwrap();
    }

    #[test]
    fn test_open_failure_surfaces_to_caller() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(Vec::new(), false), ledger);
        let (tx, _rx) = mpsc::channel(1);

        let result = spawn_session(
            ctx("s1"),
            deps,
            || -> Result<ScriptedSource, CameraError> {
                Err(CameraError::DeviceNotFound("/dev/video9".into()))
            },
            tx,
        );
        assert!(matches!(
            result,
            Err(SessionError::Camera(CameraError::DeviceNotFound(_)))
        ));
    }

    #[test]
    fn test_spawned_session_reports_state() {
        let ledger = Arc::new(CountingLedger::default());
        let deps = deps(analyzer(vec![face_at(ADA)], true), Arc::clone(&ledger));
        let (tx, rx) = mpsc::channel(2);
        let viewer = drain(rx);

        let handle = spawn_session(ctx("s1"), deps, || Ok(ScriptedSource::frames(5)), tx).unwrap();
        assert_eq!(viewer.join().unwrap(), 5);
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.state(), SessionState::Closed(CloseReason::SourceEnded));
        let report = handle.stop().unwrap();
        assert_eq!(report.marks_created, 1);
        assert_eq!(ledger.calls(), 1);
    }
}
