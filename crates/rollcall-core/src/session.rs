//! The recognition session: detection thread, debounce, matching and
//! attendance recording for one running capture.
//!
//! Detection runs on a dedicated OS thread that owns the frame source and
//! the detector. Every cycle it captures one frame, runs detection and
//! sends a report over a bounded channel to a single tokio worker, then
//! waits `frame_interval` before the next cycle. The worker feeds faces
//! into a trailing-edge [`Debouncer`], evaluates the surviving detection
//! against a roster snapshot and records attendance for accepted matches.

use crate::debounce::{Admission, Cooldown, Debouncer};
use crate::detector::Detector;
use crate::matcher::{Decision, MatchPolicy, NormalizedThreshold};
use crate::recorder::AttendanceRecorder;
use crate::source::FrameSource;
use crate::store::{MemberStore, StoreError};
use crate::types::{AttendanceRecord, DetectedFace, Member, MatchResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Pending reports between the detection thread and the worker.
const REPORT_BUFFER: usize = 8;

const EVENT_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum InitError {
    #[error("frame source unavailable: {0}")]
    FrameSource(String),
    #[error("detector failed to load: {0}")]
    Detector(String),
    #[error("initialization aborted: {0}")]
    Aborted(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("initialization failed: {0}")]
    Init(#[from] InitError),
    #[error("failed to load roster: {0}")]
    Roster(#[source] StoreError),
    #[error("session already running")]
    AlreadyRunning,
    #[error("session not running")]
    NotRunning,
    #[error("failed to spawn detection thread: {0}")]
    DetectionThread(String),
}

/// Acquires the blocking resources a session needs.
///
/// Both calls run on a blocking thread during [`RecognitionSession::start`].
pub trait CaptureResources: Send + 'static {
    fn open_source(&mut self) -> Result<Box<dyn FrameSource>, InitError>;

    fn load_detector(&mut self) -> Result<Box<dyn Detector>, InitError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Initializing,
    Detecting,
    Evaluating,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Detecting => "detecting",
            Self::Evaluating => "evaluating",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initializing | Self::Detecting | Self::Evaluating)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A confirmed check-in, shown as the banner until the cooldown runs out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Confirmation {
    pub member: Member,
    pub score: f32,
    pub record: AttendanceRecord,
}

/// The most recent face the detection thread reported.
#[derive(Debug, Clone, Copy)]
pub struct SeenFace {
    pub face: DetectedFace,
    pub seen_at: std::time::Instant,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started,
    FrameProcessed { sequence: u32, faces: usize },
    DetectionFailed { sequence: u32, error: String },
    CheckedIn(Confirmation),
    RecentAttendance(Vec<AttendanceRecord>),
    /// The attempt completed without an accepted match.
    NoMatch { best_score: Option<f32> },
    StoreFailed { member_id: String, error: String },
    BannerCleared,
    /// `reason` is `None` for a requested stop.
    Stopped { reason: Option<String> },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub policy: Arc<dyn MatchPolicy>,
    pub debounce: Duration,
    pub cooldown: Duration,
    /// Pause between detection cycles.
    pub frame_interval: Duration,
    pub recent_limit: usize,
    pub store_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: Arc::new(NormalizedThreshold::default()),
            debounce: crate::debounce::DEFAULT_DEBOUNCE,
            cooldown: crate::debounce::DEFAULT_COOLDOWN,
            frame_interval: Duration::from_millis(33),
            recent_limit: 10,
            store_timeout: None,
        }
    }
}

/// State shared between the session handle and its worker.
struct Shared {
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    roster: RwLock<Arc<Vec<Member>>>,
    latest: Mutex<Option<SeenFace>>,
    banner: Mutex<Option<Confirmation>>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "session state changed");
        }
    }

    /// Move to `Stopped`, emitting the event only on the first transition.
    fn finish(&self, reason: Option<String>) {
        let previous = self.state.send_replace(SessionState::Stopped);
        if previous != SessionState::Stopped {
            match &reason {
                Some(reason) => tracing::warn!(reason = %reason, "recognition session stopped"),
                None => tracing::info!("recognition session stopped"),
            }
            self.emit(SessionEvent::Stopped { reason });
        }
    }

    fn roster(&self) -> Arc<Vec<Member>> {
        match self.roster.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace_roster(&self, members: Vec<Member>) {
        let members = Arc::new(members);
        match self.roster.write() {
            Ok(mut guard) => *guard = members,
            Err(poisoned) => *poisoned.into_inner() = members,
        }
    }

    fn set_latest(&self, seen: Option<SeenFace>) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = seen;
        }
    }

    fn set_banner(&self, confirmation: Option<Confirmation>) {
        if let Ok(mut banner) = self.banner.lock() {
            *banner = confirmation;
        }
    }
}

/// One frame's worth of output from the detection thread.
enum Report {
    Frame {
        sequence: u32,
        faces: Result<Vec<DetectedFace>, String>,
    },
    /// The frame source failed; the thread has released it and exited.
    SourceFailed(String),
}

struct CaptureThread {
    cancelled: Arc<AtomicBool>,
    wake: std::sync::mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

struct Running {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    capture: CaptureThread,
}

impl Running {
    /// Cancel the pending attempt, then the detection cycle, then wait for
    /// the detection thread to release the source.
    async fn shutdown(self) {
        let Running {
            cancel,
            worker,
            capture,
        } = self;

        cancel.cancel();
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "recognition worker ended abnormally");
        }

        let CaptureThread {
            cancelled,
            wake,
            handle,
        } = capture;
        cancelled.store(true, Ordering::SeqCst);
        drop(wake);
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::error!("detection thread panicked"),
            Err(e) => tracing::error!(error = %e, "failed to join detection thread"),
        }
    }

    /// Signal everything to stop without waiting.
    fn abandon(self) {
        self.cancel.cancel();
        self.capture.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Handle to the recognition loop. At most one capture runs at a time;
/// a stopped session can be started again.
pub struct RecognitionSession {
    store: Arc<dyn MemberStore>,
    config: SessionConfig,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl RecognitionSession {
    pub fn new(store: Arc<dyn MemberStore>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            config,
            shared: Arc::new(Shared {
                state,
                events,
                roster: RwLock::new(Arc::new(Vec::new())),
                latest: Mutex::new(None),
                banner: Mutex::new(None),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Current roster snapshot.
    pub fn roster(&self) -> Arc<Vec<Member>> {
        self.shared.roster()
    }

    /// Reload the roster from the store. Attempts already in flight keep
    /// the snapshot they started with.
    pub async fn refresh_roster(&self) -> Result<usize, StoreError> {
        let members = self.store.list_members().await?;
        let count = members.len();
        self.shared.replace_roster(members);
        tracing::debug!(members = count, "roster refreshed");
        Ok(count)
    }

    pub fn latest_face(&self) -> Option<SeenFace> {
        self.shared.latest.lock().ok().and_then(|latest| *latest)
    }

    /// The latest face if it was seen within `max_age`.
    pub fn fresh_face(&self, max_age: Duration) -> Option<DetectedFace> {
        self.latest_face()
            .filter(|seen| seen.seen_at.elapsed() <= max_age)
            .map(|seen| seen.face)
    }

    /// The confirmation currently on display, if the cooldown is running.
    pub fn banner(&self) -> Option<Confirmation> {
        self.shared.banner.lock().ok().and_then(|b| b.clone())
    }

    /// Load the roster, acquire the frame source and detector, then begin
    /// detecting. Any failure leaves the session `Stopped`.
    pub async fn start(&self, resources: Box<dyn CaptureResources>) -> Result<(), SessionError> {
        let mut running = self.running.lock().await;
        if let Some(active) = running.take() {
            if self.state().is_active() {
                *running = Some(active);
                return Err(SessionError::AlreadyRunning);
            }
            // Ended on its own (source failure); reap it before restarting.
            active.shutdown().await;
        }

        self.shared.set_state(SessionState::Initializing);

        if let Err(e) = self.refresh_roster().await {
            self.shared.finish(Some(format!("failed to load roster: {e}")));
            return Err(SessionError::Roster(e));
        }

        let acquired = tokio::task::spawn_blocking(move || acquire(resources))
            .await
            .map_err(|e| InitError::Aborted(e.to_string()))
            .and_then(|result| result);
        let (source, detector) = match acquired {
            Ok(pair) => pair,
            Err(e) => {
                self.shared.finish(Some(e.to_string()));
                return Err(e.into());
            }
        };

        self.shared.set_latest(None);
        self.shared.set_banner(None);
        self.shared.set_state(SessionState::Detecting);
        self.shared.emit(SessionEvent::Started);

        let (report_tx, report_rx) = mpsc::channel(REPORT_BUFFER);
        let (wake_tx, wake_rx) = std::sync::mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let interval = self.config.frame_interval;

        let thread_cancelled = cancelled.clone();
        let handle = std::thread::Builder::new()
            .name("rollcall-detect".into())
            .spawn(move || {
                run_detection(source, detector, report_tx, wake_rx, thread_cancelled, interval)
            })
            .map_err(|e| {
                self.shared.finish(Some(e.to_string()));
                SessionError::DetectionThread(e.to_string())
            })?;

        let cancel = CancellationToken::new();
        let worker = Worker {
            shared: self.shared.clone(),
            policy: self.config.policy.clone(),
            recorder: AttendanceRecorder::new(self.store.clone())
                .with_timeout(self.config.store_timeout),
            recent_limit: self.config.recent_limit,
            debouncer: Debouncer::new(self.config.debounce),
            cooldown: Cooldown::new(self.config.cooldown),
        };
        let worker = tokio::spawn(worker.run(report_rx, cancel.clone()));

        tracing::info!(
            policy = self.config.policy.name(),
            debounce_ms = self.config.debounce.as_millis() as u64,
            members = self.shared.roster().len(),
            "recognition session started"
        );

        *running = Some(Running {
            cancel,
            worker,
            capture: CaptureThread {
                cancelled,
                wake: wake_tx,
                handle,
            },
        });
        Ok(())
    }

    /// Stop the running capture. No events besides `Stopped` are emitted
    /// once this returns, and the frame source has been released.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let active = self
            .running
            .lock()
            .await
            .take()
            .ok_or(SessionError::NotRunning)?;
        active.shutdown().await;
        self.shared.set_latest(None);
        self.shared.set_banner(None);
        self.shared.finish(None);
        Ok(())
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        if let Some(active) = self.running.get_mut().take() {
            active.abandon();
        }
    }
}

/// Open the source, then load the detector. The source is released if the
/// detector cannot be loaded.
fn acquire(
    mut resources: Box<dyn CaptureResources>,
) -> Result<(Box<dyn FrameSource>, Box<dyn Detector>), InitError> {
    let mut source = resources.open_source()?;
    match resources.load_detector() {
        Ok(detector) => Ok((source, detector)),
        Err(e) => {
            source.release();
            Err(e)
        }
    }
}

fn run_detection(
    mut source: Box<dyn FrameSource>,
    mut detector: Box<dyn Detector>,
    reports: mpsc::Sender<Report>,
    wake: std::sync::mpsc::Receiver<()>,
    cancelled: Arc<AtomicBool>,
    interval: Duration,
) {
    tracing::info!("detection thread started");
    let mut failure = None;

    while !cancelled.load(Ordering::SeqCst) {
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        };
        if cancelled.load(Ordering::SeqCst) {
            break;
        }

        let faces = detector.detect(&frame).map_err(|e| e.to_string());
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        let report = Report::Frame {
            sequence: frame.sequence,
            faces,
        };
        if reports.blocking_send(report).is_err() {
            break;
        }

        // Disconnection means stop.
        match wake.recv_timeout(interval) {
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    source.release();
    if let Some(reason) = failure {
        tracing::warn!(error = %reason, "frame source failed");
        let _ = reports.blocking_send(Report::SourceFailed(reason));
    }
    tracing::info!("detection thread exiting");
}

enum Outcome {
    Confirmed {
        confirmation: Confirmation,
        recent: Result<Vec<AttendanceRecord>, StoreError>,
    },
    NoMatch(Option<MatchResult>),
    StoreFailed {
        member_id: String,
        error: StoreError,
    },
}

/// Match one face against the roster and record attendance on acceptance.
async fn evaluate(
    face: DetectedFace,
    roster: Arc<Vec<Member>>,
    policy: Arc<dyn MatchPolicy>,
    recorder: AttendanceRecorder,
    recent_limit: usize,
) -> Outcome {
    let candidate = match policy.decide(&face.signature(), &roster) {
        Decision::Accepted(candidate) => candidate,
        Decision::Rejected(best) => return Outcome::NoMatch(best),
    };

    match recorder.record(&candidate.member.id).await {
        Ok(record) => Outcome::Confirmed {
            recent: recorder.recent(recent_limit).await,
            confirmation: Confirmation {
                member: candidate.member,
                score: candidate.score,
                record,
            },
        },
        Err(error) => Outcome::StoreFailed {
            member_id: candidate.member.id,
            error,
        },
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

enum Flow {
    Continue,
    Exit,
}

struct Worker {
    shared: Arc<Shared>,
    policy: Arc<dyn MatchPolicy>,
    recorder: AttendanceRecorder,
    recent_limit: usize,
    debouncer: Debouncer<DetectedFace>,
    cooldown: Cooldown,
}

impl Worker {
    async fn run(mut self, mut reports: mpsc::Receiver<Report>, cancel: CancellationToken) {
        loop {
            let flow = tokio::select! {
                biased;
                _ = cancel.cancelled() => Flow::Exit,
                report = reports.recv() => self.on_report(report),
                _ = sleep_until(self.cooldown.deadline()) => {
                    self.expire_banner();
                    Flow::Continue
                }
                _ = sleep_until(self.debouncer.deadline()) => {
                    self.attempt(&mut reports, &cancel).await
                }
            };
            if let Flow::Exit = flow {
                break;
            }
        }
        if self.debouncer.cancel() {
            tracing::debug!("pending recognition attempt cancelled");
        }
    }

    fn on_report(&mut self, report: Option<Report>) -> Flow {
        match report {
            Some(Report::Frame { sequence, faces }) => {
                self.on_frame(sequence, faces);
                Flow::Continue
            }
            Some(Report::SourceFailed(reason)) => {
                self.shared.finish(Some(reason));
                Flow::Exit
            }
            None => Flow::Exit,
        }
    }

    fn on_frame(&mut self, sequence: u32, faces: Result<Vec<DetectedFace>, String>) {
        let faces = match faces {
            Ok(faces) => faces,
            Err(error) => {
                tracing::warn!(sequence, error = %error, "face detection failed");
                self.shared
                    .emit(SessionEvent::DetectionFailed { sequence, error });
                return;
            }
        };

        self.shared.emit(SessionEvent::FrameProcessed {
            sequence,
            faces: faces.len(),
        });
        if let Some(face) = faces.first() {
            self.shared.set_latest(Some(SeenFace {
                face: *face,
                seen_at: std::time::Instant::now(),
            }));
        }

        let now = Instant::now();
        for face in faces {
            if self.debouncer.offer(face, now) == Admission::Ignored {
                tracing::trace!(sequence, "face ignored while evaluating");
            }
        }
    }

    fn expire_banner(&mut self) {
        if self.cooldown.expire(Instant::now()) {
            self.shared.set_banner(None);
            self.shared.emit(SessionEvent::BannerCleared);
        }
    }

    /// Run the due attempt, still draining reports so frames keep flowing.
    async fn attempt(
        &mut self,
        reports: &mut mpsc::Receiver<Report>,
        cancel: &CancellationToken,
    ) -> Flow {
        let Some(face) = self.debouncer.take_due(Instant::now()) else {
            return Flow::Continue;
        };
        let roster = self.shared.roster();
        if roster.is_empty() {
            tracing::debug!("roster empty; skipping recognition attempt");
            return Flow::Continue;
        }

        self.debouncer.begin();
        self.shared.set_state(SessionState::Evaluating);

        let evaluation = evaluate(
            face,
            roster,
            self.policy.clone(),
            self.recorder.clone(),
            self.recent_limit,
        );
        tokio::pin!(evaluation);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("recognition attempt abandoned");
                    return Flow::Exit;
                }
                outcome = &mut evaluation => {
                    self.apply(outcome);
                    return Flow::Continue;
                }
                report = reports.recv() => {
                    if let Flow::Exit = self.on_report(report) {
                        return Flow::Exit;
                    }
                }
                _ = sleep_until(self.cooldown.deadline()) => self.expire_banner(),
            }
        }
    }

    fn apply(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Confirmed {
                confirmation,
                recent,
            } => {
                match recent {
                    Ok(records) => self.shared.emit(SessionEvent::RecentAttendance(records)),
                    Err(e) => tracing::warn!(error = %e, "failed to refresh recent attendance"),
                }
                tracing::info!(
                    member_id = %confirmation.member.id,
                    name = %confirmation.member.name,
                    score = confirmation.score,
                    "member checked in"
                );
                self.cooldown.arm(Instant::now());
                self.shared.set_banner(Some(confirmation.clone()));
                self.shared.emit(SessionEvent::CheckedIn(confirmation));
            }
            Outcome::NoMatch(best) => {
                tracing::info!(
                    policy = self.policy.name(),
                    best_score = ?best.as_ref().map(|b| b.score),
                    "no matching member"
                );
                self.shared.emit(SessionEvent::NoMatch {
                    best_score: best.map(|b| b.score),
                });
            }
            Outcome::StoreFailed { member_id, error } => {
                self.shared.emit(SessionEvent::StoreFailed {
                    member_id,
                    error: error.to_string(),
                });
            }
        }
        self.debouncer.finish();
        self.shared.set_state(SessionState::Detecting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::RawDifference;
    use crate::testing::{
        face, signature, FakeResources, MemoryStore, ScriptedDetector, ScriptedSource,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> SessionConfig {
        SessionConfig {
            debounce: Duration::from_millis(50),
            cooldown: Duration::from_millis(2000),
            frame_interval: Duration::from_millis(5),
            ..SessionConfig::default()
        }
    }

    /// Wait for the first event accepted by `pick`.
    async fn next_matching<T>(
        events: &mut broadcast::Receiver<SessionEvent>,
        mut pick: impl FnMut(SessionEvent) -> Option<T>,
    ) -> T {
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(found) = pick(event) {
                            return found;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event stream ended: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn next_check_in(events: &mut broadcast::Receiver<SessionEvent>) -> Confirmation {
        next_matching(events, |e| match e {
            SessionEvent::CheckedIn(c) => Some(c),
            _ => None,
        })
        .await
    }

    #[tokio::test]
    async fn test_close_face_checks_in_member() {
        let store = Arc::new(MemoryStore::new());
        let ada = store.seed("Ada", Some(signature(100.0, 100.0)));
        let session = RecognitionSession::new(store.clone(), fast_config());
        let mut events = session.subscribe();

        let (source, probe) = ScriptedSource::new();
        let detector = ScriptedDetector::burst(face(102.0, 101.0), 0..3);
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        let recent = next_matching(&mut events, |e| match e {
            SessionEvent::RecentAttendance(records) => Some(records),
            _ => None,
        })
        .await;
        let confirmation = next_check_in(&mut events).await;

        assert_eq!(confirmation.member.id, ada.id);
        assert!((confirmation.score - 0.985).abs() < 1e-6);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, confirmation.record.id);
        assert_eq!(store.records_for(&ada.id), 1);
        assert_eq!(session.banner().map(|b| b.member.id), Some(ada.id));

        session.stop().await.unwrap();
        assert_eq!(probe.released(), 1);
    }

    #[tokio::test]
    async fn test_distant_face_reports_no_match() {
        let store = Arc::new(MemoryStore::new());
        store.seed("Ada", Some(signature(50.0, 50.0)));
        let session = RecognitionSession::new(store.clone(), fast_config());
        let mut events = session.subscribe();

        let (source, _probe) = ScriptedSource::new();
        let detector = ScriptedDetector::burst(face(200.0, 200.0), 0..2);
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        let best = next_matching(&mut events, |e| match e {
            SessionEvent::NoMatch { best_score } => Some(best_score),
            _ => None,
        })
        .await;
        assert_eq!(best, None);
        assert_eq!(store.attendance_count(), 0);
        assert!(session.banner().is_none());

        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeat_match_within_cooldown_writes_again() {
        let store = Arc::new(MemoryStore::new());
        let ada = store.seed("Ada", Some(signature(100.0, 100.0)));
        let session = RecognitionSession::new(store.clone(), fast_config());
        let mut events = session.subscribe();

        let (source, _probe) = ScriptedSource::new();
        let seen = face(101.0, 100.0);
        let detector = ScriptedDetector::new(move |seq| {
            Ok(if seq < 2 || (40..42).contains(&seq) {
                vec![seen]
            } else {
                vec![]
            })
        });
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        let first = next_check_in(&mut events).await;
        let second = next_check_in(&mut events).await;

        assert_ne!(first.record.id, second.record.id);
        assert_eq!(store.records_for(&ada.id), 2);
        // Still inside the first confirmation's cooldown.
        assert!(session.banner().is_some());

        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_mid_cycle_silences_session() {
        let store = Arc::new(MemoryStore::new());
        store.seed("Ada", Some(signature(100.0, 100.0)));
        let config = SessionConfig {
            debounce: Duration::from_secs(30),
            ..fast_config()
        };
        let session = RecognitionSession::new(store.clone(), config);
        let mut events = session.subscribe();

        let (source, probe) = ScriptedSource::new();
        let detector = ScriptedDetector::new(|_| Ok(vec![face(100.0, 100.0)]))
            .with_latency(Duration::from_millis(20));
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        next_matching(&mut events, |e| match e {
            SessionEvent::FrameProcessed { .. } => Some(()),
            _ => None,
        })
        .await;
        session.stop().await.unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(probe.released(), 1);
        let served = probe.served();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.served(), served, "no frames requested after stop");
        assert_eq!(probe.released(), 1);
        assert_eq!(store.attendance_count(), 0, "pending attempt was cancelled");

        let mut after_stop = Vec::new();
        let mut stopped = false;
        while let Ok(event) = events.try_recv() {
            if stopped {
                after_stop.push(event);
            } else if let SessionEvent::Stopped { reason } = event {
                assert!(reason.is_none());
                stopped = true;
            }
        }
        assert!(stopped);
        assert!(after_stop.is_empty(), "events after stop: {after_stop:?}");
    }

    #[tokio::test]
    async fn test_source_failure_stops_session() {
        let store = Arc::new(MemoryStore::new());
        let session = RecognitionSession::new(store, fast_config());
        let mut events = session.subscribe();

        let (source, probe) = ScriptedSource::new();
        let source = source.failing_at(3);
        let detector = ScriptedDetector::new(|_| Ok(vec![]));
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        let reason = next_matching(&mut events, |e| match e {
            SessionEvent::Stopped { reason } => Some(reason),
            _ => None,
        })
        .await;
        assert!(reason.unwrap().contains("device unplugged"));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(probe.released(), 1);

        // The ended capture is reaped quietly.
        session.stop().await.unwrap();
        assert_eq!(probe.released(), 1);
    }

    #[tokio::test]
    async fn test_detector_failure_releases_source() {
        let store = Arc::new(MemoryStore::new());
        let session = RecognitionSession::new(store, fast_config());
        let mut events = session.subscribe();

        let (source, probe) = ScriptedSource::new();
        let err = session
            .start(Box::new(FakeResources::without_detector(source)))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Init(InitError::Detector(_))));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(probe.released(), 1);
        assert_eq!(probe.served(), 0);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::Stopped { reason: Some(_) })
        ));
        assert!(matches!(session.stop().await, Err(SessionError::NotRunning)));
    }

    #[tokio::test]
    async fn test_missing_source_fails_start() {
        let store = Arc::new(MemoryStore::new());
        let session = RecognitionSession::new(store, fast_config());
        let err = session
            .start(Box::new(FakeResources::without_source()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Init(InitError::FrameSource(_))));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_roster_failure_fails_start() {
        let store = Arc::new(MemoryStore::new());
        store.fail_reads(true);
        let session = RecognitionSession::new(store, fast_config());
        let (source, probe) = ScriptedSource::new();
        let detector = ScriptedDetector::new(|_| Ok(vec![]));

        let err = session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Roster(_)));
        assert_eq!(probe.released(), 0, "source never opened");
    }

    #[tokio::test]
    async fn test_detection_error_keeps_loop_running() {
        let store = Arc::new(MemoryStore::new());
        let session = RecognitionSession::new(store, fast_config());
        let mut events = session.subscribe();

        let (source, _probe) = ScriptedSource::new();
        let detector = ScriptedDetector::new(|seq| {
            if seq == 1 {
                Err("tensor shape mismatch".into())
            } else {
                Ok(vec![])
            }
        });
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        let failed = next_matching(&mut events, |e| match e {
            SessionEvent::DetectionFailed { sequence, .. } => Some(sequence),
            _ => None,
        })
        .await;
        assert_eq!(failed, 1);
        let later = next_matching(&mut events, |e| match e {
            SessionEvent::FrameProcessed { sequence, .. } if sequence > 1 => Some(sequence),
            _ => None,
        })
        .await;
        assert!(later >= 2);
        assert_eq!(session.state(), SessionState::Detecting);

        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let ada = store.seed("Ada", Some(signature(100.0, 100.0)));
        store.fail_writes(true);
        let session = RecognitionSession::new(store.clone(), fast_config());
        let mut events = session.subscribe();

        let (source, _probe) = ScriptedSource::new();
        let detector = ScriptedDetector::burst(face(100.0, 100.0), 0..2);
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        let member_id = next_matching(&mut events, |e| match e {
            SessionEvent::StoreFailed { member_id, .. } => Some(member_id),
            _ => None,
        })
        .await;
        assert_eq!(member_id, ada.id);
        assert_eq!(store.attendance_count(), 0);
        assert!(session.banner().is_none());

        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_policy_checks_in() {
        let store = Arc::new(MemoryStore::new());
        let ada = store.seed("Ada", Some(signature(120.0, 110.0)));
        let config = SessionConfig {
            policy: Arc::new(RawDifference::default()),
            ..fast_config()
        };
        let session = RecognitionSession::new(store.clone(), config);
        let mut events = session.subscribe();

        let (source, _probe) = ScriptedSource::new();
        let detector = ScriptedDetector::burst(face(100.0, 100.0), 0..2);
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        let confirmation = next_check_in(&mut events).await;
        assert_eq!(confirmation.member.id, ada.id);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_roster_skips_attempt() {
        let store = Arc::new(MemoryStore::new());
        let session = RecognitionSession::new(store.clone(), fast_config());
        let mut events = session.subscribe();

        let (source, _probe) = ScriptedSource::new();
        let detector = ScriptedDetector::burst(face(100.0, 100.0), 0..2);
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        // Well past the debounce window.
        tokio::time::sleep(Duration::from_millis(300)).await;
        session.stop().await.unwrap();

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(
                    event,
                    SessionEvent::NoMatch { .. } | SessionEvent::CheckedIn(_)
                ),
                "unexpected {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let store = Arc::new(MemoryStore::new());
        let session = RecognitionSession::new(store, fast_config());

        let (source, first) = ScriptedSource::new();
        let detector = ScriptedDetector::new(|_| Ok(vec![]));
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        let (source, _) = ScriptedSource::new();
        let detector = ScriptedDetector::new(|_| Ok(vec![]));
        let err = session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRunning));

        session.stop().await.unwrap();
        assert_eq!(first.released(), 1);

        let (source, second) = ScriptedSource::new();
        let detector = ScriptedDetector::new(|_| Ok(vec![]));
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Detecting);
        session.stop().await.unwrap();
        assert_eq!(second.released(), 1);
    }

    #[tokio::test]
    async fn test_latest_face_tracks_detections() {
        let store = Arc::new(MemoryStore::new());
        let session = RecognitionSession::new(store, fast_config());
        let mut events = session.subscribe();
        assert!(session.latest_face().is_none());

        let (source, _probe) = ScriptedSource::new();
        let detector = ScriptedDetector::new(|_| Ok(vec![face(120.0, 130.0)]));
        session
            .start(Box::new(FakeResources::new(source, detector)))
            .await
            .unwrap();

        next_matching(&mut events, |e| match e {
            SessionEvent::FrameProcessed { faces: 1, .. } => Some(()),
            _ => None,
        })
        .await;
        let seen = session.fresh_face(Duration::from_secs(5)).unwrap();
        assert_eq!(seen.bbox.width, 120.0);
        assert_eq!(seen.bbox.height, 130.0);

        session.stop().await.unwrap();
        assert!(session.latest_face().is_none());
    }
}
