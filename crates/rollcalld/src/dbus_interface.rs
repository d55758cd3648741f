use crate::config::Config;
use crate::engine::DaemonResources;
use rollcall_core::{
    MemberStore, NewMember, RecognitionMetrics, RecognitionSession, SessionError, SessionEvent,
    StoreError,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "io.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/io/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: io.rollcall.Attendance1
/// Object path: /io/rollcall/Attendance1
///
/// Structured results are returned as JSON strings.
pub struct AttendanceService {
    session: Arc<RecognitionSession>,
    store: Arc<dyn MemberStore>,
    config: Arc<Config>,
}

impl AttendanceService {
    pub fn new(
        session: Arc<RecognitionSession>,
        store: Arc<dyn MemberStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            session,
            store,
            config,
        }
    }

    async fn refresh_roster(&self) {
        if let Err(e) = self.session.refresh_roster().await {
            tracing::warn!(error = %e, "roster refresh failed; new signature applies after next refresh");
        }
    }
}

#[interface(name = "io.rollcall.Attendance1")]
impl AttendanceService {
    /// Open the camera and start recognizing.
    async fn start(&self) -> fdo::Result<()> {
        tracing::info!("start requested");
        let resources = DaemonResources::new(&self.config);
        self.session
            .start(Box::new(resources))
            .await
            .map_err(session_error)
    }

    /// Stop recognizing and release the camera.
    async fn stop(&self) -> fdo::Result<()> {
        tracing::info!("stop requested");
        self.session.stop().await.map_err(session_error)
    }

    async fn status(&self) -> fdo::Result<String> {
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "state": self.session.state(),
            "camera": self.config.camera_device,
            "policy": self.session.config().policy.name(),
            "normalization": self.config.normalization.as_str(),
            "members": self.session.roster().len(),
            "banner": self.session.banner(),
        }))
    }

    async fn list_members(&self) -> fdo::Result<String> {
        let members = self.store.list_members().await.map_err(store_error)?;
        to_json(&members)
    }

    /// Register a member from the face most recently seen by the running
    /// session. An empty `email` means none.
    async fn register(&self, name: &str, email: &str) -> fdo::Result<String> {
        tracing::info!(name, "register requested");
        let face = self
            .session
            .fresh_face(self.config.capture_max_age)
            .ok_or_else(no_recent_face)?;
        let email = Some(email.to_string()).filter(|e| !e.trim().is_empty());
        let member = self
            .store
            .create_member(NewMember::new(name, email, face.signature()))
            .await
            .map_err(store_error)?;
        self.refresh_roster().await;
        to_json(&member)
    }

    /// Replace a member's stored signature with the latest detected face.
    async fn recapture(&self, member_id: &str) -> fdo::Result<String> {
        tracing::info!(member_id, "recapture requested");
        let face = self
            .session
            .fresh_face(self.config.capture_max_age)
            .ok_or_else(no_recent_face)?;
        let member = self
            .store
            .update_face_signature(member_id, face.signature())
            .await
            .map_err(store_error)?;
        self.refresh_roster().await;
        to_json(&member)
    }

    async fn recent_attendance(&self, limit: u32) -> fdo::Result<String> {
        let records = self
            .store
            .recent_attendance(limit as usize)
            .await
            .map_err(store_error)?;
        to_json(&records)
    }

    async fn member_attendance(&self, member_id: &str) -> fdo::Result<String> {
        let records = self
            .store
            .member_attendance(member_id)
            .await
            .map_err(store_error)?;
        to_json(&records)
    }

    /// Check-ins during the current local calendar day.
    async fn daily_count(&self) -> fdo::Result<u64> {
        self.store
            .daily_attendance_count()
            .await
            .map_err(store_error)
    }

    async fn metrics(&self) -> fdo::Result<String> {
        let metrics = RecognitionMetrics::gather(self.store.as_ref())
            .await
            .map_err(store_error)?;
        to_json(&metrics)
    }

    /// A member was recognized and their attendance recorded.
    #[zbus(signal)]
    async fn checked_in(
        emitter: &SignalEmitter<'_>,
        member_id: &str,
        name: &str,
        score: f64,
        check_in_time: &str,
    ) -> zbus::Result<()>;

    /// A face was evaluated without an accepted match. `best_score` is zero
    /// when no member had a positive score.
    #[zbus(signal)]
    async fn no_match(emitter: &SignalEmitter<'_>, best_score: f64) -> zbus::Result<()>;
}

/// Re-emit session events as D-Bus signals until the session goes away.
pub async fn forward_signals(
    emitter: SignalEmitter<'static>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        let sent = match events.recv().await {
            Ok(SessionEvent::CheckedIn(c)) => {
                AttendanceService::checked_in(
                    &emitter,
                    &c.member.id,
                    &c.member.name,
                    c.score as f64,
                    &c.record.check_in_time.to_rfc3339(),
                )
                .await
            }
            Ok(SessionEvent::NoMatch { best_score }) => {
                AttendanceService::no_match(&emitter, best_score.unwrap_or(0.0) as f64).await
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "signal forwarder lagged behind session events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to emit D-Bus signal");
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn no_recent_face() -> fdo::Error {
    fdo::Error::Failed("no face detected recently; start the session and face the camera".into())
}

fn store_error(e: StoreError) -> fdo::Error {
    match e {
        StoreError::Invalid(e) => fdo::Error::InvalidArgs(e.to_string()),
        StoreError::MemberNotFound(_) => fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::error!(error = %other, "store call failed");
            fdo::Error::Failed(other.to_string())
        }
    }
}

fn session_error(e: SessionError) -> fdo::Error {
    tracing::warn!(error = %e, "session command failed");
    fdo::Error::Failed(e.to_string())
}
