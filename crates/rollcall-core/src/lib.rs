//! rollcall-core: Face-based attendance recognition engine.
//!
//! Turns a stream of detected faces into confirmed attendance records:
//! geometric signature comparison, roster matching behind a pluggable
//! policy, trailing-edge debounce, and the recognition session that ties
//! a frame source and detector to a member store.

pub mod comparator;
pub mod debounce;
pub mod detector;
pub mod matcher;
pub mod metrics;
pub mod recorder;
pub mod session;
pub mod source;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use comparator::{compare, Normalization};
pub use detector::{Detector, DetectorError, ScrfdDetector};
pub use matcher::{
    find_best_match, Decision, MatchPolicy, NormalizedThreshold, RawDifference,
};
pub use metrics::RecognitionMetrics;
pub use recorder::AttendanceRecorder;
pub use session::{
    CaptureResources, Confirmation, InitError, RecognitionSession, SeenFace, SessionConfig,
    SessionError, SessionEvent, SessionState,
};
pub use source::{Frame, FrameSource, SourceError};
pub use store::{MemberStore, StoreError};
pub use types::{
    AttendanceRecord, DetectedFace, FaceBox, FaceSignature, MatchResult, Member, MemberStatus,
    NewMember, ValidationError,
};

/// Default directory for detection model files.
///
/// Checks `$XDG_DATA_HOME/rollcall/models`, then `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
