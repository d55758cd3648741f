use rollcall_core::debounce::{DEFAULT_COOLDOWN, DEFAULT_DEBOUNCE};
use rollcall_core::detector::DEFAULT_MIN_CONFIDENCE;
use rollcall_core::matcher::{DEFAULT_MAX_DIFFERENCE, DEFAULT_SCORE_THRESHOLD};
use rollcall_core::{MatchPolicy, Normalization, NormalizedThreshold, RawDifference, SessionConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Database path that selects an in-memory store.
pub const IN_MEMORY_DB: &str = ":memory:";

/// Which matching policy the session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Normalized,
    RawDifference,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Frames discarded after opening the camera.
    pub warmup_frames: usize,
    /// Directory containing the SCRFD model.
    pub model_dir: PathBuf,
    /// SQLite database file, or `:memory:`.
    pub db_path: PathBuf,
    pub policy: PolicyKind,
    pub score_threshold: f32,
    pub max_difference: f32,
    pub normalization: Normalization,
    pub min_confidence: f32,
    pub debounce: Duration,
    pub cooldown: Duration,
    pub frame_interval: Duration,
    /// Zero disables the timeout.
    pub store_timeout: Option<Duration>,
    pub recent_limit: usize,
    /// How old the latest face may be when registering from it.
    pub capture_max_age: Duration,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let model_dir = parse("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(rollcall_core::default_model_dir);

        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = parse("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("attendance.db"));

        let policy = match parse("ROLLCALL_MATCH_POLICY").as_deref() {
            Some("raw-difference") | Some("raw") | Some("legacy") => PolicyKind::RawDifference,
            Some("normalized") | None => PolicyKind::Normalized,
            Some(other) => {
                tracing::warn!(value = other, "unknown ROLLCALL_MATCH_POLICY; using normalized");
                PolicyKind::Normalized
            }
        };

        let normalization = parse("ROLLCALL_NORMALIZATION")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        let num = |key: &str| parse(key).and_then(|v| v.parse::<f64>().ok());
        let f32_or = |key: &str, default: f32| {
            num(key)
                .map(|v| v as f32)
                .filter(|v| v.is_finite())
                .unwrap_or(default)
        };
        let u64_or = |key: &str, default: u64| parse(key).and_then(|v| v.parse().ok()).unwrap_or(default);
        let ms_or = |key: &str, default: Duration| {
            parse(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let store_timeout = ms_or("ROLLCALL_STORE_TIMEOUT_MS", Duration::ZERO);

        Self {
            camera_device: parse("ROLLCALL_CAMERA_DEVICE")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "/dev/video0".to_string()),
            camera_width: u64_or("ROLLCALL_CAMERA_WIDTH", 640) as u32,
            camera_height: u64_or("ROLLCALL_CAMERA_HEIGHT", 480) as u32,
            warmup_frames: u64_or("ROLLCALL_WARMUP_FRAMES", 4) as usize,
            model_dir,
            db_path,
            policy,
            score_threshold: f32_or("ROLLCALL_SCORE_THRESHOLD", DEFAULT_SCORE_THRESHOLD),
            max_difference: f32_or("ROLLCALL_MAX_DIFFERENCE", DEFAULT_MAX_DIFFERENCE),
            normalization,
            min_confidence: f32_or("ROLLCALL_MIN_CONFIDENCE", DEFAULT_MIN_CONFIDENCE),
            debounce: ms_or("ROLLCALL_DEBOUNCE_MS", DEFAULT_DEBOUNCE),
            cooldown: ms_or("ROLLCALL_COOLDOWN_MS", DEFAULT_COOLDOWN),
            frame_interval: ms_or("ROLLCALL_FRAME_INTERVAL_MS", Duration::from_millis(33)),
            store_timeout: (!store_timeout.is_zero()).then_some(store_timeout),
            recent_limit: u64_or("ROLLCALL_RECENT_LIMIT", 10) as usize,
            capture_max_age: ms_or("ROLLCALL_CAPTURE_MAX_AGE_MS", Duration::from_millis(2000)),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn in_memory_db(&self) -> bool {
        self.db_path.as_os_str() == IN_MEMORY_DB
    }

    pub fn match_policy(&self) -> Arc<dyn MatchPolicy> {
        match self.policy {
            PolicyKind::Normalized => Arc::new(NormalizedThreshold {
                threshold: self.score_threshold,
                normalization: self.normalization,
            }),
            PolicyKind::RawDifference => Arc::new(RawDifference {
                max_difference: self.max_difference,
            }),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            policy: self.match_policy(),
            debounce: self.debounce,
            cooldown: self.cooldown,
            frame_interval: self.frame_interval,
            recent_limit: self.recent_limit,
            store_timeout: self.store_timeout,
        }
    }
}
