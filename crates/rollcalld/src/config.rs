use rollcall_core::policy::{
    DEFAULT_EMBEDDING_MAX_DISTANCE, DEFAULT_HISTOGRAM_MAX_DISTANCE, DEFAULT_PROBABILITY_MIN,
};
use rollcall_core::{ConfidencePolicy, SCRFD_MODEL_FILE};
use std::path::PathBuf;
use std::str::FromStr;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory holding the detector model and the trained artifact bundle.
    pub model_dir: PathBuf,
    /// SQLite database file. `None` keeps marks in memory only.
    pub db_path: Option<PathBuf>,
    /// Accept/reject thresholds per recognition variant.
    ///
    /// `ROLLCALL_EMBEDDING_MAX_DISTANCE` defaults to 0.50, which suits 128-d
    /// encodings. Galleries of ArcFace embeddings need roughly 1.0 to 1.1.
    pub policy: ConfidencePolicy,
    /// Faces smaller than this many pixels on either side are ignored.
    pub min_face_size: u32,
    /// Flip frames horizontally before processing (selfie view).
    pub mirror: bool,
    /// Depth of the per-session viewer channel.
    pub frame_buffer: usize,
    /// Frames discarded after the camera opens (auto exposure settling).
    pub warmup_frames: usize,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));

        // An empty value selects the in-memory ledger.
        let db_path = match var("ROLLCALL_DB_PATH") {
            Some(v) if v.is_empty() => None,
            Some(v) => Some(PathBuf::from(v)),
            None => Some(data_dir.join("attendance.db")),
        };

        Self {
            camera_device: var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir,
            db_path,
            policy: ConfidencePolicy {
                histogram_max_distance: parsed(&var, "ROLLCALL_HISTOGRAM_MAX_DISTANCE")
                    .unwrap_or(DEFAULT_HISTOGRAM_MAX_DISTANCE),
                embedding_max_distance: parsed(&var, "ROLLCALL_EMBEDDING_MAX_DISTANCE")
                    .unwrap_or(DEFAULT_EMBEDDING_MAX_DISTANCE),
                probability_min: parsed(&var, "ROLLCALL_PROBABILITY_MIN")
                    .unwrap_or(DEFAULT_PROBABILITY_MIN),
            },
            min_face_size: parsed(&var, "ROLLCALL_MIN_FACE_SIZE").unwrap_or(80),
            mirror: var("ROLLCALL_MIRROR").map(|v| v != "0").unwrap_or(true),
            frame_buffer: parsed::<usize>(&var, "ROLLCALL_FRAME_BUFFER").unwrap_or(2).max(1),
            warmup_frames: parsed(&var, "ROLLCALL_WARMUP_FRAMES").unwrap_or(0),
            session_bus: var("ROLLCALL_SESSION_BUS").is_some_and(|v| v == "1"),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.parse().ok())
}
