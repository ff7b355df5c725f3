use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Camera/stream identifier recorded with sessions.
    pub camera_id: String,
    /// Maximum cosine distance for a positive match.
    pub match_threshold: f32,
    /// Minimum distance gap to the second-nearest identity.
    pub match_margin: f32,
    /// Positive matches required before attendance is confirmed (N).
    pub confirm_matches: u32,
    /// Confirmation window in milliseconds (W).
    pub confirm_window_ms: u64,
    /// Process every Kth frame.
    pub sample_every: u64,
    /// Whether to resume an unfinished session left by a crash.
    pub resume_open_session: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            model_dir,
            db_path,
            camera_id: std::env::var("ROLLCALL_CAMERA_ID")
                .unwrap_or_else(|_| "default".to_string()),
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", 0.35),
            match_margin: env_f32("ROLLCALL_MATCH_MARGIN", 0.10),
            confirm_matches: env_u32("ROLLCALL_CONFIRM_MATCHES", 3),
            confirm_window_ms: env_u64("ROLLCALL_CONFIRM_WINDOW_MS", 2000),
            sample_every: env_u64("ROLLCALL_SAMPLE_EVERY", 3).max(1),
            resume_open_session: std::env::var("ROLLCALL_RESUME_OPEN_SESSION")
                .map(|v| v != "0")
                .unwrap_or(true),
        }
    }

    /// Path to the UltraFace detection model.
    pub fn locator_model_path(&self) -> String {
        self.model_dir
            .join("version-RFB-320.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the embedding model.
    pub fn extractor_model_path(&self) -> String {
        self.model_dir
            .join("w600k_mbf.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
