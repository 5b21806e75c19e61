use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, Local, Offset};
use rollcall_core::{AnalyzerConfig, AttendanceWindow, MatchPolicy, ScannerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Camera used when a caller passes an empty camera id.
    pub default_camera: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Frames discarded after opening a camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    pub embedding_dim: usize,
    pub accept_threshold: f32,
    pub ambiguity_margin: f32,
    pub quality_floor: f32,
    pub max_faces_per_frame: usize,
    pub frame_interval_ms: u64,
    pub acquire_timeout_ms: u64,
    pub release_timeout_ms: u64,
    pub max_capture_failures: u32,
    /// Attendance window length; 24 means one window per calendar day.
    pub window_hours: u32,
    /// Offset used for calendar days. Host local offset when unset.
    pub utc_offset_minutes: Option<i32>,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        let analyzer = AnalyzerConfig::default();
        let policy = MatchPolicy::default();
        let scanner = ScannerConfig::default();
        Self {
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("attendance.db"),
            default_camera: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            warmup_frames: 4,
            embedding_dim: 512,
            accept_threshold: policy.accept_threshold,
            ambiguity_margin: policy.ambiguity_margin,
            quality_floor: analyzer.quality_floor,
            max_faces_per_frame: analyzer.max_faces_per_frame,
            frame_interval_ms: scanner.frame_interval.as_millis() as u64,
            acquire_timeout_ms: scanner.acquire_timeout.as_millis() as u64,
            release_timeout_ms: scanner.release_timeout.as_millis() as u64,
            max_capture_failures: scanner.max_capture_failures,
            window_hours: 24,
            utc_offset_minutes: None,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load `ROLLCALL_CONFIG` (or the default path, if present), apply
    /// environment overrides, and validate.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(default_config_path);

        let mut config = if path.exists() {
            tracing::info!(path = %path.display(), "loading config file");
            Self::from_file(&path)?
        } else if let Some(path) = explicit {
            bail!("config file {} does not exist", path.display());
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply `ROLLCALL_*` overrides from `var`. Unparseable values keep the current setting.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DEFAULT_CAMERA") {
            self.default_camera = v;
        }

        self.frame_width = env_or(&var, "ROLLCALL_FRAME_WIDTH", self.frame_width);
        self.frame_height = env_or(&var, "ROLLCALL_FRAME_HEIGHT", self.frame_height);
        self.warmup_frames = env_or(&var, "ROLLCALL_WARMUP_FRAMES", self.warmup_frames);
        self.embedding_dim = env_or(&var, "ROLLCALL_EMBEDDING_DIM", self.embedding_dim);
        self.accept_threshold = env_or(&var, "ROLLCALL_ACCEPT_THRESHOLD", self.accept_threshold);
        self.ambiguity_margin = env_or(&var, "ROLLCALL_AMBIGUITY_MARGIN", self.ambiguity_margin);
        self.quality_floor = env_or(&var, "ROLLCALL_QUALITY_FLOOR", self.quality_floor);
        self.max_faces_per_frame =
            env_or(&var, "ROLLCALL_MAX_FACES_PER_FRAME", self.max_faces_per_frame);
        self.frame_interval_ms = env_or(&var, "ROLLCALL_FRAME_INTERVAL_MS", self.frame_interval_ms);
        self.acquire_timeout_ms =
            env_or(&var, "ROLLCALL_ACQUIRE_TIMEOUT_MS", self.acquire_timeout_ms);
        self.release_timeout_ms =
            env_or(&var, "ROLLCALL_RELEASE_TIMEOUT_MS", self.release_timeout_ms);
        self.max_capture_failures =
            env_or(&var, "ROLLCALL_MAX_CAPTURE_FAILURES", self.max_capture_failures);
        self.window_hours = env_or(&var, "ROLLCALL_WINDOW_HOURS", self.window_hours);
        if let Some(minutes) = var("ROLLCALL_UTC_OFFSET_MINUTES").and_then(|v| v.parse().ok()) {
            self.utc_offset_minutes = Some(minutes);
        }
        if let Some(v) = var("ROLLCALL_SESSION_BUS") {
            self.session_bus = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.accept_threshold) {
            bail!("accept_threshold must be in [-1, 1], got {}", self.accept_threshold);
        }
        if !(0.0..=2.0).contains(&self.ambiguity_margin) {
            bail!("ambiguity_margin must be in [0, 2], got {}", self.ambiguity_margin);
        }
        if !(0.0..=1.0).contains(&self.quality_floor) {
            bail!("quality_floor must be in [0, 1], got {}", self.quality_floor);
        }
        if self.max_faces_per_frame == 0 {
            bail!("max_faces_per_frame must be at least 1");
        }
        if self.embedding_dim == 0 {
            bail!("embedding_dim must be at least 1");
        }
        if self.max_capture_failures == 0 {
            bail!("max_capture_failures must be at least 1");
        }
        self.attendance_window()?;
        Ok(())
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            quality_floor: self.quality_floor,
            max_faces_per_frame: self.max_faces_per_frame,
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            accept_threshold: self.accept_threshold,
            ambiguity_margin: self.ambiguity_margin,
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            release_timeout: Duration::from_millis(self.release_timeout_ms),
            max_capture_failures: self.max_capture_failures,
        }
    }

    pub fn attendance_window(&self) -> Result<AttendanceWindow> {
        let offset = match self.utc_offset_minutes {
            Some(minutes) => FixedOffset::east_opt(minutes * 60)
                .with_context(|| format!("utc_offset_minutes out of range: {minutes}"))?,
            None => Local::now().offset().fix(),
        };
        Ok(AttendanceWindow::new(offset, self.window_hours)?)
    }
}

fn env_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            default
        }),
        None => default,
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("rollcall/rollcalld.toml")
}
