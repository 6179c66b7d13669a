//! Pipeline configuration
//!
//! Defaults reproduce the production limits. A YAML file may override any
//! subset of fields, and `MEDIA_SCAN_*` environment variables override the
//! most commonly tuned knobs on top of that.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

const MIB: u64 = 1024 * 1024;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root under which every round gets its own directory
    pub workspace_root: PathBuf,
    /// Maximum number of jobs running their CPU-side stages concurrently
    pub job_parallelism: usize,
    /// NSFW score cutoff (`score >= threshold` is flagged)
    pub policy_threshold: f32,
    /// Reported alongside every result
    pub engine_version: String,
    pub limits: LimitsConfig,
    pub fetch: FetchConfig,
    pub timeouts: TimeoutConfig,
    pub extraction: ExtractionConfig,
    pub dispatcher: DispatcherConfig,
    pub classifier: ClassifierConfig,
    pub tools: ToolConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/tmp/data"),
            job_parallelism: 4,
            policy_threshold: 0.5,
            engine_version: "scan-engine-v1".to_string(),
            limits: LimitsConfig::default(),
            fetch: FetchConfig::default(),
            timeouts: TimeoutConfig::default(),
            extraction: ExtractionConfig::default(),
            dispatcher: DispatcherConfig::default(),
            classifier: ClassifierConfig::default(),
            tools: ToolConfig::default(),
        }
    }
}

/// Intake and media policy limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_image_bytes: u64,
    pub max_video_bytes: u64,
    pub max_video_duration_secs: f64,
    pub max_image_jobs: usize,
    pub max_video_jobs: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 10 * MIB,
            max_video_bytes: 100 * MIB,
            max_video_duration_secs: 5.0 * 60.0,
            max_image_jobs: 40,
            max_video_jobs: 10,
        }
    }
}

/// HTTP download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub connect_timeout_secs: u64,
    /// Idle timeout between body chunks
    pub read_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            read_timeout_secs: 10,
            user_agent: concat!("media-scan/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Per-stage and batch-wide deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub download_secs: u64,
    pub probe_secs: u64,
    pub extraction_secs: u64,
    pub scan_secs: u64,
    pub batch_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            download_secs: 120,
            probe_secs: 30,
            extraction_secs: 300,
            scan_secs: 600,
            batch_secs: 1800,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    #[must_use]
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    #[must_use]
    pub fn extraction(&self) -> Duration {
        Duration::from_secs(self.extraction_secs)
    }

    #[must_use]
    pub fn scan(&self) -> Duration {
        Duration::from_secs(self.scan_secs)
    }

    #[must_use]
    pub fn batch(&self) -> Duration {
        Duration::from_secs(self.batch_secs)
    }
}

/// Frame extraction settings, one block per strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// JPEG quality passed to the encoder (`-q:v`, 2-31, lower is better)
    pub jpeg_quality: u32,
    /// Hard ceiling on frames any single strategy may contribute
    pub max_frames_per_strategy: usize,
    pub scene: SceneStrategyConfig,
    pub uniform: UniformStrategyConfig,
    pub luma: LumaStrategyConfig,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 3,
            max_frames_per_strategy: 250,
            scene: SceneStrategyConfig::default(),
            uniform: UniformStrategyConfig::default(),
            luma: LumaStrategyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneStrategyConfig {
    pub enabled: bool,
    /// Scene score threshold (0.0-1.0)
    pub threshold: f64,
    /// Only every n-th decoded frame is eligible
    pub frame_stride: u32,
}

impl Default for SceneStrategyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.4,
            frame_stride: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UniformStrategyConfig {
    pub enabled: bool,
    pub fps: f64,
    pub scale_width: u32,
    pub max_frames: usize,
}

impl Default for UniformStrategyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fps: 0.6667,
            scale_width: 320,
            max_frames: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LumaStrategyConfig {
    pub enabled: bool,
    /// Mean absolute 8-bit luma difference that counts as a spike
    pub diff_threshold: f64,
    pub sample_interval_secs: f64,
    pub suppression_window_secs: f64,
    pub max_frames: usize,
    /// Concurrent single-frame extractions
    pub concurrency: usize,
    pub scale_width: u32,
    /// Resolution of the grayscale analysis stream
    pub analysis_width: u32,
    pub analysis_height: u32,
}

impl Default for LumaStrategyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            diff_threshold: 15.0,
            sample_interval_secs: 0.1,
            suppression_window_secs: 1.0,
            max_frames: 30,
            concurrency: 4,
            scale_width: 320,
            analysis_width: 64,
            analysis_height: 36,
        }
    }
}

/// Scan dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_batch_size: usize,
    pub max_in_flight: usize,
    /// How long a partial batch waits for more units before being sent
    pub linger_ms: u64,
    pub queue_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_in_flight: 2,
            linger_ms: 20,
            queue_capacity: 256,
            retry: RetryConfig::default(),
        }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

/// Bounded retry budget for transient classifier failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 250,
            multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

/// Remote classification endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub endpoint: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

impl ClassifierConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(60))
    }
}

/// External binaries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file; missing fields keep their defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        Ok(config)
    }

    /// Apply `MEDIA_SCAN_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MEDIA_SCAN_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("MEDIA_SCAN_JOB_PARALLELISM") {
            self.job_parallelism = parse_env("MEDIA_SCAN_JOB_PARALLELISM", &value)?;
        }
        if let Some(value) = lookup("MEDIA_SCAN_POLICY_THRESHOLD") {
            self.policy_threshold = parse_env("MEDIA_SCAN_POLICY_THRESHOLD", &value)?;
        }
        if let Some(value) = lookup("MEDIA_SCAN_CLASSIFIER_URL") {
            self.classifier.endpoint = Some(value);
        }
        if let Some(value) = lookup("MEDIA_SCAN_MAX_BATCH_SIZE") {
            self.dispatcher.max_batch_size = parse_env("MEDIA_SCAN_MAX_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("MEDIA_SCAN_MAX_IN_FLIGHT") {
            self.dispatcher.max_in_flight = parse_env("MEDIA_SCAN_MAX_IN_FLIGHT", &value)?;
        }
        if let Some(value) = lookup("MEDIA_SCAN_MAX_RETRIES") {
            self.dispatcher.retry.max_retries = parse_env("MEDIA_SCAN_MAX_RETRIES", &value)?;
        }
        if let Some(value) = lookup("MEDIA_SCAN_FFMPEG") {
            self.tools.ffmpeg = PathBuf::from(value);
        }
        if let Some(value) = lookup("MEDIA_SCAN_FFPROBE") {
            self.tools.ffprobe = PathBuf::from(value);
        }
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_parallelism == 0 {
            return Err(ConfigError::Invalid("job_parallelism must be > 0".into()));
        }
        if self.dispatcher.max_batch_size == 0 || self.dispatcher.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher batch size and in-flight count must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.policy_threshold) {
            return Err(ConfigError::Invalid(format!(
                "policy_threshold must be within [0, 1], got {}",
                self.policy_threshold
            )));
        }
        if self.extraction.uniform.enabled && self.extraction.uniform.fps <= 0.0 {
            return Err(ConfigError::Invalid("uniform fps must be > 0".into()));
        }
        if self.extraction.luma.enabled && self.extraction.luma.sample_interval_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "luma sample interval must be > 0".into(),
            ));
        }
        debug!("Configuration validated");
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
