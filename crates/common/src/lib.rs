//! Common types, errors and configuration for the media scan pipeline

pub mod config;
pub mod error;
pub mod request;
pub mod types;

pub use config::{
    ClassifierConfig, ConfigError, DispatcherConfig, ExtractionConfig, FetchConfig, LimitsConfig,
    LumaStrategyConfig, PipelineConfig, RetryConfig, SceneStrategyConfig, TimeoutConfig,
    ToolConfig, UniformStrategyConfig,
};
pub use error::{ErrorInfo, ErrorKind, PipelineError, Result, Stage};
pub use request::{BatchRequest, JobSpec};
pub use types::*;
