//! Configuration
//!
//! 設定ファイル・環境変数からの設定読み込み

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::{
    ComplianceConfig, EngineSettings, LogFormat, LoggingConfig, PolicySourceConfig,
    RetrySettings, RotationStrategy,
};
