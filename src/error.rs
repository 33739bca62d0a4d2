use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Rejection of a user-submitted custom config.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("config is not a valid JSON object: {0}")]
    InvalidFormat(String),

    #[error("config is already stored")]
    Duplicate,

    #[error("failed to persist custom configs: {0}")]
    Storage(#[from] AppError),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("candidate list request returned HTTP {0}")]
    Http(reqwest::StatusCode),

    #[error("candidate list response body is empty")]
    Empty,

    #[error("candidate list request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("no candidate list URL configured")]
    NotConfigured,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("proxy engine binary missing or not executable: {}", .0.display())]
    BinaryMissing(PathBuf),

    #[error("proxy engine is already running")]
    AlreadyRunning,

    #[error("failed to write engine config {}: {source}", .path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start proxy engine: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Error)]
#[error("local port {port} did not open within {}ms", .waited.as_millis())]
pub struct ReadinessTimeout {
    pub port: u16,
    pub waited: Duration,
}

/// Why a single candidate was rejected. Never terminal for a run.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    NotReady(#[from] ReadinessTimeout),

    #[error("connectivity check through the local proxy failed")]
    CheckFailed,
}

/// Terminal outcome of a connection run, surfaced as the public error message.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("cannot start proxy engine: {0}")]
    EngineUnavailable(#[source] LaunchError),

    #[error("no responsive servers")]
    NoResponsiveServers,

    #[error("all {0} candidate servers failed")]
    Exhausted(usize),
}
