use std::path::PathBuf;

use thiserror::Error;

/// Why a subscription could not be turned into a proxy list.
///
/// The first four variants come from the fetch step, the rest from the parser.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription url is empty")]
    EmptyUrl,
    #[error("subscription request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("server answered with HTTP {0}")]
    Http(u16),
    #[error("unsupported subscription format")]
    UnsupportedFormat,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("subscription contains no proxies")]
    NoProxiesFound,
}

impl SubscriptionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyUrl => "EMPTY_URL",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::Http(_) => "HTTP_ERROR",
            Self::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            Self::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Self::NoProxiesFound => "NO_PROXIES_FOUND",
        }
    }

    pub fn is_fetch_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyUrl | Self::Timeout | Self::ConnectionFailed(_) | Self::Http(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("binary not found: {}", .0.display())]
    MissingBinary(PathBuf),
    #[error("config not found: {}", .0.display())]
    MissingConfig(PathBuf),
    #[error("failed to spawn {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("log file error: {0}")]
    Log(#[source] std::io::Error),
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingBinary(_) => "BINARY_MISSING",
            Self::MissingConfig(_) => "CONFIG_MISSING",
            Self::Spawn { .. } => "START_FAILED",
            Self::Log(_) => "LOG_ERROR",
        }
    }
}

/// Failure writing one of the synthesized artifacts or the persisted state.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml encoding failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArtifactError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "WRITE_FAILED",
            Self::Yaml(_) | Self::Json(_) => "ENCODE_FAILED",
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file: {0}")]
    Toml(#[from] toml::de::Error),
}
