use thiserror::Error;

#[derive(Error, Debug)]
pub enum CinderError {
    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} channel is full")]
    ChannelFull(&'static str),

    #[error("{0} channel is closed")]
    ChannelClosed(&'static str),

    #[error("async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type alias for cinder operations
pub type Result<T> = std::result::Result<T, CinderError>;

impl CinderError {
    /// Creates a new parse error
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::ChannelFull(_) | Self::Network(_))
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Config(_) => "config",
            Self::Network(_) => "network",
            Self::Io(_) => "io",
            Self::ChannelFull(_) | Self::ChannelClosed(_) => "channel",
            Self::Join(_) => "async",
        }
    }
}
