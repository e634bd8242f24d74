/// Shared error type used across all flightdeck crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("broker: {0}")]
    Broker(String),

    #[error("database: {0}")]
    Database(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is worth retrying: connection drops, timeouts
    /// and transient broker/database/provider hiccups. Policy violations
    /// and parse errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) | Error::Timeout(_) => true,
            Error::Http(m) | Error::Broker(m) | Error::Database(m) => {
                let m = m.to_ascii_lowercase();
                m.contains("connection")
                    || m.contains("timeout")
                    || m.contains("timed out")
                    || m.contains("unavailable")
                    || m.contains("reset")
                    || m.contains("broken pipe")
            }
            Error::Provider { message, .. } => {
                let m = message.to_ascii_lowercase();
                m.contains("overloaded")
                    || m.contains("rate limit")
                    || m.contains("429")
                    || m.contains("timeout")
                    || m.contains("capacity")
                    || m.contains("connection")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
