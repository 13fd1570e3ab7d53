use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("peer configuration error: {0}")]
    PeerConfig(#[from] serde_yaml::Error),

    /// The optimistic write loop never observed a stable read.
    #[error("write conflict on {soul} persisted after {attempts} attempts")]
    Conflict { soul: String, attempts: u32 },

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("adapter does not support {0}")]
    Unsupported(&'static str),

    #[error("peer {url} answered {status}")]
    Remote { status: u16, url: String },

    #[error("feed closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
