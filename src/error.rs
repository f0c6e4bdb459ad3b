//! Error types shared by the directory, the pollers and the connection manager.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// mDNS daemon, publish or browse failure
    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The directory answered with a non-success status
    #[error("directory returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Failure reported by a negotiation engine (ICE, media, data channel)
    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<mdns_sd::Error> for Error {
    fn from(err: mdns_sd::Error) -> Self {
        Error::Discovery(err.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::Negotiation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
