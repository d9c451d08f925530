//! Error types for the routing runtime

use std::io;
use thiserror::Error;

/// Runtime error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Start error: {0}")]
    Start(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("response rejected{}", if *.cached { " (cached)" } else { "" })]
    ResponseRejected { cached: bool },

    #[error("already closed")]
    AlreadyClosed,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn start<S: Into<String>>(msg: S) -> Self {
        Error::Start(msg.into())
    }

    pub fn dns<S: Into<String>>(msg: S) -> Self {
        Error::Dns(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether a DNS rule walk may continue past this error.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::ResponseRejected { .. })
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<hickory_proto::error::ProtoError> for Error {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        Error::Dns(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::config("bad port");
        assert_eq!(e.to_string(), "Configuration error: bad port");
    }

    #[test]
    fn test_rejected_variants() {
        assert!(Error::ResponseRejected { cached: true }.is_rejected());
        assert!(Error::ResponseRejected { cached: false }.is_rejected());
        assert!(!Error::AlreadyClosed.is_rejected());
        assert_eq!(
            Error::ResponseRejected { cached: true }.to_string(),
            "response rejected (cached)"
        );
    }
}
