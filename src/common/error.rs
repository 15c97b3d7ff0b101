//! Error types for the relay

use std::io;
use thiserror::Error;

/// Relay error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Entropy source failure: {0}")]
    Entropy(String),

    #[error("Unable to access underlying connection from client: {0}")]
    Hijack(String),

    #[error("No fallback configured")]
    NoFallback,

    #[error("Shutting down")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn fetch<S: Into<String>>(msg: S) -> Self {
        Error::Fetch(msg.into())
    }

    pub fn certificate<S: Into<String>>(msg: S) -> Self {
        Error::Certificate(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn entropy<S: Into<String>>(msg: S) -> Self {
        Error::Entropy(msg.into())
    }

    pub fn hijack<S: Into<String>>(msg: S) -> Self {
        Error::Hijack(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Fetch(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<rand::Error> for Error {
    fn from(e: rand::Error) -> Self {
        Error::Entropy(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::config("test error");
        assert!(matches!(e, Error::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::certificate("No PEM encoded certificate found");
        assert_eq!(
            e.to_string(),
            "Certificate error: No PEM encoded certificate found"
        );
        assert_eq!(Error::NoFallback.to_string(), "No fallback configured");
    }

    #[test]
    fn test_hijack_message() {
        let e = Error::hijack("connection does not support takeover");
        assert_eq!(
            e.to_string(),
            "Unable to access underlying connection from client: connection does not support takeover"
        );
    }
}
