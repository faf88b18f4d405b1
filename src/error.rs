use std::io;

use thiserror::Error;

use crate::http::ParseError;

/// Central error type for the proxy engine.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error while parsing an HTTP message.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Name resolution failed outright (distinct from an empty answer).
    #[error("name resolution failed: {0}")]
    Resolver(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
