//! Error types for the intercepting proxy

use std::io;
use thiserror::Error;

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying, minting certificates or
/// capturing traffic.
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// Certificate material could not be parsed, generated or signed
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS handshake or configuration error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP type construction error
  #[error("HTTP error: {0}")]
  Http(#[from] http::Error),

  /// Upstream round-trip error
  #[error("Upstream error: {0}")]
  Upstream(#[from] reqwest::Error),

  /// Malformed request on the wire
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Connecting to an origin failed
  #[error("Connection error: {0}")]
  Connection(String),

  /// The synthetic listener has been closed and drained
  #[error("Listener closed")]
  ListenerClosed,
}

impl Error {
  /// Create a certificate error and log it
  pub(crate) fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub(crate) fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub(crate) fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub(crate) fn connection(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::error!("{}", error);
    error
  }
}
