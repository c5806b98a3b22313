use thiserror::Error;

/// Errors raised while reading or writing the device property tree.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropertyError {
  #[error("property tree path {0} does not exist")]
  PathNotFound(String),
  #[error("property {path} has no value yet")]
  Unset { path: String },
  #[error("property {path} holds {found}, expected {expected}")]
  TypeMismatch { path: String, expected: &'static str, found: &'static str },
  #[error("cannot parse property {path} value {value:?}")]
  Parse { path: String, value: String },
  #[error("invalid property tree document: {0}")]
  Document(String),
}

/// Setup failures of a receive streamer. Always raised before any sample is received.
#[derive(Error, Debug)]
pub enum ConfigurationError {
  #[error("invalid channel {index} specified, device has {available} RX channels")]
  InvalidChannel { index: usize, available: usize },
  #[error("channel {0} specified more than once")]
  DuplicateChannel(usize),
  #[error("unknown sample format {0:?}")]
  UnknownFormat(String),
  #[error("no converter from {input} to {output}")]
  NoConverter { input: String, output: String },
  #[error("invalid stream argument {key}={value:?}")]
  InvalidStreamArg { key: String, value: String },
  #[error("invalid endpoint for channel {channel}: {reason}")]
  InvalidEndpoint { channel: char, reason: String },
  #[error(transparent)]
  Property(#[from] PropertyError),
  #[error("transport setup failed: {0}")]
  Transport(#[from] std::io::Error),
  #[error("no device found for address {0:?}")]
  NoDevice(String),
  #[error("device time did not converge after {attempts} attempts")]
  TimeNotConverged { attempts: usize },
}

pub type Result<T> = std::result::Result<T, ConfigurationError>;
