//! Error types for each pipeline stage.
//!
//! Every stage returns its own error kind so that [`crate::pipeline::Pipeline`]
//! can decide explicitly which failures degrade to an empty result and which
//! are only reported.

use reqwest::StatusCode;

/// Failure to obtain raw feed bytes from the upstream source.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// Connection, TLS or body read failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The upstream answered with a non-success status.
    #[error("upstream returned HTTP {0}")]
    Status(StatusCode),
    /// The configured feed URL could not be parsed.
    #[error("invalid feed url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    /// The credential cannot be sent as an HTTP header.
    #[error("invalid credential header: {0}")]
    InvalidCredential(String),
}

/// The bytes are not a well-formed GTFS-RT `FeedMessage`.
#[derive(thiserror::Error, Debug)]
#[error("malformed feed message: {0}")]
pub struct DecodeError(#[from] pub prost::DecodeError);

/// Failure to establish a broker connection.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Required broker settings are missing or unusable.
    #[error("broker configuration error: {0}")]
    Config(String),
    /// Network, TLS or authentication failure.
    #[error("broker connection failed: {0}")]
    Transport(String),
}

/// Failure while publishing on an established connection.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    /// A publish session could not be opened.
    #[error("failed to open publish session: {0}")]
    Session(String),
    /// The payload could not be encoded.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    /// The broker rejected or could not accept a message for `topic`.
    #[error("failed to publish to {topic}: {reason}")]
    Send { topic: String, reason: String },
}
