//! Client error taxonomy
//!
//! Every public operation of the driver returns [`Result`]. Link loss is not
//! an error here: it is recovered internally and only surfaces through the
//! `Disconnected` event.

use thiserror::Error;

/// Errors returned by the device client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Argument out of range or malformed, rejected before any I/O
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Device is not ready")]
    NotReady,

    /// The device answered `fail:<command>`
    #[error("Device rejected command '{0}'")]
    OperationFailed(String),

    /// The read-back did not match the command or its `fail:` form
    #[error("Unexpected response to '{command}': '{response}'")]
    UnexpectedResponse { command: String, response: String },

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The unit of work was cancelled, usually by a queue clear
    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No route from {from} to {to}")]
    Unreachable { from: String, to: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::DataError(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for ClientError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        ClientError::DataError(format!("response is not UTF-8: {}", e))
    }
}
