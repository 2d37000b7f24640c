// MIT License - Copyright (c) 2026 Peter Wright
// Gateway error taxonomy

use std::fmt;
use std::path::PathBuf;

use crate::alarm::AlarmState;

/// Broad classification of a [`GatewayError`], used for logging and for the
/// `error` field of command acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input: MAC, pin, payload or command action.
    Validation,
    /// The command named an entity the registry does not hold.
    NotFound,
    /// A bridge request did not complete in time.
    Timeout,
    /// The backing store could not be written.
    Persistence,
    /// Anything else (channel shutdown, bridge-side failure).
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::Persistence => "persistence",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All errors that can occur in the gateway state engine.
///
/// Every error is local to the command that triggered it; the event loop logs
/// it and carries on.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid MAC address: {mac:?}")]
    InvalidMac { mac: String },

    #[error("Invalid pin format")]
    InvalidPin,

    #[error("Unknown command action: {action}")]
    UnknownAction { action: String },

    #[error("Malformed payload on {topic}: {reason}")]
    MalformedPayload { topic: String, reason: String },

    #[error("Pin rejected for {mac}")]
    PinRejected { mac: String },

    #[error("Cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: AlarmState },

    #[error("Unknown entity: {mac}")]
    NotFound { mac: String },

    #[error("Entity {mac} is not a keypad")]
    NotAKeypad { mac: String },

    #[error("Bridge request timed out: {op}")]
    BridgeTimeout { op: String },

    #[error("Bridge request failed: {op}: {reason}")]
    BridgeFailed { op: String, reason: String },

    #[error("Failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("Failed to serialize registry: {0}")]
    Serialize(String),

    #[error("Channel closed")]
    ChannelClosed,
}

impl GatewayError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::InvalidMac { .. }
            | GatewayError::InvalidPin
            | GatewayError::UnknownAction { .. }
            | GatewayError::MalformedPayload { .. }
            | GatewayError::PinRejected { .. }
            | GatewayError::InvalidTransition { .. }
            | GatewayError::NotAKeypad { .. } => ErrorKind::Validation,
            GatewayError::NotFound { .. } => ErrorKind::NotFound,
            GatewayError::BridgeTimeout { .. } => ErrorKind::Timeout,
            GatewayError::Persistence { .. } | GatewayError::Serialize(_) => ErrorKind::Persistence,
            GatewayError::Parse { .. }
            | GatewayError::BridgeFailed { .. }
            | GatewayError::ChannelClosed => ErrorKind::Internal,
        }
    }

    pub(crate) fn malformed(topic: &str, reason: impl Into<String>) -> Self {
        GatewayError::MalformedPayload {
            topic: topic.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
