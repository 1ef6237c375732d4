//! Error types for the nsm-client crate.
//!
//! This module provides a unified error type for all engine operations.

use std::time::Duration;

use crate::osc::CodecError;
use crate::protocol::{CommandKind, DecodeError, ErrorCode};

/// Unified error type for NSM client operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid manager endpoint: {0:?}")]
    InvalidEndpoint(String),

    #[error("Invalid capability: {0:?}")]
    InvalidCapability(String),

    #[error("Client not initialized")]
    NotInitialized,

    #[error("Client already initialized")]
    AlreadyInitialized,

    #[error("Announce already sent")]
    AlreadyAnnounced,

    #[error("No announce reply within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Manager rejected announce: {reason}")]
    HandshakeRejected {
        code: Option<ErrorCode>,
        reason: String,
    },

    #[error("No handler registered for {0}")]
    CallbackNotRegistered(CommandKind),

    #[error("Failed to send {address}: {source}")]
    SendFailed {
        address: String,
        #[source]
        source: CodecError,
    },

    #[error("Sender loop closed")]
    SenderClosed,

    #[error("Connection closed")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, Error>;
