//! NSM protocol vocabulary and inbound message decoding.
//!
//! Every address the client understands or emits is listed here, together with
//! the fixed error-code table and the decoder that turns raw OSC messages into
//! typed [`Inbound`] values.

use std::fmt;
use std::net::SocketAddr;

use crate::capability::ManagerCapabilities;
use crate::osc::OscMessage;

pub const API_VERSION_MAJOR: i32 = 1;
pub const API_VERSION_MINOR: i32 = 0;

pub const ADDR_REPLY: &str = "/reply";
pub const ADDR_ERROR: &str = "/error";
pub const ADDR_SERVER_ANNOUNCE: &str = "/nsm/server/announce";
pub const ADDR_SERVER_BROADCAST: &str = "/nsm/server/broadcast";
pub const ADDR_CLIENT_OPEN: &str = "/nsm/client/open";
pub const ADDR_CLIENT_SAVE: &str = "/nsm/client/save";
pub const ADDR_CLIENT_SESSION_IS_LOADED: &str = "/nsm/client/session_is_loaded";
pub const ADDR_CLIENT_SHOW_OPTIONAL_GUI: &str = "/nsm/client/show_optional_gui";
pub const ADDR_CLIENT_HIDE_OPTIONAL_GUI: &str = "/nsm/client/hide_optional_gui";
pub const ADDR_CLIENT_IS_DIRTY: &str = "/nsm/client/is_dirty";
pub const ADDR_CLIENT_IS_CLEAN: &str = "/nsm/client/is_clean";
pub const ADDR_CLIENT_GUI_IS_SHOWN: &str = "/nsm/client/gui_is_shown";
pub const ADDR_CLIENT_GUI_IS_HIDDEN: &str = "/nsm/client/gui_is_hidden";
pub const ADDR_CLIENT_PROGRESS: &str = "/nsm/client/progress";
pub const ADDR_CLIENT_MESSAGE: &str = "/nsm/client/message";
pub const ADDR_CLIENT_LABEL: &str = "/nsm/client/label";

/// Message text sent with every successful reply.
pub const OK_MESSAGE: &str = "Ok";

/// Fixed NSM error-code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    GeneralError = -1,
    IncompatibleApi = -2,
    Blacklisted = -3,
    LaunchFailed = -4,
    NoSuchFile = -5,
    NoSessionOpen = -6,
    UnsavedChanges = -7,
    NotNow = -8,
    BadProject = -9,
    CreateFailed = -10,
    SessionLocked = -11,
    OperationPending = -12,
}

impl ErrorCode {
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        let code = match code {
            0 => Self::Ok,
            -1 => Self::GeneralError,
            -2 => Self::IncompatibleApi,
            -3 => Self::Blacklisted,
            -4 => Self::LaunchFailed,
            -5 => Self::NoSuchFile,
            -6 => Self::NoSessionOpen,
            -7 => Self::UnsavedChanges,
            -8 => Self::NotNow,
            -9 => Self::BadProject,
            -10 => Self::CreateFailed,
            -11 => Self::SessionLocked,
            -12 => Self::OperationPending,
            _ => return None,
        };
        Some(code)
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

/// Priority levels for `/nsm/client/message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(i32)]
pub enum MessagePriority {
    #[default]
    Lowest = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

/// Arguments of `/nsm/client/open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub path: String,
    pub display_name: String,
    pub client_id: String,
}

/// A decoded manager-to-client command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open(OpenRequest),
    Save,
    SessionIsLoaded,
    ShowGui,
    HideGui,
    Broadcast(OscMessage),
}

impl Command {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Open(_) => CommandKind::Open,
            Self::Save => CommandKind::Save,
            Self::SessionIsLoaded => CommandKind::SessionIsLoaded,
            Self::ShowGui => CommandKind::ShowGui,
            Self::HideGui => CommandKind::HideGui,
            Self::Broadcast(_) => CommandKind::Broadcast,
        }
    }
}

/// Command discriminant, used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Open,
    Save,
    SessionIsLoaded,
    ShowGui,
    HideGui,
    Broadcast,
}

impl CommandKind {
    #[must_use]
    pub const fn address(self) -> &'static str {
        match self {
            Self::Open => ADDR_CLIENT_OPEN,
            Self::Save => ADDR_CLIENT_SAVE,
            Self::SessionIsLoaded => ADDR_CLIENT_SESSION_IS_LOADED,
            Self::ShowGui => ADDR_CLIENT_SHOW_OPTIONAL_GUI,
            Self::HideGui => ADDR_CLIENT_HIDE_OPTIONAL_GUI,
            Self::Broadcast => ADDR_SERVER_BROADCAST,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.address())
    }
}

/// Manager details captured from a successful announce reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerInfo {
    pub name: String,
    pub greeting: String,
    pub capabilities: ManagerCapabilities,
    pub address: SocketAddr,
}

/// Outcome of the announce exchange as reported by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    Accepted(ManagerInfo),
    Rejected {
        code: Option<ErrorCode>,
        reason: String,
    },
}

/// Everything the receiver can hand to the polling gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(Command),
    Activation(Activation),
}

/// Reasons an inbound message is discarded before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{address}: expected {expected} arguments, got {got}")]
    Arity {
        address: String,
        expected: usize,
        got: usize,
    },

    #[error("{address}: argument {index} must be {expected}")]
    ArgumentType {
        address: String,
        index: usize,
        expected: &'static str,
    },

    #[error("{address}: target {target:?} does not match {ADDR_SERVER_ANNOUNCE}")]
    UnexpectedTarget { address: String, target: String },

    #[error("Unknown address: {0}")]
    UnknownAddress(String),
}

/// Decode an inbound OSC message received from `from`.
///
/// # Errors
///
/// Returns a [`DecodeError`] when the address is unknown, the argument count
/// does not match the command's fixed arity, or an argument has the wrong type.
pub fn decode(msg: &OscMessage, from: SocketAddr) -> Result<Inbound, DecodeError> {
    let command = match msg.address.as_str() {
        ADDR_REPLY => return decode_announce_reply(msg, from).map(Inbound::Activation),
        ADDR_ERROR => return decode_announce_error(msg).map(Inbound::Activation),
        ADDR_CLIENT_OPEN => {
            expect_arity(msg, 3)?;
            Command::Open(OpenRequest {
                path: string_at(msg, 0)?,
                display_name: string_at(msg, 1)?,
                client_id: string_at(msg, 2)?,
            })
        }
        ADDR_CLIENT_SAVE => {
            expect_arity(msg, 0)?;
            Command::Save
        }
        ADDR_CLIENT_SESSION_IS_LOADED => {
            expect_arity(msg, 0)?;
            Command::SessionIsLoaded
        }
        ADDR_CLIENT_SHOW_OPTIONAL_GUI => {
            expect_arity(msg, 0)?;
            Command::ShowGui
        }
        ADDR_CLIENT_HIDE_OPTIONAL_GUI => {
            expect_arity(msg, 0)?;
            Command::HideGui
        }
        ADDR_SERVER_BROADCAST => Command::Broadcast(msg.clone()),
        other => return Err(DecodeError::UnknownAddress(other.to_string())),
    };
    Ok(Inbound::Command(command))
}

fn decode_announce_reply(msg: &OscMessage, from: SocketAddr) -> Result<Activation, DecodeError> {
    expect_arity(msg, 4)?;
    expect_announce_target(msg)?;

    Ok(Activation::Accepted(ManagerInfo {
        greeting: string_at(msg, 1)?,
        name: string_at(msg, 2)?,
        capabilities: ManagerCapabilities::parse(&string_at(msg, 3)?),
        address: from,
    }))
}

// Managers disagree on the middle field: nsmd sends an error code, others a
// name. Both are accepted; only the code is kept.
fn decode_announce_error(msg: &OscMessage) -> Result<Activation, DecodeError> {
    expect_arity(msg, 3)?;
    expect_announce_target(msg)?;

    if msg.string_arg(1).is_none() && msg.int_arg(1).is_none() {
        return Err(DecodeError::ArgumentType {
            address: msg.address.clone(),
            index: 1,
            expected: "a string or an int",
        });
    }

    Ok(Activation::Rejected {
        code: msg.int_arg(1).and_then(ErrorCode::from_code),
        reason: string_at(msg, 2)?,
    })
}

fn expect_arity(msg: &OscMessage, expected: usize) -> Result<(), DecodeError> {
    let got = msg.args.len();
    if got != expected {
        return Err(DecodeError::Arity {
            address: msg.address.clone(),
            expected,
            got,
        });
    }
    Ok(())
}

fn expect_announce_target(msg: &OscMessage) -> Result<(), DecodeError> {
    let target = string_at(msg, 0)?;
    if target != ADDR_SERVER_ANNOUNCE {
        return Err(DecodeError::UnexpectedTarget {
            address: msg.address.clone(),
            target,
        });
    }
    Ok(())
}

fn string_at(msg: &OscMessage, index: usize) -> Result<String, DecodeError> {
    msg.string_arg(index)
        .map(str::to_string)
        .ok_or_else(|| DecodeError::ArgumentType {
            address: msg.address.clone(),
            index,
            expected: "a string",
        })
}
