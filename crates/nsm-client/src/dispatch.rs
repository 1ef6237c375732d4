//! Host handler registry and command dispatch.
//!
//! Handlers only ever run on the thread that polls the client, so they do not
//! need to be `Send`.

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::osc::OscMessage;
use crate::protocol::{
    ADDR_CLIENT_OPEN, ADDR_CLIENT_SAVE, ADDR_ERROR, ADDR_REPLY, Command, CommandKind, ErrorCode,
    OK_MESSAGE, OpenRequest,
};
use crate::sender::Intent;

/// Failure reported by a host handler.
///
/// For Open and Save it becomes an `/error` reply carrying `code` and `message`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CallbackError {
    code: ErrorCode,
    message: String,
}

impl CallbackError {
    /// A `GeneralError` failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::GeneralError, message)
    }

    #[must_use]
    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        // An error reply carrying OK would read as success to the manager.
        let code = if code == ErrorCode::Ok {
            ErrorCode::GeneralError
        } else {
            code
        };
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type HandlerResult = std::result::Result<(), CallbackError>;

/// Reply to a manager command, consumed once by the sender loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    target: &'static str,
    code: ErrorCode,
    message: String,
}

impl ReplyEnvelope {
    #[must_use]
    pub fn from_result(target: &'static str, result: &HandlerResult) -> Self {
        match result {
            Ok(()) => Self {
                target,
                code: ErrorCode::Ok,
                message: OK_MESSAGE.to_string(),
            },
            Err(e) => Self {
                target,
                code: e.code(),
                message: e.message().to_string(),
            },
        }
    }

    #[must_use]
    pub const fn target(&self) -> &'static str {
        self.target
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok
    }

    /// `/reply target message` on success, `/error target code message` otherwise.
    #[must_use]
    pub fn to_message(&self) -> OscMessage {
        if self.is_ok() {
            OscMessage::new(ADDR_REPLY)
                .with_arg(self.target)
                .with_arg(self.message.as_str())
        } else {
            OscMessage::new(ADDR_ERROR)
                .with_arg(self.target)
                .with_arg(self.code.code())
                .with_arg(self.message.as_str())
        }
    }
}

type OpenHandler = Box<dyn FnMut(&OpenRequest) -> HandlerResult>;
type SimpleHandler = Box<dyn FnMut() -> HandlerResult>;
type ActiveHandler = Box<dyn FnMut(bool)>;
type BroadcastHandler = Box<dyn FnMut(&OscMessage) -> HandlerResult>;

/// Optional host handlers, one slot per command.
#[derive(Default)]
pub struct Handlers {
    open: Option<OpenHandler>,
    save: Option<SimpleHandler>,
    session_is_loaded: Option<SimpleHandler>,
    show_gui: Option<SimpleHandler>,
    hide_gui: Option<SimpleHandler>,
    active: Option<ActiveHandler>,
    broadcast: Option<BroadcastHandler>,
}

impl Handlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_open(&mut self, handler: impl FnMut(&OpenRequest) -> HandlerResult + 'static) {
        self.open = Some(Box::new(handler));
    }

    pub fn set_save(&mut self, handler: impl FnMut() -> HandlerResult + 'static) {
        self.save = Some(Box::new(handler));
    }

    pub fn set_session_is_loaded(&mut self, handler: impl FnMut() -> HandlerResult + 'static) {
        self.session_is_loaded = Some(Box::new(handler));
    }

    pub fn set_show_gui(&mut self, handler: impl FnMut() -> HandlerResult + 'static) {
        self.show_gui = Some(Box::new(handler));
    }

    pub fn set_hide_gui(&mut self, handler: impl FnMut() -> HandlerResult + 'static) {
        self.hide_gui = Some(Box::new(handler));
    }

    pub fn set_active(&mut self, handler: impl FnMut(bool) + 'static) {
        self.active = Some(Box::new(handler));
    }

    pub fn set_broadcast(&mut self, handler: impl FnMut(&OscMessage) -> HandlerResult + 'static) {
        self.broadcast = Some(Box::new(handler));
    }

    #[must_use]
    pub const fn is_registered(&self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::Open => self.open.is_some(),
            CommandKind::Save => self.save.is_some(),
            CommandKind::SessionIsLoaded => self.session_is_loaded.is_some(),
            CommandKind::ShowGui => self.show_gui.is_some(),
            CommandKind::HideGui => self.hide_gui.is_some(),
            CommandKind::Broadcast => self.broadcast.is_some(),
        }
    }

    pub(crate) fn notify_active(&mut self, active: bool) {
        if let Some(handler) = self.active.as_mut() {
            handler(active);
        }
    }

    /// Run the handler for `command` and return the outbound intents it produced.
    ///
    /// Open and Save always yield a reply; a successful Save is followed by
    /// `is_clean`. The other commands yield nothing and only log handler
    /// failures.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CallbackNotRegistered`] when the command needs a handler
    /// and none is set. Nothing is sent in that case.
    pub fn dispatch(&mut self, command: Command) -> Result<Vec<Intent>> {
        let kind = command.kind();
        match command {
            Command::Open(request) => {
                let handler = required(&mut self.open, kind)?;
                info!(
                    "Opening {:?} as {:?} (client id {})",
                    request.path, request.display_name, request.client_id
                );
                let result = handler(&request);
                Ok(vec![Intent::Reply(ReplyEnvelope::from_result(
                    ADDR_CLIENT_OPEN,
                    &result,
                ))])
            }
            Command::Save => {
                let handler = required(&mut self.save, kind)?;
                let reply = ReplyEnvelope::from_result(ADDR_CLIENT_SAVE, &handler());
                let saved = reply.is_ok();
                let mut intents = vec![Intent::Reply(reply)];
                if saved {
                    intents.push(Intent::IsClean);
                }
                Ok(intents)
            }
            Command::SessionIsLoaded => {
                run_unreplied(required(&mut self.session_is_loaded, kind)?, kind);
                Ok(Vec::new())
            }
            Command::ShowGui => {
                run_unreplied(required(&mut self.show_gui, kind)?, kind);
                Ok(Vec::new())
            }
            Command::HideGui => {
                run_unreplied(required(&mut self.hide_gui, kind)?, kind);
                Ok(Vec::new())
            }
            Command::Broadcast(msg) => {
                match self.broadcast.as_mut() {
                    Some(handler) => {
                        if let Err(e) = handler(&msg) {
                            warn!("Broadcast handler failed: {e}");
                        }
                    }
                    None => debug!("Ignoring broadcast: {msg}"),
                }
                Ok(Vec::new())
            }
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("open", &self.open.is_some())
            .field("save", &self.save.is_some())
            .field("session_is_loaded", &self.session_is_loaded.is_some())
            .field("show_gui", &self.show_gui.is_some())
            .field("hide_gui", &self.hide_gui.is_some())
            .field("active", &self.active.is_some())
            .field("broadcast", &self.broadcast.is_some())
            .finish()
    }
}

fn required<T>(slot: &mut Option<T>, kind: CommandKind) -> Result<&mut T> {
    slot.as_mut().ok_or(Error::CallbackNotRegistered(kind))
}

fn run_unreplied(handler: &mut SimpleHandler, kind: CommandKind) {
    if let Err(e) = handler() {
        warn!("Handler for {kind} failed: {e}");
    }
}
