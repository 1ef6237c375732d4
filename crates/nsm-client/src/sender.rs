//! Outbound sender loop.
//!
//! A single task owns the write half of the socket. Everything the client
//! wants to tell the manager is queued here as an [`Intent`] and written in
//! arrival order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::dispatch::ReplyEnvelope;
use crate::error::{Error, Result};
use crate::gate::Event;
use crate::osc::{CodecError, OscMessage};
use crate::protocol::{
    ADDR_CLIENT_GUI_IS_HIDDEN, ADDR_CLIENT_GUI_IS_SHOWN, ADDR_CLIENT_IS_CLEAN,
    ADDR_CLIENT_IS_DIRTY, ADDR_CLIENT_LABEL, ADDR_CLIENT_MESSAGE, ADDR_CLIENT_PROGRESS,
    MessagePriority,
};

/// Something the client wants written to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Announce(OscMessage),
    Reply(ReplyEnvelope),
    IsDirty,
    IsClean,
    GuiShown,
    GuiHidden,
    Progress(f32),
    Message {
        priority: MessagePriority,
        text: String,
    },
    Label(String),
    /// Stop the sender loop.
    Close,
}

impl Intent {
    /// Only the announce may go out before the manager is active.
    #[must_use]
    pub const fn requires_active(&self) -> bool {
        !matches!(self, Self::Announce(_) | Self::Close)
    }

    #[must_use]
    pub fn to_message(&self) -> Option<OscMessage> {
        let msg = match self {
            Self::Announce(msg) => msg.clone(),
            Self::Reply(reply) => reply.to_message(),
            Self::IsDirty => OscMessage::new(ADDR_CLIENT_IS_DIRTY),
            Self::IsClean => OscMessage::new(ADDR_CLIENT_IS_CLEAN),
            Self::GuiShown => OscMessage::new(ADDR_CLIENT_GUI_IS_SHOWN),
            Self::GuiHidden => OscMessage::new(ADDR_CLIENT_GUI_IS_HIDDEN),
            Self::Progress(value) => {
                OscMessage::new(ADDR_CLIENT_PROGRESS).with_arg(value.clamp(0.0, 1.0))
            }
            Self::Message { priority, text } => OscMessage::new(ADDR_CLIENT_MESSAGE)
                .with_arg(*priority as i32)
                .with_arg(text.as_str()),
            Self::Label(text) => OscMessage::new(ADDR_CLIENT_LABEL).with_arg(text.as_str()),
            Self::Close => return None,
        };
        Some(msg)
    }

    /// The message to write given the current activity flag, if any.
    #[must_use]
    pub fn outbound(&self, active: bool) -> Option<OscMessage> {
        if self.requires_active() && !active {
            return None;
        }
        self.to_message()
    }
}

/// Drain `intents` into `sink` until a [`Intent::Close`] arrives or every
/// handle is dropped.
///
/// Write failures are reported on `events` and do not stop the loop.
pub(crate) async fn run_sender<S>(
    mut sink: S,
    manager: SocketAddr,
    mut intents: mpsc::UnboundedReceiver<Intent>,
    active: Arc<AtomicBool>,
    events: mpsc::Sender<Event>,
) where
    S: Sink<(OscMessage, SocketAddr), Error = CodecError> + Unpin,
{
    debug!("Sender loop started for {manager}");

    while let Some(intent) = intents.recv().await {
        if matches!(intent, Intent::Close) {
            break;
        }

        let Some(msg) = intent.outbound(active.load(Ordering::Acquire)) else {
            debug!("Manager inactive, dropping {intent:?}");
            continue;
        };

        trace!("-> {msg}");
        let address = msg.address.clone();
        if let Err(source) = sink.send((msg, manager)).await {
            warn!("Failed to send {address}: {source}");
            let diagnostic = Event::Diagnostic(Error::SendFailed { address, source });
            if events.send(diagnostic).await.is_err() {
                break;
            }
        }
    }

    debug!("Sender loop stopped");
}

/// Cloneable handle for host-side status notifications.
///
/// Notifications are dropped by the sender loop while the manager is not
/// active.
#[derive(Debug, Clone)]
pub struct Notifier {
    intents: mpsc::UnboundedSender<Intent>,
}

impl Notifier {
    pub(crate) const fn new(intents: mpsc::UnboundedSender<Intent>) -> Self {
        Self { intents }
    }

    pub(crate) fn push(&self, intent: Intent) -> Result<()> {
        self.intents.send(intent).map_err(|_| Error::SenderClosed)
    }

    /// # Errors
    ///
    /// Returns [`Error::SenderClosed`] once the sender loop has stopped.
    pub fn send_is_dirty(&self) -> Result<()> {
        self.push(Intent::IsDirty)
    }

    /// # Errors
    ///
    /// Returns [`Error::SenderClosed`] once the sender loop has stopped.
    pub fn send_is_clean(&self) -> Result<()> {
        self.push(Intent::IsClean)
    }

    /// # Errors
    ///
    /// Returns [`Error::SenderClosed`] once the sender loop has stopped.
    pub fn send_gui_shown(&self) -> Result<()> {
        self.push(Intent::GuiShown)
    }

    /// # Errors
    ///
    /// Returns [`Error::SenderClosed`] once the sender loop has stopped.
    pub fn send_gui_hidden(&self) -> Result<()> {
        self.push(Intent::GuiHidden)
    }

    /// Report progress of a long operation, clamped to `0.0..=1.0`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SenderClosed`] once the sender loop has stopped.
    pub fn send_progress(&self, progress: f32) -> Result<()> {
        self.push(Intent::Progress(progress))
    }

    /// # Errors
    ///
    /// Returns [`Error::SenderClosed`] once the sender loop has stopped.
    pub fn send_message(&self, priority: MessagePriority, text: impl Into<String>) -> Result<()> {
        self.push(Intent::Message {
            priority,
            text: text.into(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::SenderClosed`] once the sender loop has stopped.
    pub fn send_label(&self, label: impl Into<String>) -> Result<()> {
        self.push(Intent::Label(label.into()))
    }
}
