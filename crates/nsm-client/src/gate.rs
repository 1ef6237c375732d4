//! Inbound receiver task and the host-side polling gate.
//!
//! The receiver decodes datagrams and hands them over one at a time through a
//! bounded queue, so a host that stops polling throttles the network side.
//! Host handlers only ever run from [`PollingGate`] calls on the host thread.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::osc::{CodecError, OscMessage};
use crate::protocol::{self, ADDR_SERVER_ANNOUNCE, Activation, Inbound};

/// Queue depth between the receiver and the host.
pub(crate) const EVENT_QUEUE_DEPTH: usize = 1;

/// Most events held back while an announce is pending. Once full, the
/// receiver is left blocked until the announce wait ends.
pub(crate) const ANNOUNCE_BACKLOG_LIMIT: usize = 64;

/// Everything that can wake a poll, apart from termination.
#[derive(Debug)]
pub(crate) enum Event {
    Inbound(Inbound),
    Diagnostic(Error),
}

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing arrived before the timeout.
    Idle,
    /// One event was processed.
    Handled,
    /// A termination signal was observed.
    Terminated,
}

#[derive(Debug)]
pub(crate) enum Polled {
    Event(Event),
    Terminated,
    Idle,
    Closed,
}

#[derive(Debug)]
pub(crate) enum AnnounceWait {
    Answered(Activation),
    Failed(Error),
    TimedOut,
}

/// Fires the termination signal observed by the next poll.
///
/// Signals fired before a poll picks them up coalesce into one.
#[derive(Debug, Clone)]
pub struct TerminationTrigger {
    tx: mpsc::Sender<()>,
}

impl TerminationTrigger {
    /// Returns `false` if a signal was already pending.
    pub fn fire(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

#[derive(Debug)]
pub(crate) struct PollingGate {
    events: mpsc::Receiver<Event>,
    backlog: VecDeque<Event>,
    terminate: mpsc::Receiver<()>,
}

impl PollingGate {
    pub(crate) fn new(events: mpsc::Receiver<Event>) -> (Self, TerminationTrigger) {
        let (tx, terminate) = mpsc::channel(1);
        let gate = Self {
            events,
            backlog: VecDeque::new(),
            terminate,
        };
        (gate, TerminationTrigger { tx })
    }

    /// Wait up to `timeout` for one event.
    ///
    /// Termination wins over queued events, and queued events win over the
    /// timeout, so a zero timeout still drains whatever is ready.
    pub(crate) async fn next(&mut self, timeout: Duration) -> Polled {
        if self.terminate.try_recv().is_ok() {
            return Polled::Terminated;
        }
        if let Some(event) = self.backlog.pop_front() {
            return Polled::Event(event);
        }

        tokio::select! {
            biased;
            Some(()) = self.terminate.recv() => Polled::Terminated,
            event = self.events.recv() => event.map_or(Polled::Closed, Polled::Event),
            () = tokio::time::sleep(timeout) => Polled::Idle,
        }
    }

    /// Wait until `deadline` for the manager's answer to an announce.
    ///
    /// Unrelated events are kept in order for later polls, up to
    /// [`ANNOUNCE_BACKLOG_LIMIT`]. Termination is left pending.
    pub(crate) async fn next_activation(&mut self, deadline: Instant) -> AnnounceWait {
        if let Some(pos) = self
            .backlog
            .iter()
            .position(|e| matches!(e, Event::Inbound(Inbound::Activation(_))))
            && let Some(Event::Inbound(Inbound::Activation(activation))) = self.backlog.remove(pos)
        {
            return AnnounceWait::Answered(activation);
        }

        loop {
            if self.backlog.len() >= ANNOUNCE_BACKLOG_LIMIT {
                warn!(
                    "{} events deferred during announce; no longer reading until it completes",
                    self.backlog.len()
                );
                tokio::time::sleep_until(deadline).await;
                return AnnounceWait::TimedOut;
            }

            let event = tokio::select! {
                event = self.events.recv() => event,
                () = tokio::time::sleep_until(deadline) => return AnnounceWait::TimedOut,
            };

            match event {
                Some(Event::Inbound(Inbound::Activation(activation))) => {
                    return AnnounceWait::Answered(activation);
                }
                Some(Event::Diagnostic(Error::SendFailed { address, source }))
                    if address == ADDR_SERVER_ANNOUNCE =>
                {
                    return AnnounceWait::Failed(Error::SendFailed { address, source });
                }
                Some(other) => {
                    debug!("Deferring {other:?} until the announce completes");
                    self.backlog.push_back(other);
                }
                None => return AnnounceWait::Failed(Error::Disconnected),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// Decode datagrams from `stream` and forward them until cancelled.
///
/// Only datagrams sent from `manager` are accepted. Malformed packets and
/// messages that fail to decode are logged and dropped.
pub(crate) async fn run_receiver<S>(
    mut stream: S,
    manager: SocketAddr,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<(OscMessage, SocketAddr), CodecError>> + Unpin,
{
    debug!("Receiver started");

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        let event = match next {
            Some(Ok((msg, from))) if from != manager => {
                debug!("Ignoring {} from {from}, not the session manager", msg.address);
                continue;
            }
            Some(Ok((msg, from))) => {
                trace!("<- {msg} from {from}");
                match protocol::decode(&msg, from) {
                    Ok(inbound) => Event::Inbound(inbound),
                    Err(e) => {
                        warn!("Dropping message from {from}: {e}");
                        continue;
                    }
                }
            }
            Some(Err(CodecError::Io(e))) => Event::Diagnostic(Error::Io(e)),
            Some(Err(e)) => {
                warn!("Dropping malformed packet: {e}");
                continue;
            }
            None => break,
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            sent = events.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Receiver stopped");
}
