//! Announce handshake state machine.
//!
//! ```text
//! Unannounced --announce--> Announcing --reply-->   Active
//!                               |      --error-->   Inactive
//!                               |      --timeout--> Inactive
//! Inactive    --announce--> Announcing
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::capability::{ClientCapabilities, ManagerCapabilities, ManagerCapability};
use crate::error::{Error, Result};
use crate::osc::OscMessage;
use crate::protocol::{
    ADDR_SERVER_ANNOUNCE, API_VERSION_MAJOR, API_VERSION_MINOR, Activation, ManagerInfo,
};

pub const DEFAULT_ANNOUNCE_TIMEOUT: Duration = Duration::from_millis(100_000);

/// Deadline offset used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

const FALLBACK_PROCESS_NAME: &str = "nsm-client";

/// Who this client says it is in the announce message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pretty_name: Option<String>,
    process_name: String,
    pid: u32,
    api_major: i32,
    api_minor: i32,
}

impl ClientIdentity {
    /// Identity of the running process (`argv[0]`, current pid).
    #[must_use]
    pub fn current() -> Self {
        let process_name = std::env::args()
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_PROCESS_NAME.to_string());
        Self::new(process_name, std::process::id())
    }

    #[must_use]
    pub fn new(process_name: impl Into<String>, pid: u32) -> Self {
        Self {
            pretty_name: None,
            process_name: process_name.into(),
            pid,
            api_major: API_VERSION_MAJOR,
            api_minor: API_VERSION_MINOR,
        }
    }

    /// Display name; falls back to the process name when unset.
    #[must_use]
    pub fn pretty_name(&self) -> &str {
        self.pretty_name.as_deref().unwrap_or(&self.process_name)
    }

    #[must_use]
    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub const fn api_version(&self) -> (i32, i32) {
        (self.api_major, self.api_minor)
    }

    pub fn set_pretty_name(&mut self, name: impl Into<String>) {
        self.pretty_name = Some(name.into());
    }

    pub const fn set_api_version(&mut self, major: i32, minor: i32) {
        self.api_major = major;
        self.api_minor = minor;
    }

    /// Build the six-field `/nsm/server/announce` message.
    #[must_use]
    pub fn announce_message(&self, capabilities: &ClientCapabilities) -> OscMessage {
        OscMessage::new(ADDR_SERVER_ANNOUNCE)
            .with_arg(self.pretty_name())
            .with_arg(capabilities.encode())
            .with_arg(self.process_name.as_str())
            .with_arg(self.api_major)
            .with_arg(self.api_minor)
            .with_arg(i32::try_from(self.pid).unwrap_or(i32::MAX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Unannounced,
    Announcing,
    Active,
    Inactive,
}

/// What the client knows about the manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagerSession {
    active: bool,
    name: String,
    capabilities: ManagerCapabilities,
    address: Option<SocketAddr>,
}

impl ManagerSession {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn capabilities(&self) -> &ManagerCapabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn has_capability(&self, capability: ManagerCapability) -> bool {
        self.capabilities.has(capability)
    }

    #[must_use]
    pub const fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    fn activate(&mut self, info: ManagerInfo) {
        self.active = true;
        self.name = info.name;
        self.capabilities = info.capabilities;
        self.address = Some(info.address);
    }

    fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Announce state plus the pending-announce deadline.
#[derive(Debug, Default)]
pub struct Handshake {
    state: HandshakeState,
    session: ManagerSession,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl Handshake {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    #[must_use]
    pub const fn session(&self) -> &ManagerSession {
        &self.session
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.session.active
    }

    /// Announce wait bound; `Duration::ZERO` restores the default.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_ANNOUNCE_TIMEOUT)
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Enter `Announcing` and install a fresh deadline, replacing any earlier one.
    ///
    /// Timeouts too large to represent are capped at roughly thirty years.
    pub fn begin(&mut self, now: Instant) -> Instant {
        let deadline = now
            .checked_add(self.timeout().min(FAR_FUTURE))
            .unwrap_or(now);
        self.state = HandshakeState::Announcing;
        self.deadline = Some(deadline);
        deadline
    }

    /// Apply the manager's answer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeRejected`] when the manager refused the announce.
    pub fn apply(&mut self, activation: Activation) -> Result<()> {
        self.deadline = None;
        match activation {
            Activation::Accepted(info) => {
                info!(
                    "Registered with session manager {:?} at {} ({})",
                    info.name, info.address, info.greeting
                );
                self.session.activate(info);
                self.state = HandshakeState::Active;
                Ok(())
            }
            Activation::Rejected { code, reason } => {
                warn!("Session manager rejected announce: {reason}");
                self.session.deactivate();
                self.state = HandshakeState::Inactive;
                Err(Error::HandshakeRejected { code, reason })
            }
        }
    }

    /// The deadline passed without an answer.
    pub fn expire(&mut self) -> Error {
        self.abort();
        Error::HandshakeTimeout(self.timeout())
    }

    /// Give up on the pending announce without an answer.
    pub fn abort(&mut self) {
        self.deadline = None;
        self.session.deactivate();
        self.state = HandshakeState::Inactive;
    }

    /// True while an announce is pending or has been accepted.
    #[must_use]
    pub const fn is_announced(&self) -> bool {
        matches!(
            self.state,
            HandshakeState::Announcing | HandshakeState::Active
        )
    }
}
