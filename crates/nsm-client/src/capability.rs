//! Client and manager capability sets.
//!
//! Capabilities travel on the wire as a colon-delimited string such as
//! `:switch:dirty:`. Internally they are kept as sets and only converted at
//! message build/decode time.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const SEPARATOR: char = ':';

/// Features a client may declare in its announce message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientCapability {
    Switch,
    OptionalGui,
    Message,
    Broadcast,
    Dirty,
    Progress,
}

impl ClientCapability {
    pub const ALL: [Self; 6] = [
        Self::Switch,
        Self::OptionalGui,
        Self::Message,
        Self::Broadcast,
        Self::Dirty,
        Self::Progress,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::OptionalGui => "optional-gui",
            Self::Message => "message",
            Self::Broadcast => "broadcast",
            Self::Dirty => "dirty",
            Self::Progress => "progress",
        }
    }
}

impl FromStr for ClientCapability {
    type Err = Error;

    /// Accepts both bare (`dirty`) and wire-wrapped (`:dirty:`) tokens.
    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim_matches(SEPARATOR);
        Self::ALL
            .into_iter()
            .find(|cap| cap.as_str() == token)
            .ok_or_else(|| Error::InvalidCapability(s.to_string()))
    }
}

impl fmt::Display for ClientCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Features a manager may advertise in its announce reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManagerCapability {
    OptionalGui,
    ServerControl,
    Broadcast,
}

impl ManagerCapability {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OptionalGui => "optional-gui",
            Self::ServerControl => "server-control",
            Self::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for ManagerCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The client's declared feature set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCapabilities(BTreeSet<ClientCapability>);

impl ClientCapabilities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set with `tokens`.
    ///
    /// Every token is validated before anything is assigned, so a failing call
    /// leaves the previous set untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if any token is empty or not part
    /// of the client vocabulary.
    pub fn replace<I, S>(&mut self, tokens: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = tokens
            .into_iter()
            .map(|token| token.as_ref().parse::<ClientCapability>())
            .collect::<Result<BTreeSet<_>>>()?;
        self.0 = parsed;
        Ok(())
    }

    pub fn set(&mut self, capabilities: impl IntoIterator<Item = ClientCapability>) {
        self.0 = capabilities.into_iter().collect();
    }

    /// Membership test by token; unknown tokens are never present.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        token
            .parse::<ClientCapability>()
            .is_ok_and(|cap| self.0.contains(&cap))
    }

    #[must_use]
    pub fn has(&self, capability: ClientCapability) -> bool {
        self.0.contains(&capability)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ClientCapability> + '_ {
        self.0.iter().copied()
    }

    /// Wire form, e.g. `:optional-gui:dirty:`. An empty set encodes as `:`.
    #[must_use]
    pub fn encode(&self) -> String {
        encode_tokens(self.0.iter().map(|cap| cap.as_str()))
    }
}

/// The manager's advertised feature set.
///
/// Tokens outside the known vocabulary are kept so newer managers can be
/// queried by string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerCapabilities(BTreeSet<String>);

impl ManagerCapabilities {
    #[must_use]
    pub fn parse(wire: &str) -> Self {
        Self(
            wire.split(SEPARATOR)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.0.contains(token.trim_matches(SEPARATOR))
    }

    #[must_use]
    pub fn has(&self, capability: ManagerCapability) -> bool {
        self.0.contains(capability.as_str())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn encode(&self) -> String {
        encode_tokens(self.0.iter().map(String::as_str))
    }
}

fn encode_tokens<'a>(tokens: impl Iterator<Item = &'a str>) -> String {
    let mut wire = String::from(SEPARATOR);
    for token in tokens {
        wire.push_str(token);
        wire.push(SEPARATOR);
    }
    wire
}
