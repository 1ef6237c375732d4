//! Client engine for the Non Session Manager (NSM) protocol.
//!
//! A session manager launches audio applications with `NSM_URL` set and then
//! drives them over OSC/UDP: it tells them which project to open, when to save
//! and when to show or hide their optional GUI. This crate implements the
//! client side of that conversation.
//!
//! # Architecture
//!
//! - [`osc`]: OSC 1.0 message type and the datagram codec
//! - [`protocol`]: NSM addresses, error codes and inbound decoding
//! - [`capability`]: client and manager capability sets
//! - [`handshake`]: announce state machine and manager session state
//! - [`dispatch`]: host handler registry and reply construction
//! - [`sender`]: serialized outbound writer and the [`Notifier`] handle
//! - [`gate`]: receiver task and the host-side polling gate
//! - [`client`]: [`NsmClient`], the host-facing entry point
//! - [`config`]: persisted client settings and `NSM_URL` discovery
//! - [`error`]: error type and `Result` alias
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use nsm_client::{NsmClient, PollOutcome, nsm_url_from_env};
//!
//! # fn example() -> nsm_client::Result<()> {
//! let Some(url) = nsm_url_from_env() else {
//!     return Ok(());
//! };
//!
//! let mut client = NsmClient::new();
//! client.set_pretty_name("Notes")?;
//! client.set_client_capabilities(["dirty"])?;
//! client.on_open(|request| {
//!     println!("Opening {}", request.path);
//!     Ok(())
//! });
//! client.on_save(|| Ok(()));
//!
//! client.init(&url)?;
//! client.handle_termination_signals()?;
//! client.announce()?;
//!
//! while client.check_wait(Duration::from_millis(100))? != PollOutcome::Terminated {}
//! client.stop();
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod handshake;
pub mod osc;
pub mod protocol;
pub mod sender;

pub use client::{NsmClient, resolve_endpoint};

pub use config::{ClientConfig, NSM_URL_VAR, nsm_url_from_env};

pub use error::{Error, Result};

pub use capability::{ClientCapabilities, ClientCapability, ManagerCapabilities, ManagerCapability};
pub use dispatch::{CallbackError, HandlerResult};
pub use gate::{PollOutcome, TerminationTrigger};
pub use handshake::{ClientIdentity, DEFAULT_ANNOUNCE_TIMEOUT, HandshakeState};
pub use protocol::{ErrorCode, MessagePriority, OpenRequest};
pub use sender::Notifier;

pub use osc::{CodecError, OscArg, OscCodec, OscMessage};
