//! The host-facing session client.
//!
//! [`NsmClient`] owns a small tokio runtime running the receiver and sender
//! tasks. The host drives everything else from its own thread: `announce`
//! blocks for the handshake, and `check_wait` processes at most one event per
//! call. Host handlers therefore never run concurrently and need not be `Send`.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::UdpSocket;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, warn};

use crate::capability::{
    ClientCapabilities, ClientCapability, ManagerCapabilities, ManagerCapability,
};
use crate::config::ClientConfig;
use crate::dispatch::{HandlerResult, Handlers};
use crate::error::{Error, Result};
use crate::gate::{
    AnnounceWait, EVENT_QUEUE_DEPTH, Event, PollOutcome, Polled, PollingGate, TerminationTrigger,
    run_receiver,
};
use crate::handshake::{ClientIdentity, Handshake, HandshakeState};
use crate::osc::{OscCodec, OscMessage};
use crate::protocol::{Activation, Command, Inbound, MessagePriority, OpenRequest};
use crate::sender::{Intent, Notifier, run_sender};

const URL_SCHEME: &str = "osc.udp://";
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Resolve an NSM endpoint such as `osc.udp://host:port/` to a socket address.
///
/// IPv4 results are preferred when the host resolves to several addresses.
///
/// # Errors
///
/// Returns [`Error::InvalidEndpoint`] if the endpoint is empty, has no port or
/// does not resolve.
pub fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    let trimmed = endpoint.trim();
    let host_port = trimmed
        .strip_prefix(URL_SCHEME)
        .unwrap_or(trimmed)
        .trim_end_matches('/');
    if host_port.is_empty() {
        return Err(Error::InvalidEndpoint(endpoint.to_string()));
    }

    let addrs: Vec<SocketAddr> = host_port
        .to_socket_addrs()
        .map_err(|e| {
            debug!("Failed to resolve {host_port}: {e}");
            Error::InvalidEndpoint(endpoint.to_string())
        })?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::InvalidEndpoint(endpoint.to_string()))
}

struct Engine {
    runtime: Runtime,
    gate: PollingGate,
    notifier: Notifier,
    trigger: TerminationTrigger,
    cancel: CancellationToken,
    active: Arc<AtomicBool>,
    manager: SocketAddr,
    local: SocketAddr,
}

impl Engine {
    fn start(manager: SocketAddr) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("nsm-client")
            .enable_all()
            .build()?;

        let bind_addr: SocketAddr = if manager.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = runtime.block_on(UdpSocket::bind(bind_addr))?;
        let local = socket.local_addr()?;

        let (sink, stream) = UdpFramed::new(socket, OscCodec::new()).split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicBool::new(false));

        runtime.spawn(run_receiver(
            stream,
            manager,
            events_tx.clone(),
            cancel.clone(),
        ));
        runtime.spawn(run_sender(
            sink,
            manager,
            intents_rx,
            Arc::clone(&active),
            events_tx,
        ));

        let (gate, trigger) = PollingGate::new(events_rx);
        info!("NSM client bound to {local}, manager at {manager}");

        Ok(Self {
            runtime,
            gate,
            notifier: Notifier::new(intents_tx),
            trigger,
            cancel,
            active,
            manager,
            local,
        })
    }
}

/// A session-managed client.
pub struct NsmClient {
    identity: ClientIdentity,
    capabilities: ClientCapabilities,
    handshake: Handshake,
    handlers: Handlers,
    engine: Option<Engine>,
}

impl Default for NsmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NsmClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identity: ClientIdentity::current(),
            capabilities: ClientCapabilities::new(),
            handshake: Handshake::new(),
            handlers: Handlers::new(),
            engine: None,
        }
    }

    /// Build a client with identity, capabilities and timeout taken from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if the config names an unknown
    /// capability.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let mut client = Self::new();
        if let Some(name) = &config.pretty_name {
            client.identity.set_pretty_name(name.as_str());
        }
        client
            .identity
            .set_api_version(config.api_major, config.api_minor);
        client.set_client_capabilities(&config.capabilities)?;
        client.set_announce_timeout(config.announce_timeout());
        Ok(client)
    }

    // Identity and capabilities

    /// # Errors
    ///
    /// Returns [`Error::AlreadyAnnounced`] while an announce is pending or accepted.
    pub fn set_pretty_name(&mut self, name: impl Into<String>) -> Result<()> {
        if self.handshake.is_announced() {
            return Err(Error::AlreadyAnnounced);
        }
        self.identity.set_pretty_name(name);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::AlreadyAnnounced`] while an announce is pending or accepted.
    pub fn set_api_version(&mut self, major: i32, minor: i32) -> Result<()> {
        if self.handshake.is_announced() {
            return Err(Error::AlreadyAnnounced);
        }
        self.identity.set_api_version(major, minor);
        Ok(())
    }

    #[must_use]
    pub const fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Bound for the announce wait. `Duration::ZERO` restores the default.
    pub fn set_announce_timeout(&mut self, timeout: Duration) {
        self.handshake.set_timeout(timeout);
    }

    #[must_use]
    pub fn announce_timeout(&self) -> Duration {
        self.handshake.timeout()
    }

    /// Replace the declared capabilities with `tokens`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] on an unknown or empty token; the
    /// previous set is kept in that case.
    pub fn set_client_capabilities<I, S>(&mut self, tokens: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.capabilities.replace(tokens)
    }

    #[must_use]
    pub fn has_client_capability(&self, token: &str) -> bool {
        self.capabilities.contains(token)
    }

    #[must_use]
    pub fn client_has_optional_gui(&self) -> bool {
        self.capabilities.has(ClientCapability::OptionalGui)
    }

    #[must_use]
    pub const fn client_capabilities(&self) -> &ClientCapabilities {
        &self.capabilities
    }

    // Manager state

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.handshake.is_active()
    }

    #[must_use]
    pub const fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    #[must_use]
    pub fn manager_name(&self) -> &str {
        self.handshake.session().name()
    }

    #[must_use]
    pub const fn manager_capabilities(&self) -> &ManagerCapabilities {
        self.handshake.session().capabilities()
    }

    #[must_use]
    pub fn has_manager_capability(&self, token: &str) -> bool {
        self.manager_capabilities().contains(token)
    }

    #[must_use]
    pub fn manager_has_optional_gui(&self) -> bool {
        self.handshake
            .session()
            .has_capability(ManagerCapability::OptionalGui)
    }

    #[must_use]
    pub fn manager_has_server_control(&self) -> bool {
        self.handshake
            .session()
            .has_capability(ManagerCapability::ServerControl)
    }

    #[must_use]
    pub fn manager_has_broadcast(&self) -> bool {
        self.handshake
            .session()
            .has_capability(ManagerCapability::Broadcast)
    }

    /// Address of the manager that accepted the announce.
    #[must_use]
    pub const fn manager_address(&self) -> Option<SocketAddr> {
        self.handshake.session().address()
    }

    /// Local socket address, once initialized.
    #[must_use]
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.engine.as_ref().map(|engine| engine.local)
    }

    // Handlers

    pub fn on_open(&mut self, handler: impl FnMut(&OpenRequest) -> HandlerResult + 'static) {
        self.handlers.set_open(handler);
    }

    pub fn on_save(&mut self, handler: impl FnMut() -> HandlerResult + 'static) {
        self.handlers.set_save(handler);
    }

    pub fn on_session_is_loaded(&mut self, handler: impl FnMut() -> HandlerResult + 'static) {
        self.handlers.set_session_is_loaded(handler);
    }

    pub fn on_show_gui(&mut self, handler: impl FnMut() -> HandlerResult + 'static) {
        self.handlers.set_show_gui(handler);
    }

    pub fn on_hide_gui(&mut self, handler: impl FnMut() -> HandlerResult + 'static) {
        self.handlers.set_hide_gui(handler);
    }

    /// Called with the new activity state whenever an announce answer is applied.
    pub fn on_active(&mut self, handler: impl FnMut(bool) + 'static) {
        self.handlers.set_active(handler);
    }

    pub fn on_broadcast(&mut self, handler: impl FnMut(&OscMessage) -> HandlerResult + 'static) {
        self.handlers.set_broadcast(handler);
    }

    // Lifecycle

    /// Open the transport towards `endpoint` and start the engine tasks.
    ///
    /// # Errors
    ///
    /// Fails if the client is already initialized, the endpoint does not
    /// resolve, or the runtime or socket cannot be created.
    pub fn init(&mut self, endpoint: &str) -> Result<()> {
        if self.engine.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let manager = resolve_endpoint(endpoint)?;
        self.engine = Some(Engine::start(manager)?);
        Ok(())
    }

    /// Send the announce and block until the manager answers or the announce
    /// timeout passes.
    ///
    /// Commands that arrive during the wait are kept and delivered by later
    /// polls. A pending termination signal is left for the next poll.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeRejected`], [`Error::HandshakeTimeout`], or a
    /// send failure for the announce itself.
    pub fn announce(&mut self) -> Result<()> {
        let engine = self.engine.as_mut().ok_or(Error::NotInitialized)?;
        let message = self.identity.announce_message(&self.capabilities);
        info!(
            "Announcing {:?} to {} with capabilities {}",
            self.identity.pretty_name(),
            engine.manager,
            self.capabilities.encode()
        );

        let deadline = self.handshake.begin(std::time::Instant::now());
        engine.notifier.push(Intent::Announce(message))?;

        let deadline = tokio::time::Instant::from_std(deadline);
        let wait = engine.runtime.block_on(engine.gate.next_activation(deadline));

        match wait {
            AnnounceWait::Answered(activation) => self.apply_activation(activation),
            AnnounceWait::Failed(e) => {
                self.handshake.abort();
                self.sync_active();
                Err(e)
            }
            AnnounceWait::TimedOut => {
                let err = self.handshake.expire();
                warn!("{err}");
                self.sync_active();
                Err(err)
            }
        }
    }

    /// Process at most one pending event, waiting up to `timeout` for one.
    ///
    /// # Errors
    ///
    /// Surfaces transport and send errors, a missing handler for a received
    /// command, a late announce rejection, and [`Error::Disconnected`] after
    /// the engine tasks have stopped. None of these stop the engine.
    pub fn check_wait(&mut self, timeout: Duration) -> Result<PollOutcome> {
        let engine = self.engine.as_mut().ok_or(Error::NotInitialized)?;
        let polled = engine.runtime.block_on(engine.gate.next(timeout));

        match polled {
            Polled::Idle => Ok(PollOutcome::Idle),
            Polled::Terminated => {
                info!("Termination requested");
                Ok(PollOutcome::Terminated)
            }
            Polled::Closed => Err(Error::Disconnected),
            Polled::Event(Event::Diagnostic(e)) => Err(e),
            Polled::Event(Event::Inbound(Inbound::Activation(activation))) => self
                .apply_activation(activation)
                .map(|()| PollOutcome::Handled),
            Polled::Event(Event::Inbound(Inbound::Command(command))) => {
                self.handle_command(command)
            }
        }
    }

    /// Process whatever is ready without waiting.
    ///
    /// # Errors
    ///
    /// Same as [`NsmClient::check_wait`].
    pub fn check_no_wait(&mut self) -> Result<PollOutcome> {
        self.check_wait(Duration::ZERO)
    }

    /// Route SIGINT and SIGTERM (Ctrl-C elsewhere) to the termination signal
    /// reported by [`NsmClient::check_wait`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] before `init`, or an I/O error if the
    /// signal handlers cannot be installed.
    pub fn handle_termination_signals(&self) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(Error::NotInitialized)?;
        let trigger = engine.trigger.clone();
        let cancel = engine.cancel.clone();
        let _guard = engine.runtime.enter();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut terminate = signal(SignalKind::terminate())?;
            let mut interrupt = signal(SignalKind::interrupt())?;
            engine.runtime.spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        Some(()) = terminate.recv() => info!("Received SIGTERM"),
                        Some(()) = interrupt.recv() => info!("Received SIGINT"),
                    }
                    trigger.fire();
                }
            });
        }

        #[cfg(not(unix))]
        engine.runtime.spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!("Failed to listen for Ctrl-C: {e}");
                            break;
                        }
                        info!("Received Ctrl-C");
                    }
                }
                trigger.fire();
            }
        });

        Ok(())
    }

    /// Handle for raising the termination signal from host code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] before `init`.
    pub fn termination_trigger(&self) -> Result<TerminationTrigger> {
        Ok(self.engine()?.trigger.clone())
    }

    /// Cloneable handle for status notifications, usable from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] before `init`.
    pub fn notifier(&self) -> Result<Notifier> {
        Ok(self.engine()?.notifier.clone())
    }

    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] before `init`, or
    /// [`Error::SenderClosed`] after the sender has stopped.
    pub fn send_is_dirty(&self) -> Result<()> {
        self.engine()?.notifier.send_is_dirty()
    }

    /// # Errors
    ///
    /// See [`NsmClient::send_is_dirty`].
    pub fn send_is_clean(&self) -> Result<()> {
        self.engine()?.notifier.send_is_clean()
    }

    /// # Errors
    ///
    /// See [`NsmClient::send_is_dirty`].
    pub fn send_gui_shown(&self) -> Result<()> {
        self.engine()?.notifier.send_gui_shown()
    }

    /// # Errors
    ///
    /// See [`NsmClient::send_is_dirty`].
    pub fn send_gui_hidden(&self) -> Result<()> {
        self.engine()?.notifier.send_gui_hidden()
    }

    /// # Errors
    ///
    /// See [`NsmClient::send_is_dirty`].
    pub fn send_progress(&self, progress: f32) -> Result<()> {
        self.engine()?.notifier.send_progress(progress)
    }

    /// # Errors
    ///
    /// See [`NsmClient::send_is_dirty`].
    pub fn send_message(&self, priority: MessagePriority, text: impl Into<String>) -> Result<()> {
        self.engine()?.notifier.send_message(priority, text)
    }

    /// # Errors
    ///
    /// See [`NsmClient::send_is_dirty`].
    pub fn send_label(&self, label: impl Into<String>) -> Result<()> {
        self.engine()?.notifier.send_label(label)
    }

    /// Stop the receiver task. The sender keeps running.
    pub fn cancel_receiver(&self) {
        if let Some(engine) = &self.engine {
            engine.cancel.cancel();
        }
    }

    /// Stop the sender task once it has written everything queued before this call.
    pub fn close_sender(&self) {
        if let Some(engine) = &self.engine {
            if engine.notifier.push(Intent::Close).is_err() {
                debug!("Sender already closed");
            }
        }
    }

    /// Stop both engine tasks and release the transport.
    ///
    /// The client may be initialized again afterwards.
    pub fn stop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        self.cancel_engine(&engine);
        engine.runtime.shutdown_timeout(SHUTDOWN_GRACE);
        self.handshake.abort();
        info!("NSM client stopped");
    }

    fn cancel_engine(&self, engine: &Engine) {
        engine.cancel.cancel();
        if engine.notifier.push(Intent::Close).is_err() {
            debug!("Sender already closed");
        }
        debug!("Stopping NSM engine for {}", self.identity.pretty_name());
    }

    fn engine(&self) -> Result<&Engine> {
        self.engine.as_ref().ok_or(Error::NotInitialized)
    }

    fn sync_active(&self) {
        if let Some(engine) = &self.engine {
            engine
                .active
                .store(self.handshake.is_active(), Ordering::Release);
        }
    }

    fn apply_activation(&mut self, activation: Activation) -> Result<()> {
        let result = self.handshake.apply(activation);
        self.sync_active();
        self.handlers.notify_active(self.handshake.is_active());
        result
    }

    fn handle_command(&mut self, command: Command) -> Result<PollOutcome> {
        debug!("Dispatching {}", command.kind());
        let intents = self
            .handlers
            .dispatch(command)
            .inspect_err(|e| warn!("{e}"))?;

        let notifier = &self.engine()?.notifier;
        for intent in intents {
            notifier.push(intent)?;
        }
        Ok(PollOutcome::Handled)
    }
}

impl std::fmt::Debug for NsmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsmClient")
            .field("identity", &self.identity)
            .field("capabilities", &self.capabilities)
            .field("handshake", &self.handshake)
            .field("handlers", &self.handlers)
            .field("local", &self.local_address())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_endpoint_trims_url() {
        let addr = resolve_endpoint("osc.udp://127.0.0.1:12345/").unwrap();
        assert_eq!(addr, "127.0.0.1:12345".parse().unwrap());

        let addr = resolve_endpoint("127.0.0.1:9").unwrap();
        assert_eq!(addr.port(), 9);
    }

    #[test]
    fn test_resolve_endpoint_prefers_ipv4() {
        let addr = resolve_endpoint("osc.udp://localhost:4000/").unwrap();
        assert_eq!(addr.port(), 4000);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_resolve_endpoint_rejects_garbage() {
        for bad in ["", "osc.udp:///", "osc.udp://no-port/", "not a url"] {
            assert!(
                matches!(resolve_endpoint(bad), Err(Error::InvalidEndpoint(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_operations_before_init() {
        let mut client = NsmClient::new();

        assert!(matches!(client.announce(), Err(Error::NotInitialized)));
        assert!(matches!(
            client.check_wait(Duration::ZERO),
            Err(Error::NotInitialized)
        ));
        assert!(matches!(client.send_is_dirty(), Err(Error::NotInitialized)));
        assert!(matches!(client.notifier(), Err(Error::NotInitialized)));
        assert!(matches!(
            client.handle_termination_signals(),
            Err(Error::NotInitialized)
        ));
        client.stop();
    }

    #[test]
    fn test_init_twice_fails() {
        let mut client = NsmClient::new();
        client.init("osc.udp://127.0.0.1:9/").unwrap();
        assert!(client.local_address().is_some());

        assert!(matches!(
            client.init("osc.udp://127.0.0.1:9/"),
            Err(Error::AlreadyInitialized)
        ));

        client.stop();
        assert!(client.local_address().is_none());
    }

    #[test]
    fn test_capability_setters() {
        let mut client = NsmClient::new();
        client
            .set_client_capabilities(["optional-gui", "dirty"])
            .unwrap();

        assert!(client.client_has_optional_gui());
        assert!(client.has_client_capability("dirty"));
        assert!(client.set_client_capabilities(["bogus"]).is_err());
        assert!(client.has_client_capability("dirty"));
    }

    #[test]
    fn test_from_config() {
        let config = ClientConfig {
            pretty_name: Some("Notes".to_string()),
            capabilities: vec!["dirty".to_string()],
            announce_timeout_ms: 2500,
            ..ClientConfig::default()
        };

        let client = NsmClient::from_config(&config).unwrap();
        assert_eq!(client.identity().pretty_name(), "Notes");
        assert!(client.has_client_capability("dirty"));
        assert_eq!(client.announce_timeout(), Duration::from_millis(2500));
        assert!(!client.is_active());
        assert_eq!(client.handshake_state(), HandshakeState::Unannounced);
    }

    #[test]
    fn test_idle_poll_and_trigger() {
        let mut client = NsmClient::new();
        client.init("osc.udp://127.0.0.1:9/").unwrap();

        for _ in 0..3 {
            assert_eq!(client.check_no_wait().unwrap(), PollOutcome::Idle);
        }

        client.termination_trigger().unwrap().fire();
        assert_eq!(client.check_no_wait().unwrap(), PollOutcome::Terminated);
        assert_eq!(client.check_no_wait().unwrap(), PollOutcome::Idle);

        client.stop();
    }
}
