//! End-to-end tests against a simulated session manager.
//!
//! The fake manager is a plain blocking UDP socket on localhost that speaks
//! OSC through the crate's own codec. The client under test runs on the test
//! thread, exactly like a host application would drive it.

#![allow(clippy::float_cmp)] // Exact float comparisons are intentional in tests

use std::cell::RefCell;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use nsm_client::protocol::{
    ADDR_CLIENT_IS_CLEAN, ADDR_CLIENT_IS_DIRTY, ADDR_CLIENT_LABEL, ADDR_CLIENT_MESSAGE,
    ADDR_CLIENT_OPEN, ADDR_CLIENT_PROGRESS, ADDR_CLIENT_SAVE, ADDR_CLIENT_SESSION_IS_LOADED,
    ADDR_ERROR, ADDR_REPLY, ADDR_SERVER_ANNOUNCE, CommandKind,
};
use nsm_client::{
    CallbackError, Error, ErrorCode, HandshakeState, MessagePriority, NsmClient, OscCodec,
    OscMessage, PollOutcome,
};
use tokio_util::codec::{Decoder, Encoder};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

/// A session manager that answers from a blocking socket.
struct FakeManager {
    socket: UdpSocket,
    client: Option<SocketAddr>,
}

impl FakeManager {
    fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        Self {
            socket,
            client: None,
        }
    }

    fn url(&self) -> String {
        format!("osc.udp://{}/", self.socket.local_addr().unwrap())
    }

    fn address(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn try_recv(&mut self, timeout: Duration) -> Option<OscMessage> {
        self.socket.set_read_timeout(Some(timeout)).unwrap();
        let mut buf = [0u8; 65_536];
        match self.socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                self.client = Some(from);
                let mut packet = BytesMut::from(&buf[..n]);
                Some(OscCodec::new().decode(&mut packet).unwrap().unwrap())
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => None,
            Err(e) => panic!("recv failed: {e}"),
        }
    }

    fn recv(&mut self) -> OscMessage {
        self.try_recv(WAIT).expect("manager timed out waiting for the client")
    }

    fn send(&self, msg: OscMessage) {
        let to = self.client.expect("client address unknown");
        let mut buf = BytesMut::new();
        OscCodec::new().encode(msg, &mut buf).unwrap();
        self.socket.send_to(&buf, to).unwrap();
    }

    fn assert_quiet(&mut self) {
        if let Some(msg) = self.try_recv(QUIET) {
            panic!("unexpected message from client: {msg}");
        }
    }
}

fn announce_reply(capabilities: &str) -> OscMessage {
    OscMessage::new(ADDR_REPLY)
        .with_arg(ADDR_SERVER_ANNOUNCE)
        .with_arg("Howdy, what took you so long?")
        .with_arg("fake-nsmd")
        .with_arg(capabilities)
}

/// Run `script` on a manager thread and hand the manager back when it is done.
fn spawn_manager<F>(mut manager: FakeManager, script: F) -> JoinHandle<FakeManager>
where
    F: FnOnce(&mut FakeManager) + Send + 'static,
{
    thread::spawn(move || {
        script(&mut manager);
        manager
    })
}

fn new_client(manager: &FakeManager) -> NsmClient {
    let mut client = NsmClient::new();
    client.set_pretty_name("Notes").unwrap();
    client.set_announce_timeout(WAIT);
    client.init(&manager.url()).unwrap();
    client
}

/// Complete a successful handshake and return the manager.
fn activate(client: &mut NsmClient, manager: FakeManager) -> FakeManager {
    let handle = spawn_manager(manager, |m| {
        let announce = m.recv();
        assert_eq!(announce.address, ADDR_SERVER_ANNOUNCE);
        m.send(announce_reply(":server-control:broadcast:"));
    });
    client.announce().unwrap();
    handle.join().unwrap()
}

#[test]
fn test_handshake_success() {
    let manager = FakeManager::new();
    let manager_addr = manager.address();

    let mut client = new_client(&manager);
    client
        .set_client_capabilities(["dirty", "optional-gui"])
        .unwrap();

    let handle = spawn_manager(manager, |m| {
        let announce = m.recv();
        assert_eq!(announce.address, ADDR_SERVER_ANNOUNCE);
        assert_eq!(announce.type_tags(), ",sssiii");
        assert_eq!(announce.string_arg(0), Some("Notes"));
        assert_eq!(announce.string_arg(1), Some(":optional-gui:dirty:"));
        assert_eq!(announce.int_arg(3), Some(1));
        assert_eq!(announce.int_arg(4), Some(0));
        assert_eq!(
            announce.int_arg(5),
            Some(i32::try_from(std::process::id()).unwrap())
        );
        m.send(announce_reply(":server-control:broadcast:"));
    });

    client.announce().unwrap();
    handle.join().unwrap();

    assert!(client.is_active());
    assert_eq!(client.handshake_state(), HandshakeState::Active);
    assert_eq!(client.manager_name(), "fake-nsmd");
    assert!(client.manager_has_server_control());
    assert!(client.manager_has_broadcast());
    assert!(!client.manager_has_optional_gui());
    assert!(client.has_manager_capability("broadcast"));
    assert_eq!(client.manager_address(), Some(manager_addr));

    assert!(matches!(
        client.set_pretty_name("Renamed"),
        Err(Error::AlreadyAnnounced)
    ));
    client.stop();
}

#[test]
fn test_handshake_rejected_with_code() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);

    let handle = spawn_manager(manager, |m| {
        m.recv();
        m.send(
            OscMessage::new(ADDR_ERROR)
                .with_arg(ADDR_SERVER_ANNOUNCE)
                .with_arg(ErrorCode::IncompatibleApi.code())
                .with_arg("Incompatible API version"),
        );
    });

    let err = client.announce().unwrap_err();
    handle.join().unwrap();

    assert!(matches!(
        err,
        Error::HandshakeRejected {
            code: Some(ErrorCode::IncompatibleApi),
            ref reason,
        } if reason == "Incompatible API version"
    ));
    assert!(!client.is_active());
    assert_eq!(client.handshake_state(), HandshakeState::Inactive);
    client.stop();
}

#[test]
fn test_handshake_rejected_with_name() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);

    let handle = spawn_manager(manager, |m| {
        m.recv();
        m.send(
            OscMessage::new(ADDR_ERROR)
                .with_arg(ADDR_SERVER_ANNOUNCE)
                .with_arg("fake-nsmd")
                .with_arg("Go away"),
        );
    });

    let err = client.announce().unwrap_err();
    handle.join().unwrap();

    assert!(matches!(err, Error::HandshakeRejected { code: None, .. }));
    assert!(!client.is_active());
    client.stop();
}

#[test]
fn test_handshake_timeout() {
    let mut manager = FakeManager::new();
    let mut client = new_client(&manager);
    client.set_announce_timeout(Duration::from_millis(150));

    let err = client.announce().unwrap_err();

    assert!(matches!(err, Error::HandshakeTimeout(t) if t == Duration::from_millis(150)));
    assert!(!client.is_active());
    assert_eq!(client.handshake_state(), HandshakeState::Inactive);

    // The announce still went out.
    assert_eq!(manager.recv().address, ADDR_SERVER_ANNOUNCE);
    client.stop();
}

#[test]
fn test_reannounce_after_timeout() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);
    client.set_announce_timeout(Duration::from_millis(100));
    assert!(client.announce().is_err());

    client.set_announce_timeout(WAIT);
    let handle = spawn_manager(manager, |m| {
        // First announce, then the retry.
        m.recv();
        let retry = m.recv();
        assert_eq!(retry.address, ADDR_SERVER_ANNOUNCE);
        m.send(announce_reply(":"));
    });

    client.announce().unwrap();
    handle.join().unwrap();
    assert!(client.is_active());
    client.stop();
}

#[test]
fn test_open_with_wrong_arity_never_reaches_handler() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);

    let opened = Rc::new(RefCell::new(Vec::new()));
    let opened_clone = Rc::clone(&opened);
    client.on_open(move |request| {
        opened_clone.borrow_mut().push(request.clone());
        Ok(())
    });

    let mut manager = activate(&mut client, manager);

    manager.send(
        OscMessage::new(ADDR_CLIENT_OPEN)
            .with_arg("/sessions/demo/Notes.nABCD")
            .with_arg("Notes"),
    );
    assert_eq!(client.check_wait(QUIET).unwrap(), PollOutcome::Idle);
    assert!(opened.borrow().is_empty());
    manager.assert_quiet();

    manager.send(
        OscMessage::new(ADDR_CLIENT_OPEN)
            .with_arg("/sessions/demo/Notes.nABCD")
            .with_arg("Notes")
            .with_arg("nABCD"),
    );
    assert_eq!(client.check_wait(WAIT).unwrap(), PollOutcome::Handled);

    assert_eq!(opened.borrow().len(), 1);
    assert_eq!(opened.borrow()[0].client_id, "nABCD");

    let reply = manager.recv();
    assert_eq!(reply.address, ADDR_REPLY);
    assert_eq!(reply.string_arg(0), Some(ADDR_CLIENT_OPEN));
    assert_eq!(reply.string_arg(1), Some("Ok"));
    client.stop();
}

#[test]
fn test_open_failure_sends_error_reply() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);
    client.on_open(|_| {
        Err(CallbackError::with_code(
            ErrorCode::BadProject,
            "project is corrupt",
        ))
    });

    let mut manager = activate(&mut client, manager);
    manager.send(
        OscMessage::new(ADDR_CLIENT_OPEN)
            .with_arg("/sessions/demo/Notes.nABCD")
            .with_arg("Notes")
            .with_arg("nABCD"),
    );
    assert_eq!(client.check_wait(WAIT).unwrap(), PollOutcome::Handled);

    let reply = manager.recv();
    assert_eq!(reply.address, ADDR_ERROR);
    assert_eq!(reply.string_arg(0), Some(ADDR_CLIENT_OPEN));
    assert_eq!(reply.int_arg(1), Some(-9));
    assert_eq!(reply.string_arg(2), Some("project is corrupt"));
    client.stop();
}

#[test]
fn test_save_replies_then_marks_clean() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);

    let saves = Rc::new(RefCell::new(0));
    let saves_clone = Rc::clone(&saves);
    client.on_save(move || {
        *saves_clone.borrow_mut() += 1;
        Ok(())
    });

    let mut manager = activate(&mut client, manager);
    manager.send(OscMessage::new(ADDR_CLIENT_SAVE));
    assert_eq!(client.check_wait(WAIT).unwrap(), PollOutcome::Handled);
    assert_eq!(*saves.borrow(), 1);

    let reply = manager.recv();
    assert_eq!(reply.address, ADDR_REPLY);
    assert_eq!(reply.string_arg(0), Some(ADDR_CLIENT_SAVE));
    assert_eq!(manager.recv().address, ADDR_CLIENT_IS_CLEAN);
    client.stop();
}

#[test]
fn test_failed_save_is_not_clean() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);
    client.on_save(|| Err(CallbackError::new("disk full")));

    let mut manager = activate(&mut client, manager);
    manager.send(OscMessage::new(ADDR_CLIENT_SAVE));
    assert_eq!(client.check_wait(WAIT).unwrap(), PollOutcome::Handled);

    let reply = manager.recv();
    assert_eq!(reply.address, ADDR_ERROR);
    assert_eq!(reply.int_arg(1), Some(-1));
    assert_eq!(reply.string_arg(2), Some("disk full"));
    manager.assert_quiet();
    client.stop();
}

#[test]
fn test_missing_handler_is_reported_without_reply() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);

    let mut manager = activate(&mut client, manager);
    manager.send(OscMessage::new(ADDR_CLIENT_SAVE));

    let err = client.check_wait(WAIT).unwrap_err();
    assert!(matches!(err, Error::CallbackNotRegistered(CommandKind::Save)));
    manager.assert_quiet();

    // The engine keeps running.
    assert_eq!(client.check_no_wait().unwrap(), PollOutcome::Idle);
    client.stop();
}

#[test]
fn test_dirty_is_gated_on_activation() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);

    client.send_is_dirty().unwrap();

    let handle = spawn_manager(manager, |m| {
        // The dirty notification queued before the handshake never arrives.
        assert_eq!(m.recv().address, ADDR_SERVER_ANNOUNCE);
        m.send(announce_reply(":"));
    });
    client.announce().unwrap();
    let mut manager = handle.join().unwrap();
    manager.assert_quiet();

    client.send_is_dirty().unwrap();
    assert_eq!(manager.recv().address, ADDR_CLIENT_IS_DIRTY);
    manager.assert_quiet();
    client.stop();
}

#[test]
fn test_status_notifications() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);
    let mut manager = activate(&mut client, manager);

    let notifier = client.notifier().unwrap();
    let worker = thread::spawn(move || {
        notifier.send_progress(0.5).unwrap();
        notifier
            .send_message(MessagePriority::High, "Rendering")
            .unwrap();
        notifier.send_label("Take 3").unwrap();
    });
    worker.join().unwrap();

    let progress = manager.recv();
    assert_eq!(progress.address, ADDR_CLIENT_PROGRESS);
    assert_eq!(progress.float_arg(0), Some(0.5));

    let message = manager.recv();
    assert_eq!(message.address, ADDR_CLIENT_MESSAGE);
    assert_eq!(message.int_arg(0), Some(3));
    assert_eq!(message.string_arg(1), Some("Rendering"));

    let label = manager.recv();
    assert_eq!(label.address, ADDR_CLIENT_LABEL);
    assert_eq!(label.string_arg(0), Some("Take 3"));
    client.stop();
}

#[test]
fn test_idle_poll_is_repeatable() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);

    for _ in 0..5 {
        assert_eq!(
            client.check_wait(Duration::ZERO).unwrap(),
            PollOutcome::Idle
        );
    }
    client.stop();
}

#[test]
fn test_termination_reported_once() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);
    client.handle_termination_signals().unwrap();

    client.termination_trigger().unwrap().fire();

    assert_eq!(client.check_wait(WAIT).unwrap(), PollOutcome::Terminated);
    assert_eq!(client.check_no_wait().unwrap(), PollOutcome::Idle);
    client.stop();
}

#[test]
fn test_command_during_announce_is_delivered_later() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);

    let loaded = Rc::new(RefCell::new(false));
    let loaded_clone = Rc::clone(&loaded);
    client.on_session_is_loaded(move || {
        *loaded_clone.borrow_mut() = true;
        Ok(())
    });

    let handle = spawn_manager(manager, |m| {
        m.recv();
        m.send(OscMessage::new(ADDR_CLIENT_SESSION_IS_LOADED));
        m.send(announce_reply(":"));
    });
    client.announce().unwrap();
    handle.join().unwrap();

    assert!(client.is_active());
    assert!(!*loaded.borrow());

    assert_eq!(client.check_wait(WAIT).unwrap(), PollOutcome::Handled);
    assert!(*loaded.borrow());
    client.stop();
}

#[test]
fn test_active_handler_sees_activation() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);

    let states = Rc::new(RefCell::new(Vec::new()));
    let states_clone = Rc::clone(&states);
    client.on_active(move |active| states_clone.borrow_mut().push(active));

    let _manager = activate(&mut client, manager);
    assert_eq!(*states.borrow(), vec![true]);
    client.stop();
}

#[test]
fn test_malformed_datagram_is_dropped() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);
    client.on_save(|| Ok(()));
    let mut manager = activate(&mut client, manager);

    let to = manager.client.unwrap();
    manager.socket.send_to(b"garbage", to).unwrap();
    manager.send(OscMessage::new(ADDR_CLIENT_SAVE));

    assert_eq!(client.check_wait(WAIT).unwrap(), PollOutcome::Handled);
    assert_eq!(manager.recv().address, ADDR_REPLY);
    client.stop();
}

#[test]
fn test_commands_from_other_senders_are_ignored() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);

    let saves = Rc::new(RefCell::new(0));
    let saves_clone = Rc::clone(&saves);
    client.on_save(move || {
        *saves_clone.borrow_mut() += 1;
        Ok(())
    });
    let mut manager = activate(&mut client, manager);

    let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut buf = BytesMut::new();
    OscCodec::new()
        .encode(OscMessage::new(ADDR_CLIENT_SAVE), &mut buf)
        .unwrap();
    let port = client.local_address().unwrap().port();
    stranger.send_to(&buf, ("127.0.0.1", port)).unwrap();

    assert_eq!(client.check_wait(QUIET).unwrap(), PollOutcome::Idle);
    assert_eq!(*saves.borrow(), 0);
    manager.assert_quiet();

    manager.send(OscMessage::new(ADDR_CLIENT_SAVE));
    assert_eq!(client.check_wait(WAIT).unwrap(), PollOutcome::Handled);
    assert_eq!(*saves.borrow(), 1);
    client.stop();
}

#[test]
fn test_unbounded_announce_timeout_still_handshakes() {
    let manager = FakeManager::new();
    let mut client = new_client(&manager);
    client.set_announce_timeout(Duration::MAX);

    let _manager = activate(&mut client, manager);
    assert!(client.is_active());
    client.stop();
}
