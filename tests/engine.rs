//! End-to-end engine scenarios against a fake host.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use tidings::client::{
    AckHandle, InvalidationClient, InvalidationListener, InvalidationSection, ProtoLimits,
    RegistrationStatus, ServerHeader, ServerMessage, StateWriteError, SystemResources,
    TokenControl, TokenStatus, WireInvalidation, decode_client_message, encode_server_message,
};
use tidings::{
    ApplicationClientId, ClientConfig, ClientToken, Invalidation, Nonce, ObjectId, RegOpKind,
    RegistrationState, ThrottleRule,
};

#[derive(Default)]
struct ResourcesInner {
    now_ms: u64,
    sent: Vec<(u64, Bytes)>,
    stored: Option<Bytes>,
}

#[derive(Clone, Default)]
struct FakeResources {
    inner: Rc<RefCell<ResourcesInner>>,
}

impl SystemResources for FakeResources {
    fn now_ms(&self) -> u64 {
        self.inner.borrow().now_ms
    }

    fn send(&mut self, bytes: Bytes) {
        let now = self.inner.borrow().now_ms;
        self.inner.borrow_mut().sent.push((now, bytes));
    }

    fn read_state(&mut self) -> Option<Bytes> {
        self.inner.borrow().stored.clone()
    }

    fn write_state(&mut self, bytes: Bytes) -> Result<(), StateWriteError> {
        self.inner.borrow_mut().stored = Some(bytes);
        Ok(())
    }

    fn delete_state(&mut self) {
        self.inner.borrow_mut().stored = None;
    }
}

#[derive(Debug, PartialEq)]
enum Event {
    Ready,
    Invalidate(Invalidation),
    InvalidateUnknown(ObjectId),
    InvalidateAll,
    Status(ObjectId, RegistrationState),
    Failure(ObjectId, bool),
    Lost,
    Reissue,
    Error(String),
}

#[derive(Default)]
struct ListenerInner {
    events: Vec<Event>,
    handles: Vec<AckHandle>,
}

#[derive(Clone, Default)]
struct RecordingListener {
    inner: Rc<RefCell<ListenerInner>>,
}

impl InvalidationListener for RecordingListener {
    fn ready(&mut self) {
        self.inner.borrow_mut().events.push(Event::Ready);
    }

    fn invalidate(&mut self, invalidation: Invalidation, ack: AckHandle) {
        let mut inner = self.inner.borrow_mut();
        inner.events.push(Event::Invalidate(invalidation));
        inner.handles.push(ack);
    }

    fn invalidate_unknown_version(&mut self, object: ObjectId, ack: AckHandle) {
        let mut inner = self.inner.borrow_mut();
        inner.events.push(Event::InvalidateUnknown(object));
        inner.handles.push(ack);
    }

    fn invalidate_all(&mut self, ack: AckHandle) {
        let mut inner = self.inner.borrow_mut();
        inner.events.push(Event::InvalidateAll);
        inner.handles.push(ack);
    }

    fn registration_status(&mut self, object: ObjectId, state: RegistrationState) {
        self.inner
            .borrow_mut()
            .events
            .push(Event::Status(object, state));
    }

    fn registration_failure(&mut self, object: ObjectId, is_transient: bool, _reason: &str) {
        self.inner
            .borrow_mut()
            .events
            .push(Event::Failure(object, is_transient));
    }

    fn registrations_lost(&mut self) {
        self.inner.borrow_mut().events.push(Event::Lost);
    }

    fn reissue_registrations(&mut self, _prefix: &[u8], _prefix_len: usize) {
        self.inner.borrow_mut().events.push(Event::Reissue);
    }

    fn inform_error(&mut self, reason: &str) {
        self.inner
            .borrow_mut()
            .events
            .push(Event::Error(reason.to_string()));
    }
}

type TestClient = InvalidationClient<RecordingListener, FakeResources>;

struct Harness {
    client: TestClient,
    resources: Rc<RefCell<ResourcesInner>>,
    listener: Rc<RefCell<ListenerInner>>,
}

impl Harness {
    fn new(config: ClientConfig) -> Self {
        Self::with_stored(config, None)
    }

    fn with_stored(config: ClientConfig, stored: Option<Bytes>) -> Self {
        let resources = FakeResources::default();
        resources.inner.borrow_mut().now_ms = 1_000;
        resources.inner.borrow_mut().stored = stored;
        let listener = RecordingListener::default();
        let inner_res = resources.inner.clone();
        let inner_listener = listener.inner.clone();
        let client = InvalidationClient::new(
            config,
            ApplicationClientId::new(7, &b"test-app"[..]),
            listener,
            resources,
        )
        .unwrap();
        Self {
            client,
            resources: inner_res,
            listener: inner_listener,
        }
    }

    fn now(&self) -> u64 {
        self.resources.borrow().now_ms
    }

    /// Runs due operations, moving the virtual clock deadline by deadline,
    /// for at most `window_ms` of virtual time.
    fn pump(&mut self, window_ms: u64) {
        let cap = self.now() + window_ms;
        for _ in 0..10_000 {
            let Some(next) = self.client.next_deadline_ms() else {
                break;
            };
            if next > cap {
                break;
            }
            {
                let mut inner = self.resources.borrow_mut();
                if next > inner.now_ms {
                    inner.now_ms = next;
                }
            }
            self.client.advance();
        }
    }

    fn sent_count(&self) -> usize {
        self.resources.borrow().sent.len()
    }

    fn sent_message(&self, index: usize) -> (u64, tidings::client::ClientMessage) {
        let (at, bytes) = self.resources.borrow().sent[index].clone();
        let msg = decode_client_message(&bytes, &ProtoLimits::default()).unwrap();
        (at, msg)
    }

    fn last_message(&self) -> (u64, tidings::client::ClientMessage) {
        self.sent_message(self.sent_count() - 1)
    }

    fn sent_messages(&self) -> Vec<(u64, tidings::client::ClientMessage)> {
        (0..self.sent_count()).map(|i| self.sent_message(i)).collect()
    }

    /// First sent message (in send order) matching `pred`.
    fn find_message(
        &self,
        pred: impl Fn(&tidings::client::ClientMessage) -> bool,
    ) -> Option<(u64, tidings::client::ClientMessage)> {
        self.sent_messages().into_iter().find(|(_, msg)| pred(msg))
    }

    fn deliver(&mut self, msg: &ServerMessage) {
        let bytes = encode_server_message(msg).unwrap();
        self.client.receive(&bytes);
    }

    fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut self.listener.borrow_mut().events)
    }

    fn take_handles(&self) -> Vec<AckHandle> {
        std::mem::take(&mut self.listener.borrow_mut().handles)
    }

    /// Drives the handshake to a running session with token `tok`. The
    /// pump window stays under the initialize-retry delay so the first
    /// nonce is still live when the response arrives.
    fn establish(&mut self, tok: &'static [u8]) -> Nonce {
        self.client.start();
        self.pump(1_000);
        assert_eq!(self.sent_count(), 1, "expected exactly one initialize");
        let (_, init) = self.sent_message(0);
        let nonce = init.initialize.as_ref().unwrap().nonce;
        assert!(init.header.client_token.is_none());
        self.deliver(&server_msg(|msg| {
            msg.token_control = Some(TokenControl {
                new_token: Some(token(tok)),
                nonce: Some(nonce),
                status: TokenStatus::Success,
            });
        }));
        assert_eq!(self.take_events(), vec![Event::Ready]);
        nonce
    }
}

fn token(raw: &'static [u8]) -> ClientToken {
    ClientToken::new(Bytes::from_static(raw)).unwrap()
}

fn oid(name: &'static [u8]) -> ObjectId {
    ObjectId::new(3, Bytes::from_static(name)).unwrap()
}

fn server_msg(build: impl FnOnce(&mut ServerMessage)) -> ServerMessage {
    let mut msg = ServerMessage {
        header: ServerHeader {
            server_time_ms: 50,
            ..ServerHeader::default()
        },
        ..ServerMessage::default()
    };
    build(&mut msg);
    msg
}

fn wire(object: ObjectId, version: i64, known: bool) -> WireInvalidation {
    WireInvalidation {
        invalidation: Invalidation::new(object, version).unwrap(),
        known_version: known,
    }
}

#[test]
fn initialization_handshake() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");

    // The next outbound message carries the assigned token.
    h.client.register(oid(b"x"));
    h.pump(5_000);
    let (_, msg) = h.last_message();
    assert_eq!(msg.header.client_token, Some(token(b"T1")));
    assert!(msg.initialize.is_none());
}

#[test]
fn register_then_confirm_then_quiet_heartbeat() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");

    let x = oid(b"x");
    h.client.register(x.clone());
    h.pump(5_000);
    let (_, msg) = h
        .find_message(|m| !m.registrations.is_empty())
        .expect("registration message never sent");
    assert_eq!(msg.registrations.len(), 1);
    assert_eq!(msg.registrations[0].object, x);
    assert_eq!(msg.registrations[0].kind, RegOpKind::Register);
    assert_eq!(msg.header.registration_summary.num_registrations(), 1);

    h.deliver(&server_msg(|m| {
        m.registration_statuses = vec![RegistrationStatus {
            op: msg.registrations[0].clone(),
            status: tidings::core::StatusCode::Success,
            description: None,
        }];
    }));
    assert_eq!(
        h.take_events(),
        vec![Event::Status(x, RegistrationState::Registered)]
    );

    // Nothing further pending: the next message (a heartbeat, at most
    // 1.2x the nominal interval away) carries zero registration ops.
    let before = h.sent_count();
    h.pump(30 * 60 * 1000);
    assert!(h.sent_count() > before, "heartbeat never fired");
    for i in before..h.sent_count() {
        let (_, msg) = h.sent_message(i);
        assert!(msg.registrations.is_empty());
    }
}

#[test]
fn register_unregister_coalesce_to_latest_intent() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");

    let x = oid(b"x");
    h.client.register(x.clone());
    h.client.unregister(x.clone());
    h.pump(5_000);
    let all_ops: Vec<_> = h
        .sent_messages()
        .into_iter()
        .flat_map(|(_, msg)| msg.registrations)
        .collect();
    assert_eq!(all_ops.len(), 1, "intents must coalesce into one op");
    assert_eq!(all_ops[0].object, x);
    assert_eq!(all_ops[0].kind, RegOpKind::Unregister);
    let (_, last) = h.last_message();
    assert_eq!(last.header.registration_summary.num_registrations(), 0);
}

#[test]
fn auth_failure_reinitializes_with_fresh_nonce() {
    let mut h = Harness::new(ClientConfig::default());
    let first_nonce = h.establish(b"T1");

    h.deliver(&server_msg(|m| {
        m.token_control = Some(TokenControl {
            new_token: None,
            nonce: None,
            status: TokenStatus::AuthFailure,
        });
    }));
    let events = h.take_events();
    assert_eq!(events, vec![Event::Lost, Event::Reissue]);

    let before = h.sent_count();
    h.pump(10_000);
    assert!(h.sent_count() > before, "re-initialize never sent");
    let (_, msg) = h.sent_message(before);
    let init = msg.initialize.expect("expected an initialize message");
    assert_ne!(init.nonce, first_nonce);
    assert!(msg.header.client_token.is_none());
    // Persisted identity was erased with the token.
    assert!(h.resources.borrow().stored.is_none());
}

#[test]
fn invalidation_ack_waits_for_application() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");
    let x = oid(b"x");

    h.deliver(&server_msg(|m| {
        m.invalidations = Some(InvalidationSection {
            invalidate_all: false,
            invalidations: vec![wire(x.clone(), 7, true)],
        });
    }));
    let events = h.take_events();
    assert_eq!(
        events,
        vec![Event::Invalidate(Invalidation::new(x.clone(), 7).unwrap())]
    );
    let mut handles = h.take_handles();
    assert_eq!(handles.len(), 1);

    // No ack flows before the application acknowledges.
    let before = h.sent_count();
    h.pump(5_000);
    for i in before..h.sent_count() {
        let (_, msg) = h.sent_message(i);
        assert!(msg.invalidation_acks.is_empty());
    }

    h.client.acknowledge(handles.pop().unwrap());
    h.pump(5_000);
    let (_, msg) = h
        .find_message(|m| !m.invalidation_acks.is_empty())
        .expect("ack message never sent");
    assert_eq!(msg.invalidation_acks.len(), 1);
    assert_eq!(
        msg.invalidation_acks[0].invalidation,
        Invalidation::new(x, 7).unwrap()
    );
}

#[test]
fn throttler_defers_rapid_sends() {
    let config = ClientConfig {
        throttle_rules: vec![ThrottleRule {
            window_ms: 1_000,
            max_count: 1,
        }],
        ..ClientConfig::default()
    };
    let mut h = Harness::new(config);
    h.establish(b"T1");

    h.client.register(oid(b"a"));
    h.pump(5_000);
    let (first_at, _) = h.last_message();
    let sent_after_first = h.sent_count();

    // A burst of work right behind the previous send must coalesce into
    // one deferred message, no earlier than a full window later.
    for name in [&b"b"[..], b"c", b"d", b"e"] {
        h.client.register(ObjectId::new(3, Bytes::copy_from_slice(name)).unwrap());
    }
    h.pump(10_000);
    assert_eq!(h.sent_count(), sent_after_first + 1);
    let (second_at, msg) = h.last_message();
    assert!(
        second_at >= first_at + 1_000,
        "deferred send at {second_at}, first at {first_at}"
    );
    assert_eq!(msg.registrations.len(), 4);
    assert!(h.client.statistics().throttled_sends >= 1);
}

#[test]
fn unknown_version_and_invalidate_all_ack_independently() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");
    let x = oid(b"x");

    h.deliver(&server_msg(|m| {
        m.invalidations = Some(InvalidationSection {
            invalidate_all: true,
            invalidations: vec![wire(x.clone(), 9, false)],
        });
    }));
    assert_eq!(
        h.take_events(),
        vec![Event::InvalidateAll, Event::InvalidateUnknown(x.clone())]
    );
    let handles = h.take_handles();
    assert_eq!(handles.len(), 2);

    for handle in handles {
        h.client.acknowledge(handle);
    }
    h.pump(5_000);
    let (_, msg) = h
        .find_message(|m| !m.invalidation_acks.is_empty())
        .expect("ack message never sent");
    // Invalidate-all has nothing to echo; the unknown-version ack keeps
    // its flag.
    assert_eq!(msg.invalidation_acks.len(), 1);
    assert!(!msg.invalidation_acks[0].known_version);
}

#[test]
fn nonce_mismatch_leaves_handshake_pending() {
    let mut h = Harness::new(ClientConfig::default());
    h.client.start();
    h.pump(1_000);
    let (_, init) = h.sent_message(0);
    assert!(init.initialize.is_some());

    h.deliver(&server_msg(|m| {
        m.token_control = Some(TokenControl {
            new_token: Some(token(b"EVIL")),
            nonce: Some(Nonce::from_bytes(&[0xde; 8]).unwrap()),
            status: TokenStatus::Success,
        });
    }));
    assert!(h.take_events().is_empty(), "mismatched nonce must be dropped");

    // The real response still lands.
    let nonce = init.initialize.unwrap().nonce;
    h.deliver(&server_msg(|m| {
        m.token_control = Some(TokenControl {
            new_token: Some(token(b"T1")),
            nonce: Some(nonce),
            status: TokenStatus::Success,
        });
    }));
    assert_eq!(h.take_events(), vec![Event::Ready]);
}

#[test]
fn foreign_token_messages_are_dropped() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");

    let mut msg = server_msg(|m| {
        m.invalidations = Some(InvalidationSection {
            invalidate_all: false,
            invalidations: vec![wire(oid(b"x"), 1, true)],
        });
    });
    msg.header.client_token = Some(token(b"SOMEONE-ELSE"));
    h.deliver(&msg);
    assert!(h.take_events().is_empty());
    assert_eq!(h.client.statistics().token_mismatches, 1);
    assert_eq!(h.client.statistics().incoming_dropped, 1);
}

#[test]
fn message_ids_survive_restart() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");
    h.client.register(oid(b"x"));
    h.pump(5_000);
    let (_, last) = h.last_message();
    let last_id = last.header.message_id;
    let stored = h.resources.borrow().stored.clone();
    assert!(stored.is_some());
    h.client.stop();

    let mut restarted = Harness::with_stored(ClientConfig::default(), stored);
    restarted.client.start();
    // Restored identity: ready without a handshake.
    assert_eq!(restarted.take_events(), vec![Event::Ready]);
    restarted.client.register(oid(b"y"));
    restarted.pump(5_000);
    let (_, msg) = restarted.last_message();
    assert!(msg.initialize.is_none());
    assert_eq!(msg.header.client_token, Some(token(b"T1")));
    assert!(
        msg.header.message_id > last_id,
        "id {} does not continue past {last_id}",
        msg.header.message_id
    );
}

#[test]
fn tampered_persistence_restarts_unassigned() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");
    h.pump(5_000);
    let mut stored = h.resources.borrow().stored.clone().unwrap().to_vec();
    let last = stored.len() - 1;
    stored[last] ^= 0xff;
    h.client.stop();

    let mut restarted =
        Harness::with_stored(ClientConfig::default(), Some(Bytes::from(stored)));
    restarted.client.start();
    assert!(restarted.take_events().is_empty());
    restarted.pump(5_000);
    let (_, msg) = restarted.sent_message(0);
    assert!(msg.initialize.is_some(), "corrupt state must re-initialize");
}

#[test]
fn server_can_shorten_heartbeats_from_next_fire() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");

    // Override before the initial heartbeat has fired.
    h.deliver(&server_msg(|m| {
        m.header.next_heartbeat_interval_ms = Some(10_000);
    }));
    let start = h.now();
    h.pump(60_000);
    let sent: Vec<(u64, tidings::client::ClientMessage)> =
        (0..h.sent_count()).map(|i| h.sent_message(i)).collect();
    let heartbeats: Vec<u64> = sent
        .iter()
        .filter(|(at, msg)| *at > start && msg.is_header_only())
        .map(|(at, _)| *at)
        .collect();
    assert!(
        heartbeats.len() >= 2,
        "expected several shortened heartbeats, got {heartbeats:?}"
    );
    let gap = heartbeats[1] - heartbeats[0];
    assert!(
        gap <= 13_000,
        "heartbeat gap {gap} not shortened to the new interval"
    );
}

#[test]
fn stale_token_refreshes_without_dropping_intent() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");
    h.client.register(oid(b"x"));

    h.deliver(&server_msg(|m| {
        m.token_control = Some(TokenControl {
            new_token: None,
            nonce: None,
            status: TokenStatus::TransientFailure,
        });
    }));
    // A refresh request goes out; nothing is lost yet.
    let before = h.sent_count();
    h.pump(1_500);
    assert!(h.sent_count() > before, "refresh initialize never sent");
    let (_, refresh) = h.sent_message(before);
    assert!(refresh.initialize.is_some());
    assert!(refresh.header.client_token.is_none());
    assert!(h.take_events().is_empty());

    // The replacement token arrives; only now does the old session die.
    let nonce = refresh.initialize.unwrap().nonce;
    h.deliver(&server_msg(|m| {
        m.token_control = Some(TokenControl {
            new_token: Some(token(b"T2")),
            nonce: Some(nonce),
            status: TokenStatus::Success,
        });
    }));
    assert_eq!(h.take_events(), vec![Event::Lost, Event::Reissue]);

    h.client.register(oid(b"y"));
    h.pump(5_000);
    let (_, msg) = h
        .find_message(|m| m.header.client_token == Some(token(b"T2")))
        .expect("no message under the replacement token");
    assert!(msg.initialize.is_none());
}

#[test]
fn sync_request_reannounces_desired_set() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");
    h.client.register(oid(b"x"));
    h.client.register(oid(b"y"));
    h.pump(5_000);

    h.deliver(&server_msg(|m| {
        m.sync_request = true;
    }));
    h.pump(5_000);
    let (_, msg) = h.last_message();
    assert_eq!(msg.sync_subtrees.len(), 1);
    assert_eq!(msg.sync_subtrees[0].objects, vec![oid(b"x"), oid(b"y")]);
}

#[test]
fn info_request_reports_counters_and_config() {
    let mut h = Harness::new(ClientConfig::default());
    h.establish(b"T1");

    h.deliver(&server_msg(|m| {
        m.info_request = vec![tidings::client::InfoType::PerformanceCounters];
    }));
    h.pump(5_000);
    let (_, msg) = h
        .find_message(|m| m.info.is_some())
        .expect("info message never sent");
    let info = msg.info.expect("expected an info message");
    assert!(
        info.performance_counters
            .iter()
            .any(|(name, value)| name == "sent_messages" && *value >= 1)
    );
    assert!(
        info.config_params
            .iter()
            .any(|(name, value)| name == "batching_delay_ms" && *value == 500)
    );
}
