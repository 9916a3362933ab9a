//! End-to-end call flow tests: two (or three) full services wired over
//! an in-process signaling hub with deterministic loopback transports.

#![allow(clippy::unwrap_used)]

use peerline::{
    CallEvent, CallId, CallManagerConfig, CallService, CallServiceBuilder, CallStatus, CallType,
    IceCandidate, InProcessHub, LoopbackPeerTransport, MemorySessionStore, PeerTransport,
    PeerTransportFactory, SessionStore, UserId,
};
use pretty_assertions::{assert_eq, assert_ne};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const TICK: Duration = Duration::from_secs(2);

/// Opt-in log output: `RUST_LOG=peerline=debug cargo test`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Endpoint {
    service: CallService<InProcessHub>,
    store: Arc<MemorySessionStore>,
    transports: Arc<parking_lot::Mutex<Vec<Arc<LoopbackPeerTransport>>>>,
}

impl Endpoint {
    /// The loopback transport created for the endpoint's n-th call
    fn transport(&self, n: usize) -> Arc<LoopbackPeerTransport> {
        self.transports.lock()[n].clone()
    }
}

fn recording_factory() -> (
    PeerTransportFactory,
    Arc<parking_lot::Mutex<Vec<Arc<LoopbackPeerTransport>>>>,
) {
    let created: Arc<parking_lot::Mutex<Vec<Arc<LoopbackPeerTransport>>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = created.clone();
    let factory: PeerTransportFactory = Arc::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            let transport = Arc::new(LoopbackPeerTransport::new());
            sink.lock().push(transport.clone());
            Ok(transport as Arc<dyn PeerTransport>)
        })
    });
    (factory, created)
}

async fn endpoint(hub: &Arc<InProcessHub>, name: &str, config: CallManagerConfig) -> Endpoint {
    init_tracing();
    let (factory, transports) = recording_factory();
    let store = Arc::new(MemorySessionStore::new());
    let service = CallServiceBuilder::new(UserId::new(name), hub.clone())
        .transport_factory(factory)
        .store(store.clone())
        .config(config)
        .start()
        .await
        .unwrap();
    Endpoint {
        service,
        store,
        transports,
    }
}

async fn wait_for_status(events: &mut broadcast::Receiver<CallEvent>, want: CallStatus) -> CallId {
    loop {
        let event = timeout(TICK, events.recv()).await.unwrap().unwrap();
        if let CallEvent::StateChanged { call_id, status } = event {
            if status == want {
                return call_id;
            }
        }
    }
}

async fn wait_for_incoming(events: &mut broadcast::Receiver<CallEvent>) -> CallId {
    loop {
        let event = timeout(TICK, events.recv()).await.unwrap().unwrap();
        if let CallEvent::IncomingCall { session, .. } = event {
            return session.id;
        }
    }
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 UDP 2122260223 10.0.0.{n} 4{n}000 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

#[tokio::test]
async fn test_audio_call_accepted_both_sides_active() {
    let hub = Arc::new(InProcessHub::new());
    let alice = endpoint(&hub, "alice", CallManagerConfig::default()).await;
    let bob = endpoint(&hub, "bob", CallManagerConfig::default()).await;
    let mut alice_events = alice.service.subscribe_events();
    let mut bob_events = bob.service.subscribe_events();

    let call_id = alice
        .service
        .start_call(UserId::new("bob"), CallType::Audio)
        .await
        .unwrap();
    assert_eq!(
        wait_for_status(&mut alice_events, CallStatus::Ringing).await,
        call_id
    );

    assert_eq!(wait_for_incoming(&mut bob_events).await, call_id);
    bob.service.accept_call(call_id).await.unwrap();

    assert_eq!(
        wait_for_status(&mut bob_events, CallStatus::Active).await,
        call_id
    );
    assert_eq!(
        wait_for_status(&mut alice_events, CallStatus::Active).await,
        call_id
    );

    let alice_session = alice.store.get(call_id).await.unwrap();
    let bob_session = bob.store.get(call_id).await.unwrap();
    assert_eq!(alice_session.status, CallStatus::Active);
    assert_eq!(bob_session.status, CallStatus::Active);
    assert!(alice_session.started_at.is_some());
    assert_eq!(bob_session.initiator_id, UserId::new("alice"));

    alice.service.shutdown().await;
    bob.service.shutdown().await;
}

#[tokio::test]
async fn test_caller_cancel_before_answer() {
    let hub = Arc::new(InProcessHub::new());
    let alice = endpoint(&hub, "alice", CallManagerConfig::default()).await;
    let bob = endpoint(&hub, "bob", CallManagerConfig::default()).await;
    let mut alice_events = alice.service.subscribe_events();
    let mut bob_events = bob.service.subscribe_events();

    let call_id = alice
        .service
        .start_call(UserId::new("bob"), CallType::Audio)
        .await
        .unwrap();
    assert_eq!(wait_for_incoming(&mut bob_events).await, call_id);

    alice.service.end_call(call_id).await.unwrap();
    assert_eq!(
        wait_for_status(&mut alice_events, CallStatus::Ended).await,
        call_id
    );
    assert_eq!(
        wait_for_status(&mut bob_events, CallStatus::Ended).await,
        call_id
    );

    // The id is latched terminal on both sides; a late accept cannot
    // revive the call.
    assert!(bob.service.accept_call(call_id).await.is_err());
    assert_eq!(
        alice.store.get(call_id).await.unwrap().status,
        CallStatus::Ended
    );
    assert_eq!(
        bob.store.get(call_id).await.unwrap().status,
        CallStatus::Ended
    );

    alice.service.shutdown().await;
    bob.service.shutdown().await;
}

#[tokio::test]
async fn test_candidates_ahead_of_answer_apply_in_order() {
    let hub = Arc::new(InProcessHub::new());
    let alice = endpoint(&hub, "alice", CallManagerConfig::default()).await;
    let bob = endpoint(&hub, "bob", CallManagerConfig::default()).await;
    let mut bob_events = bob.service.subscribe_events();

    let call_id = alice
        .service
        .start_call(UserId::new("bob"), CallType::Audio)
        .await
        .unwrap();
    assert_eq!(wait_for_incoming(&mut bob_events).await, call_id);

    // Alice's ICE layer trickles candidates before Bob has accepted.
    let alice_transport = alice.transport(0);
    alice_transport.emit_local_candidate(candidate(1));
    alice_transport.emit_local_candidate(candidate(2));
    alice_transport.emit_local_candidate(candidate(3));
    sleep(Duration::from_millis(200)).await;

    // Bob has not applied the offer yet, so nothing reached his transport.
    let bob_transport = bob.transport(0);
    assert!(bob_transport.applied_candidates().is_empty());

    bob.service.accept_call(call_id).await.unwrap();
    assert_eq!(
        bob_transport.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3)]
    );

    // Once active, further candidates flow straight through.
    alice_transport.emit_local_candidate(candidate(4));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        bob_transport.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3), candidate(4)]
    );

    alice.service.shutdown().await;
    bob.service.shutdown().await;
}

#[tokio::test]
async fn test_decline_marks_both_sides() {
    let hub = Arc::new(InProcessHub::new());
    let alice = endpoint(&hub, "alice", CallManagerConfig::default()).await;
    let bob = endpoint(&hub, "bob", CallManagerConfig::default()).await;
    let mut alice_events = alice.service.subscribe_events();
    let mut bob_events = bob.service.subscribe_events();

    let call_id = alice
        .service
        .start_call(UserId::new("bob"), CallType::Video)
        .await
        .unwrap();
    assert_eq!(wait_for_incoming(&mut bob_events).await, call_id);

    bob.service.decline_call(call_id).await.unwrap();
    assert_eq!(
        wait_for_status(&mut bob_events, CallStatus::Declined).await,
        call_id
    );
    assert_eq!(
        wait_for_status(&mut alice_events, CallStatus::Declined).await,
        call_id
    );

    assert_eq!(
        alice.store.get(call_id).await.unwrap().status,
        CallStatus::Declined
    );
    assert_eq!(
        bob.store.get(call_id).await.unwrap().status,
        CallStatus::Declined
    );

    alice.service.shutdown().await;
    bob.service.shutdown().await;
}

#[tokio::test]
async fn test_busy_callee_declines_third_party() {
    let hub = Arc::new(InProcessHub::new());
    let alice = endpoint(&hub, "alice", CallManagerConfig::default()).await;
    let bob = endpoint(&hub, "bob", CallManagerConfig::default()).await;
    let carol = endpoint(&hub, "carol", CallManagerConfig::default()).await;
    let mut bob_events = bob.service.subscribe_events();
    let mut carol_events = carol.service.subscribe_events();

    // Alice and Bob get on a call.
    let call_id = alice
        .service
        .start_call(UserId::new("bob"), CallType::Audio)
        .await
        .unwrap();
    assert_eq!(wait_for_incoming(&mut bob_events).await, call_id);
    bob.service.accept_call(call_id).await.unwrap();
    wait_for_status(&mut bob_events, CallStatus::Active).await;

    // Carol calls the busy Bob and is declined without Bob being prompted.
    let carol_call = carol
        .service
        .start_call(UserId::new("bob"), CallType::Audio)
        .await
        .unwrap();
    assert_eq!(
        wait_for_status(&mut carol_events, CallStatus::Declined).await,
        carol_call
    );
    assert!(bob.store.get(carol_call).await.is_err());

    // The original call is untouched.
    assert_eq!(
        bob.store.get(call_id).await.unwrap().status,
        CallStatus::Active
    );

    alice.service.shutdown().await;
    bob.service.shutdown().await;
    carol.service.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_call_times_out_on_both_sides() {
    let hub = Arc::new(InProcessHub::new());
    let config = CallManagerConfig {
        ring_timeout: Duration::from_millis(100),
        ..CallManagerConfig::default()
    };
    let alice = endpoint(&hub, "alice", config.clone()).await;
    let bob = endpoint(&hub, "bob", CallManagerConfig::default()).await;
    let mut alice_events = alice.service.subscribe_events();
    let mut bob_events = bob.service.subscribe_events();

    let call_id = alice
        .service
        .start_call(UserId::new("bob"), CallType::Audio)
        .await
        .unwrap();
    assert_eq!(wait_for_incoming(&mut bob_events).await, call_id);

    // Nobody answers; the caller gives up and the callee stops ringing.
    assert_eq!(
        wait_for_status(&mut alice_events, CallStatus::Ended).await,
        call_id
    );
    assert_eq!(
        wait_for_status(&mut bob_events, CallStatus::Ended).await,
        call_id
    );

    alice.service.shutdown().await;
    bob.service.shutdown().await;
}

#[tokio::test]
async fn test_hangup_after_active_call() {
    let hub = Arc::new(InProcessHub::new());
    let alice = endpoint(&hub, "alice", CallManagerConfig::default()).await;
    let bob = endpoint(&hub, "bob", CallManagerConfig::default()).await;
    let mut alice_events = alice.service.subscribe_events();
    let mut bob_events = bob.service.subscribe_events();

    let call_id = alice
        .service
        .start_call(UserId::new("bob"), CallType::Audio)
        .await
        .unwrap();
    assert_eq!(wait_for_incoming(&mut bob_events).await, call_id);
    bob.service.accept_call(call_id).await.unwrap();
    wait_for_status(&mut alice_events, CallStatus::Active).await;

    bob.service.end_call(call_id).await.unwrap();
    assert_eq!(
        wait_for_status(&mut alice_events, CallStatus::Ended).await,
        call_id
    );

    // Both transports are released.
    sleep(Duration::from_millis(100)).await;
    assert!(alice.transport(0).is_closed());
    assert!(bob.transport(0).is_closed());

    let session = alice.store.get(call_id).await.unwrap();
    assert_eq!(session.status, CallStatus::Ended);
    assert!(session.duration().is_some());

    // A follow-up call works with a fresh id and transport.
    let second = alice
        .service
        .start_call(UserId::new("bob"), CallType::Audio)
        .await
        .unwrap();
    assert_ne!(second, call_id);
    assert_eq!(wait_for_incoming(&mut bob_events).await, second);

    alice.service.shutdown().await;
    bob.service.shutdown().await;
}
