//! End-to-end call flows between two orchestrators over the loopback broker

use saorsa_voice_core::loopback::{LinkBehavior, LoopbackBroker, SimulatedConnector, SimulatedMedia};
use saorsa_voice_core::{
    CallConfig, CallEndReason, CallError, CallEvent, CallId, CallMetadata, CallOrchestrator, CallState,
    IceCandidate, LinkEvent, PeerIdentityString, SessionDescription, SignalBody, SignalKind,
    SignalMessage, SignalingError, Topic, DEFAULT_STUN_SERVER,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

type Id = PeerIdentityString;

const WAIT: Duration = Duration::from_secs(60);

struct Peer {
    id: Id,
    calls: CallOrchestrator<Id>,
    media: Arc<SimulatedMedia>,
    connector: Arc<SimulatedConnector>,
    events: broadcast::Receiver<CallEvent<Id>>,
}

fn peer(name: &str, broker: &Arc<LoopbackBroker>, config: CallConfig) -> Peer {
    let media = Arc::new(SimulatedMedia::new());
    let connector = Arc::new(SimulatedConnector::new());
    let calls = CallOrchestrator::builder(Id::new(name), broker.clone())
        .with_media(media.clone())
        .with_connector(connector.clone())
        .with_config(config)
        .build()
        .unwrap();
    let events = calls.subscribe_events();
    Peer {
        id: Id::new(name),
        calls,
        media,
        connector,
        events,
    }
}

fn pair(broker: &Arc<LoopbackBroker>, config: CallConfig) -> (Peer, Peer) {
    (peer("alice", broker, config.clone()), peer("bob", broker, config))
}

async fn expect_event(
    events: &mut broadcast::Receiver<CallEvent<Id>>,
    want: impl Fn(&CallEvent<Id>) -> bool,
) -> CallEvent<Id> {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .unwrap()
            .unwrap();
        if want(&event) {
            return event;
        }
    }
}

async fn expect_incoming(peer: &mut Peer) -> Topic {
    match expect_event(&mut peer.events, |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await
    {
        CallEvent::IncomingCall { topic, .. } => topic,
        _ => unreachable!(),
    }
}

async fn expect_connected(peer: &mut Peer) {
    expect_event(&mut peer.events, |e| {
        matches!(e, CallEvent::CallConnected { .. })
    })
    .await;
}

async fn expect_ended(peer: &mut Peer) -> CallEndReason {
    match expect_event(&mut peer.events, |e| matches!(e, CallEvent::CallEnded { .. })).await {
        CallEvent::CallEnded { reason, .. } => reason,
        _ => unreachable!(),
    }
}

fn drain(peer: &mut Peer) -> Vec<CallEvent<Id>> {
    let mut seen = Vec::new();
    while let Ok(event) = peer.events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn sent(broker: &LoopbackBroker, topic: &Topic) -> Vec<SignalMessage<Id>> {
    broker
        .published(topic)
        .iter()
        .map(|raw| SignalMessage::decode(raw).unwrap())
        .collect()
}

async fn inject(broker: &LoopbackBroker, topic: &Topic, from: &Id, to: &Id, body: SignalBody) {
    let message = SignalMessage {
        body,
        from: from.clone(),
        to: Some(to.clone()),
        call: None,
    };
    replay(broker, topic, &message).await;
}

/// Publish `message` again, as a late or duplicated delivery would
async fn replay(broker: &LoopbackBroker, topic: &Topic, message: &SignalMessage<Id>) {
    broker.publish_raw(topic, message.encode().unwrap()).await;
    settle().await;
}

/// First message of `kind` that `from` put on the topic
fn first_sent(
    broker: &LoopbackBroker,
    topic: &Topic,
    from: &Id,
    kind: SignalKind,
) -> SignalMessage<Id> {
    sent(broker, topic)
        .into_iter()
        .find(|m| m.from == *from && m.kind() == kind)
        .unwrap()
}

/// Alice calls Bob and Bob accepts
async fn connect(a: &mut Peer, b: &mut Peer) -> Topic {
    b.calls.listen(&a.id).await.unwrap();
    let topic = a.calls.start_call(b.id.clone(), None).await.unwrap();
    assert_eq!(expect_incoming(b).await, topic);
    b.calls.accept_call(&topic).await.unwrap();
    expect_connected(a).await;
    expect_connected(b).await;
    topic
}

#[tokio::test]
async fn test_call_connects_exactly_one_session_per_side() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());

    b.calls.listen(&a.id).await.unwrap();
    let meta = CallMetadata(serde_json::json!({ "display_name": "Alice", "preview": "hi" }));
    let topic = a
        .calls
        .start_call(b.id.clone(), Some(meta.clone()))
        .await
        .unwrap();
    assert_eq!(topic, Topic::between(&a.id, &b.id));
    assert_eq!(a.calls.call_state(&topic).await, Some(CallState::Offering));

    let incoming = expect_event(&mut b.events, |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await;
    match incoming {
        CallEvent::IncomingCall {
            topic: t,
            from,
            meta: m,
            ..
        } => {
            assert_eq!(t, topic);
            assert_eq!(from, a.id);
            assert_eq!(m, Some(meta));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(b.calls.has_pending_offer(&topic).await);
    assert!(b.connector.links().is_empty());

    b.calls.accept_call(&topic).await.unwrap();
    expect_connected(&mut a).await;
    expect_connected(&mut b).await;
    expect_event(&mut a.events, |e| matches!(e, CallEvent::RemoteTrack { .. })).await;
    expect_event(&mut b.events, |e| matches!(e, CallEvent::RemoteTrack { .. })).await;
    settle().await;

    for side in [&a, &b] {
        assert_eq!(side.calls.active_topics().await, vec![topic.clone()]);
        assert_eq!(side.calls.call_state(&topic).await, Some(CallState::Connected));
        assert_eq!(side.connector.links().len(), 1);
        assert_eq!(side.media.acquired(), 1);

        let link = side.connector.last_link().unwrap();
        assert_eq!(link.ice_servers(), &[DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(link.local_tracks().len(), 1);
        assert_eq!(link.applied_candidates().len(), 1);
    }

    let kinds: Vec<SignalKind> = sent(&broker, &topic).iter().map(|m| m.kind()).collect();
    assert_eq!(kinds.iter().filter(|k| **k == SignalKind::Offer).count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == SignalKind::Answer).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_decline_leaves_caller_to_time_out() {
    let broker = Arc::new(LoopbackBroker::new());
    let config = CallConfig {
        connect_timeout: Duration::from_secs(10),
        ..CallConfig::default()
    };
    let (mut a, mut b) = pair(&broker, config);

    b.calls.listen(&a.id).await.unwrap();
    let topic = a.calls.start_call(b.id.clone(), None).await.unwrap();
    expect_incoming(&mut b).await;

    b.calls.decline_call(&topic).await.unwrap();
    assert_eq!(expect_ended(&mut b).await, CallEndReason::Declined);
    assert!(!b.calls.has_pending_offer(&topic).await);

    assert_eq!(expect_ended(&mut a).await, CallEndReason::Timeout);
    settle().await;
    assert!(a.calls.active_topics().await.is_empty());
    assert_eq!(a.media.stops(), 1);
    assert_eq!(a.connector.last_link().unwrap().close_count(), 1);

    let messages = sent(&broker, &topic);
    assert!(messages.iter().all(|m| m.from == a.id));
    assert_eq!(messages.last().map(SignalMessage::kind), Some(SignalKind::Bye));
}

#[tokio::test]
async fn test_early_candidates_wait_for_the_answer() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, b) = pair(&broker, CallConfig::default());

    let topic = a.calls.start_call(b.id.clone(), None).await.unwrap();
    let first = IceCandidate::new("candidate:7 1 udp 2122260223 10.0.0.2 40000 typ host");
    let second = IceCandidate::new("candidate:8 1 udp 2122260223 10.0.0.2 40001 typ host");

    inject(&broker, &topic, &b.id, &a.id, SignalBody::Candidate(first.clone())).await;
    inject(&broker, &topic, &b.id, &a.id, SignalBody::Candidate(second.clone())).await;
    inject(&broker, &topic, &b.id, &a.id, SignalBody::Candidate(first.clone())).await;

    let link = a.connector.last_link().unwrap();
    assert!(link.applied_candidates().is_empty());
    assert_eq!(a.calls.call_state(&topic).await, Some(CallState::Offering));

    let answer = SessionDescription::answer("v=0\r\no=- 9 2 IN IP4 10.0.0.2\r\ns=-\r\n");
    inject(&broker, &topic, &b.id, &a.id, SignalBody::Answer(answer.clone())).await;
    expect_connected(&mut a).await;

    assert_eq!(link.remote_description(), Some(answer));
    assert_eq!(link.applied_candidates(), vec![first, second]);
}

#[tokio::test]
async fn test_duplicate_delivery_is_harmless() {
    let broker = Arc::new(LoopbackBroker::new());
    broker.set_duplicate_delivery(true);
    let (mut a, mut b) = pair(&broker, CallConfig::default());

    let topic = connect(&mut a, &mut b).await;
    settle().await;

    let extra_incoming = drain(&mut b)
        .iter()
        .filter(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .count();
    assert_eq!(extra_incoming, 0);
    let extra_connected = drain(&mut a)
        .iter()
        .filter(|e| matches!(e, CallEvent::CallConnected { .. }))
        .count();
    assert_eq!(extra_connected, 0);

    for side in [&a, &b] {
        assert_eq!(side.connector.links().len(), 1);
        assert_eq!(side.calls.call_state(&topic).await, Some(CallState::Connected));
        assert_eq!(side.connector.last_link().unwrap().applied_candidates().len(), 1);
    }
}

#[tokio::test]
async fn test_second_start_call_is_rejected() {
    let broker = Arc::new(LoopbackBroker::new());
    let (a, b) = pair(&broker, CallConfig::default());

    let topic = a.calls.start_call(b.id.clone(), None).await.unwrap();
    let second = a.calls.start_call(b.id.clone(), None).await;
    assert!(matches!(second, Err(CallError::AlreadyActive(t)) if t == topic));

    assert_eq!(a.calls.call_state(&topic).await, Some(CallState::Offering));
    assert_eq!(a.connector.links().len(), 1);
    assert_eq!(a.media.acquired(), 1);
}

#[tokio::test]
async fn test_self_call_is_rejected() {
    let broker = Arc::new(LoopbackBroker::new());
    let a = peer("alice", &broker, CallConfig::default());
    assert!(matches!(
        a.calls.start_call(a.id.clone(), None).await,
        Err(CallError::SelfCall)
    ));
    assert!(a.calls.open_topics().await.is_empty());
}

#[tokio::test]
async fn test_hang_up_twice_stops_media_once() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    let topic = connect(&mut a, &mut b).await;

    a.calls.hang_up(&topic).await;
    a.calls.hang_up(&topic).await;
    assert_eq!(expect_ended(&mut a).await, CallEndReason::LocalHangUp);
    assert_eq!(expect_ended(&mut b).await, CallEndReason::RemoteHangUp);
    settle().await;

    let later_ends = drain(&mut a)
        .iter()
        .filter(|e| matches!(e, CallEvent::CallEnded { .. }))
        .count();
    assert_eq!(later_ends, 0);
    assert_eq!(a.media.stops(), 1);
    assert_eq!(b.media.stops(), 1);
    assert_eq!(a.connector.last_link().unwrap().close_count(), 1);
    assert!(a.calls.active_topics().await.is_empty());
    assert!(a.calls.open_topics().await.is_empty());
    assert_eq!(b.calls.open_topics().await, vec![topic]);
}

#[tokio::test]
async fn test_repeated_offer_while_negotiating_is_ignored() {
    let broker = Arc::new(LoopbackBroker::new());
    let (a, mut b) = pair(&broker, CallConfig::default());
    b.connector.set_behavior(LinkBehavior {
        auto_connect: false,
        ..LinkBehavior::default()
    });

    b.calls.listen(&a.id).await.unwrap();
    let topic = a.calls.start_call(b.id.clone(), None).await.unwrap();
    expect_incoming(&mut b).await;

    let offer = broker.published(&topic)[0].clone();
    broker.publish_raw(&topic, offer.clone()).await;
    settle().await;
    assert!(drain(&mut b).is_empty());

    b.calls.accept_call(&topic).await.unwrap();
    assert_eq!(b.calls.call_state(&topic).await, Some(CallState::Answering));
    broker.publish_raw(&topic, offer).await;
    settle().await;

    assert!(drain(&mut b).is_empty());
    assert_eq!(b.calls.call_state(&topic).await, Some(CallState::Answering));
    assert_eq!(b.connector.links().len(), 1);
}

#[tokio::test]
async fn test_new_offer_waits_until_current_call_closes() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    let topic = connect(&mut a, &mut b).await;
    settle().await;
    drain(&mut b);

    let fresh = SessionDescription::offer("v=0\r\no=- 42 2 IN IP4 127.0.0.1\r\ns=-\r\n");
    inject(
        &broker,
        &topic,
        &a.id,
        &b.id,
        SignalBody::Offer {
            description: fresh,
            meta: None,
        },
    )
    .await;
    assert!(drain(&mut b).is_empty());
    assert_eq!(b.calls.call_state(&topic).await, Some(CallState::Connected));
    assert!(!b.calls.has_pending_offer(&topic).await);

    inject(&broker, &topic, &a.id, &b.id, SignalBody::Bye { reason: None }).await;
    assert_eq!(expect_ended(&mut b).await, CallEndReason::RemoteHangUp);
    assert_eq!(expect_incoming(&mut b).await, topic);
    assert!(b.calls.has_pending_offer(&topic).await);
    assert!(b.calls.active_topics().await.is_empty());
}

#[tokio::test]
async fn test_bye_withdraws_pending_offer() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());

    b.calls.listen(&a.id).await.unwrap();
    let topic = a.calls.start_call(b.id.clone(), None).await.unwrap();
    expect_incoming(&mut b).await;

    a.calls.hang_up(&topic).await;
    assert_eq!(expect_ended(&mut a).await, CallEndReason::LocalHangUp);
    assert_eq!(expect_ended(&mut b).await, CallEndReason::RemoteHangUp);

    assert!(!b.calls.has_pending_offer(&topic).await);
    assert!(matches!(
        b.calls.accept_call(&topic).await,
        Err(CallError::NoPendingOffer(_))
    ));
    assert!(b.connector.links().is_empty());
    assert_eq!(b.media.acquired(), 0);
}

#[tokio::test]
async fn test_accept_and_decline_need_a_pending_offer() {
    let broker = Arc::new(LoopbackBroker::new());
    let (a, b) = pair(&broker, CallConfig::default());
    let topic = Topic::between(&a.id, &b.id);

    assert!(matches!(
        b.calls.accept_call(&topic).await,
        Err(CallError::NoPendingOffer(_))
    ));
    assert!(matches!(
        b.calls.decline_call(&topic).await,
        Err(CallError::NoPendingOffer(_))
    ));
    b.calls.hang_up(&topic).await;
    assert!(b.calls.open_topics().await.is_empty());
}

#[tokio::test]
async fn test_offer_delivery_failure_ends_the_attempt() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, b) = pair(&broker, CallConfig::default());
    broker.fail_next_publishes(2);

    let result = a.calls.start_call(b.id.clone(), None).await;
    assert!(matches!(
        result,
        Err(CallError::Signaling(SignalingError::Delivery { attempts: 2, .. }))
    ));
    assert!(matches!(expect_ended(&mut a).await, CallEndReason::Failed(_)));
    settle().await;

    assert_eq!(broker.publish_attempts(), 2);
    assert!(a.calls.active_topics().await.is_empty());
    assert_eq!(a.media.stops(), 1);
}

#[tokio::test]
async fn test_bye_delivery_failure_is_reported() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    let topic = connect(&mut a, &mut b).await;
    settle().await;

    broker.fail_next_publishes(2);
    a.calls.hang_up(&topic).await;

    let failed = expect_event(&mut a.events, |e| {
        matches!(e, CallEvent::DeliveryFailed { .. })
    })
    .await;
    match failed {
        CallEvent::DeliveryFailed { message_type, .. } => assert_eq!(message_type, "bye"),
        other => panic!("unexpected event {other:?}"),
    }
    settle().await;
    assert_eq!(b.calls.call_state(&topic).await, Some(CallState::Connected));
}

#[tokio::test]
async fn test_denied_microphone_aborts_without_call_ended() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    a.media.set_denied(true);

    let topic = Topic::between(&a.id, &b.id);
    let result = a.calls.start_call(b.id.clone(), None).await;
    assert!(matches!(result, Err(CallError::DeviceAccess(_))));
    settle().await;

    assert!(drain(&mut a).is_empty());
    assert!(a.calls.open_topics().await.is_empty());
    assert!(a.connector.links().is_empty());
    assert!(broker.published(&topic).is_empty());

    a.media.set_denied(false);
    b.media.set_denied(true);
    b.calls.listen(&a.id).await.unwrap();
    a.calls.start_call(b.id.clone(), None).await.unwrap();
    expect_incoming(&mut b).await;
    assert!(matches!(
        b.calls.accept_call(&topic).await,
        Err(CallError::DeviceAccess(_))
    ));
    assert!(!b.calls.has_pending_offer(&topic).await);
    assert!(b.calls.active_topics().await.is_empty());
}

#[tokio::test]
async fn test_link_failure_closes_both_sides() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    let topic = connect(&mut a, &mut b).await;

    let link = a.connector.last_link().unwrap();
    link.inject(LinkEvent::Failed("ice failed".to_string()));

    assert!(matches!(expect_ended(&mut a).await, CallEndReason::Failed(_)));
    assert_eq!(expect_ended(&mut b).await, CallEndReason::RemoteHangUp);
    settle().await;
    assert_eq!(link.close_count(), 1);
    assert!(a.calls.active_topics().await.is_empty());
    assert!(b.calls.active_topics().await.is_empty());
    assert!(sent(&broker, &topic)
        .iter()
        .any(|m| m.from == a.id && m.kind() == SignalKind::Bye));
}

#[tokio::test]
async fn test_shutdown_ends_every_call() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    let topic = connect(&mut a, &mut b).await;

    a.calls.shutdown().await;
    assert_eq!(expect_ended(&mut a).await, CallEndReason::Shutdown);
    assert_eq!(expect_ended(&mut b).await, CallEndReason::RemoteHangUp);
    settle().await;

    assert!(a.calls.open_topics().await.is_empty());
    assert_eq!(a.media.stops(), 1);
    assert_eq!(broker.subscriber_count(&topic), 1);
}

#[tokio::test]
async fn test_messages_carry_the_call_attempt_id() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    let topic = connect(&mut a, &mut b).await;
    a.calls.hang_up(&topic).await;
    expect_ended(&mut b).await;

    let call = first_sent(&broker, &topic, &a.id, SignalKind::Offer).call;
    assert!(call.is_some());
    assert!(sent(&broker, &topic).iter().all(|m| m.call == call));
}

#[tokio::test]
async fn test_late_answer_from_earlier_call_is_ignored() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    let topic = connect(&mut a, &mut b).await;
    let old_answer = first_sent(&broker, &topic, &b.id, SignalKind::Answer);

    a.calls.hang_up(&topic).await;
    assert_eq!(expect_ended(&mut b).await, CallEndReason::RemoteHangUp);
    settle().await;
    drain(&mut a);

    a.calls.start_call(b.id.clone(), None).await.unwrap();
    assert_eq!(expect_incoming(&mut b).await, topic);

    replay(&broker, &topic, &old_answer).await;
    assert_eq!(a.calls.call_state(&topic).await, Some(CallState::Offering));
    assert!(b.calls.has_pending_offer(&topic).await);
    assert!(!drain(&mut a)
        .iter()
        .any(|e| matches!(e, CallEvent::CallConnected { .. })));

    // The new attempt still connects normally
    b.calls.accept_call(&topic).await.unwrap();
    expect_connected(&mut a).await;
    expect_connected(&mut b).await;
}

#[tokio::test]
async fn test_late_bye_from_earlier_call_keeps_new_offer() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    let topic = connect(&mut a, &mut b).await;

    a.calls.hang_up(&topic).await;
    assert_eq!(expect_ended(&mut b).await, CallEndReason::RemoteHangUp);
    let old_bye = first_sent(&broker, &topic, &a.id, SignalKind::Bye);
    settle().await;
    drain(&mut b);

    a.calls.start_call(b.id.clone(), None).await.unwrap();
    assert_eq!(expect_incoming(&mut b).await, topic);

    replay(&broker, &topic, &old_bye).await;
    assert!(b.calls.has_pending_offer(&topic).await);
    assert!(!drain(&mut b)
        .iter()
        .any(|e| matches!(e, CallEvent::CallEnded { .. })));
    assert_eq!(a.calls.call_state(&topic).await, Some(CallState::Offering));

    b.calls.accept_call(&topic).await.unwrap();
    expect_connected(&mut a).await;
    expect_connected(&mut b).await;
}

#[tokio::test]
async fn test_late_offer_from_finished_call_is_not_surfaced_again() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    let topic = connect(&mut a, &mut b).await;
    let old_offer = first_sent(&broker, &topic, &a.id, SignalKind::Offer);

    a.calls.hang_up(&topic).await;
    assert_eq!(expect_ended(&mut b).await, CallEndReason::RemoteHangUp);
    settle().await;
    drain(&mut b);

    replay(&broker, &topic, &old_offer).await;
    assert!(!b.calls.has_pending_offer(&topic).await);
    assert!(drain(&mut b).is_empty());
}

#[tokio::test]
async fn test_live_call_candidates_bypass_held_offer() {
    let broker = Arc::new(LoopbackBroker::new());
    let (mut a, mut b) = pair(&broker, CallConfig::default());
    let topic = connect(&mut a, &mut b).await;
    let live = first_sent(&broker, &topic, &a.id, SignalKind::Offer).call;
    settle().await;
    drain(&mut b);

    let restart = SignalMessage {
        body: SignalBody::Offer {
            description: SessionDescription::offer("v=0\r\no=- 77 2 IN IP4 127.0.0.1\r\ns=-\r\n"),
            meta: None,
        },
        from: a.id.clone(),
        to: Some(b.id.clone()),
        call: Some(CallId::new()),
    };
    replay(&broker, &topic, &restart).await;
    assert!(drain(&mut b).is_empty());

    let late = IceCandidate::new("candidate:9 1 udp 2122260223 10.0.0.9 40009 typ host");
    let trickle = SignalMessage {
        body: SignalBody::Candidate(late.clone()),
        from: a.id.clone(),
        to: Some(b.id.clone()),
        call: live,
    };
    replay(&broker, &topic, &trickle).await;
    assert!(b
        .connector
        .last_link()
        .unwrap()
        .applied_candidates()
        .contains(&late));

    // A bye tagged with the held offer only withdraws that offer
    let withdraw = SignalMessage {
        body: SignalBody::Bye { reason: None },
        call: restart.call,
        ..trickle
    };
    replay(&broker, &topic, &withdraw).await;
    assert_eq!(b.calls.call_state(&topic).await, Some(CallState::Connected));
    assert!(drain(&mut b).is_empty());

    a.calls.hang_up(&topic).await;
    assert_eq!(expect_ended(&mut b).await, CallEndReason::RemoteHangUp);
    settle().await;
    assert!(!b.calls.has_pending_offer(&topic).await);
}
