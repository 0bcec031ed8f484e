mod common;

use common::*;
use meshcall_client::media::{LocalStream, MediaKind, RemoteTrack};
use meshcall_client::protocol::{ClientMessage, PeerId};
use meshcall_client::transport::{ConnectionState, TransportEvent};
use meshcall_client::{ControllerState, DisconnectReason, SessionEvent};
use std::sync::Arc;
use tokio::sync::Notify;

fn disconnects(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::PeerDisconnected { .. }))
        .count()
}

#[tokio::test]
async fn test_leave_while_answer_pending_does_not_resurrect_session() {
    let gate = Arc::new(Notify::new());
    let mut h = Harness::joined(MockFactory::with_answer_gate(gate.clone()), "A", &["A"]).await;

    h.offer_from("B", "offer-1");
    let transport = h.transport("B").await;
    eventually(|| transport.has(&Call::CreateAnswer).then_some(())).await;

    h.session.leave().await.unwrap();
    assert!(h.session.peers().await.unwrap().is_empty());

    // the answer completes after the session is gone
    gate.notify_one();
    eventually(|| transport.has(&Call::Close).then_some(())).await;

    h.answer_from("B", "late");
    h.candidate_from("B", "late");
    h.settle().await;

    assert!(h.session.peers().await.unwrap().is_empty());
    assert_eq!(h.factory.created("B"), 1);

    let mut forwarded = Vec::new();
    while let Ok(command) = h.relay.commands.try_recv() {
        forwarded.push(command);
    }
    assert!(
        forwarded.iter().all(|c| !matches!(c, ClientMessage::Message { .. })),
        "answer leaked to relay: {:?}",
        forwarded
    );
    assert_eq!(
        h.beacon.notices(),
        vec![("http://api.invalid".to_string(), PeerId::from("A"))]
    );
}

#[tokio::test]
async fn test_leave_is_idempotent() {
    let mut h = Harness::joined(MockFactory::new(), "A", &["A", "B"]).await;
    h.expect_signal().await;

    let stream = LocalStream::audio_video();
    h.session.publish(stream.clone()).unwrap();
    let transport = h.transport("B").await;
    eventually(|| transport.has(&Call::AddTrack("video".to_string())).then_some(())).await;

    h.session.leave().await.unwrap();
    h.session.leave().await.unwrap();

    eventually(|| transport.has(&Call::Close).then_some(())).await;
    assert_eq!(transport.count(|c| *c == Call::Close), 1);
    assert_eq!(transport.count(|c| *c == Call::RemoveTracks), 1);
    assert!(stream.tracks().iter().all(|t| !t.is_live()));
    assert_eq!(h.beacon.notices().len(), 1);

    let events = h.drain_events().await;
    let left = events.iter().filter(|e| matches!(e, SessionEvent::Left)).count();
    assert_eq!(left, 1);
    assert_eq!(disconnects(&events), 0);

    let status = h.session.status().await.unwrap();
    assert_eq!(status.state, ControllerState::Disconnected);
    assert!(status.peers.is_empty());
    assert!(status.local.is_none());

    // the relay link was released
    while let Ok(Some(_)) =
        tokio::time::timeout(WAIT, h.relay.commands.recv()).await
    {}
    assert!(h.relay.commands.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_connection_disconnects_exactly_once() {
    let mut h = Harness::joined(MockFactory::new(), "A", &["A", "B"]).await;
    h.expect_signal().await;
    let first = h.transport("B").await;
    let first_generation = h.session.peers().await.unwrap()[0].generation;

    first.emit(TransportEvent::ConnectionState(ConnectionState::Failed));
    match h.expect_event(|e| matches!(e, SessionEvent::PeerDisconnected { .. })).await {
        SessionEvent::PeerDisconnected { peer, reason } => {
            assert_eq!(peer, PeerId::from("B"));
            assert_eq!(reason, DisconnectReason::ConnectionState(ConnectionState::Failed));
        }
        other => panic!("unexpected {:?}", other),
    }

    first.emit(TransportEvent::ConnectionState(ConnectionState::Closed));
    first.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
    assert_eq!(disconnects(&h.drain_events().await), 0);
    assert!(h.session.peers().await.unwrap().is_empty());
    eventually(|| first.has(&Call::Close).then_some(())).await;

    // the peer comes back; the old transport cannot touch the new session
    h.offer_from("B", "again");
    h.expect_signal().await;
    assert_eq!(h.factory.created("B"), 2);
    first.emit(TransportEvent::ConnectionState(ConnectionState::Failed));
    h.settle().await;

    let peers = h.session.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert!(peers[0].generation > first_generation);
}

#[tokio::test]
async fn test_ended_track_disconnects_peer() {
    let mut h = Harness::joined(MockFactory::new(), "A", &["A", "B"]).await;
    h.expect_signal().await;
    let transport = h.transport("B").await;

    let audio = RemoteTrack::new("a1", MediaKind::Audio, "remote");
    transport.emit(TransportEvent::Track(audio.clone()));
    transport.emit(TransportEvent::Track(RemoteTrack::new("v1", MediaKind::Video, "remote")));
    h.expect_event(|e| matches!(e, SessionEvent::MediaStream { .. })).await;

    audio.end();
    match h.expect_event(|e| matches!(e, SessionEvent::PeerDisconnected { .. })).await {
        SessionEvent::PeerDisconnected { peer, reason } => {
            assert_eq!(peer, PeerId::from("B"));
            assert_eq!(reason, DisconnectReason::TrackEnded("a1".to_string()));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.session.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_close_notice_from_peer_disconnects_it() {
    let mut h = Harness::joined(MockFactory::new(), "A", &["A", "B"]).await;
    h.expect_signal().await;
    let transport = h.transport("B").await;

    transport.emit(TransportEvent::ChannelMessage(
        r#"{"state":"closed","sender":"B"}"#.to_string(),
    ));
    match h.expect_event(|e| matches!(e, SessionEvent::PeerDisconnected { .. })).await {
        SessionEvent::PeerDisconnected { reason, .. } => {
            assert_eq!(reason, DisconnectReason::RemoteClosed);
        }
        other => panic!("unexpected {:?}", other),
    }
    eventually(|| transport.has(&Call::Close).then_some(())).await;
    let channel = transport.channel().unwrap();
    assert!(channel.is_closed());
}

#[tokio::test]
async fn test_relay_close_is_reported() {
    let mut h = Harness::joined(MockFactory::new(), "A", &["A"]).await;
    h.expect_event(|e| matches!(e, SessionEvent::Joined { .. })).await;

    assert!(h.relay.close());
    h.expect_event(|e| matches!(e, SessionEvent::RelayClosed)).await;
    assert_eq!(
        h.session.status().await.unwrap().state,
        ControllerState::Disconnected
    );
}

#[tokio::test]
async fn test_transport_creation_failure_disconnects_peer() {
    let factory = MockFactory::scripted(Script {
        fail_create: true,
        ..Default::default()
    });
    let mut h = Harness::joined(factory, "A", &["A", "B"]).await;

    match h.expect_event(|e| matches!(e, SessionEvent::PeerDisconnected { .. })).await {
        SessionEvent::PeerDisconnected { peer, reason } => {
            assert_eq!(peer, PeerId::from("B"));
            assert!(matches!(reason, DisconnectReason::TransportUnavailable(_)));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.session.peers().await.unwrap().is_empty());
    assert_eq!(h.factory.attempts(), 1);

    // a later offer gets a fresh attempt
    h.offer_from("B", "retry");
    h.expect_event(|e| matches!(e, SessionEvent::PeerDisconnected { .. })).await;
    assert_eq!(h.factory.attempts(), 2);
    assert!(h.session.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_loop_ends_after_leave_while_streams_are_held() {
    let mut h = Harness::joined(MockFactory::new(), "A", &["A", "B"]).await;
    h.expect_signal().await;
    let transport = h.transport("B").await;

    transport.emit(TransportEvent::Track(RemoteTrack::new("a1", MediaKind::Audio, "s")));
    transport.emit(TransportEvent::Track(RemoteTrack::new("v1", MediaKind::Video, "s")));
    let stream = match h.expect_event(|e| matches!(e, SessionEvent::MediaStream { .. })).await {
        SessionEvent::MediaStream { stream, .. } => stream,
        other => panic!("unexpected {:?}", other),
    };

    h.session.leave().await.unwrap();
    eventually(|| transport.has(&Call::Close).then_some(())).await;

    let Harness {
        session,
        mut events,
        relay,
        factory,
        beacon,
    } = h;
    drop(session);
    drop(relay);
    drop(factory);
    drop(beacon);
    drop(transport);

    let finished = tokio::time::timeout(WAIT, async {
        while events.recv().await.is_some() {}
    })
    .await;
    assert!(finished.is_ok(), "session loop kept running");
    assert_eq!(stream.len(), 2);
    assert!(stream.tracks().iter().all(|t| !t.is_ended()));
}
