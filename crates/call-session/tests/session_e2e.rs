//! Initiator call from relay handshake to flowing media

mod harness;

use harness::*;
use remotemedia_call_session::engine::mock::MockOp;
use remotemedia_call_session::signaling::{OutboundEnvelope, SdpKind};
use remotemedia_call_session::{
    BitratePreset, ConnectionStatus, EndReason, NegotiationPhase, Role, TerminationReason,
};

#[tokio::test]
async fn test_initiator_call_end_to_end() {
    let mut t = TestSession::default_started().await;

    // Relay assigns the initiator role, then hands out ICE servers
    t.deliver(role("initiator")).await;
    assert_eq!(t.session.role(), Role::Initiator);
    t.deliver(ice_config()).await;
    assert_eq!(t.session.generation(), Some(1));
    let conn = t.connection(1);

    // Peer arrives: one offer goes out
    t.deliver(peer_joined()).await;
    assert_eq!(conn.offers_created(), 1);
    assert!(matches!(
        t.relay.sent().as_slice(),
        [OutboundEnvelope::Offer { data }] if data.kind == SdpKind::Offer
    ));

    // Two candidates overtake the answer
    t.deliver(candidate("candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host"))
        .await;
    t.deliver(candidate("candidate:2 1 udp 1686052607 203.0.113.7 54321 typ srflx"))
        .await;
    assert_eq!(t.session.pending_candidates(), 2);
    assert!(conn.candidates_added().is_empty());
    assert!(!t.session.remote_description_applied());

    // Answer lands: description first, then the buffered candidates in order
    t.deliver(answer("v=0 remote-answer")).await;
    assert!(t.session.remote_description_applied());
    assert_eq!(t.session.pending_candidates(), 0);
    assert_eq!(t.session.phase(), NegotiationPhase::Active);
    assert_eq!(t.session.status(), ConnectionStatus::Connected);

    let after_answer: Vec<MockOp> = conn
        .ops()
        .into_iter()
        .skip_while(|op| !matches!(op, MockOp::SetRemoteDescription(_)))
        .collect();
    assert_eq!(
        after_answer,
        vec![
            MockOp::SetRemoteDescription(SdpKind::Answer),
            MockOp::AddCandidate(
                "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string()
            ),
            MockOp::AddCandidate(
                "candidate:2 1 udp 1686052607 203.0.113.7 54321 typ srflx".to_string()
            ),
        ]
    );

    // Simulcast video went out at nominal caps
    assert!(conn
        .ops()
        .iter()
        .any(|op| matches!(op, MockOp::AttachSimulcast { .. })));
    assert_eq!(conn.applied_bitrates(), vec![BitratePreset::NOMINAL]);

    // Remote media shows up and the user hangs up
    conn.emit_remote_track(remotemedia_call_session::MediaKind::Video);
    t.settle().await;
    assert_eq!(t.observer.remote_tracks(), vec!["remote-video-1".to_string()]);

    t.session.handle().end(EndReason::UserEnded);
    t.settle().await;
    assert_eq!(
        t.observer.terminations(),
        vec![TerminationReason::Local(EndReason::UserEnded)]
    );
    assert_eq!(conn.close_count(), 1);
}

#[tokio::test]
async fn test_responder_call_end_to_end() {
    let mut t = TestSession::default_started().await;

    // Offer and a candidate race ahead of the role and ICE config
    t.deliver(offer("v=0 remote-offer")).await;
    t.deliver(candidate("candidate:a")).await;
    t.deliver(ice_config()).await;
    t.deliver(role("responder")).await;

    let conn = t.connection(1);
    assert_eq!(conn.offers_created(), 0);
    assert_eq!(conn.answers_created(), 1);
    assert_eq!(conn.candidates_added(), vec!["candidate:a".to_string()]);
    assert_eq!(t.session.phase(), NegotiationPhase::Active);

    match t.relay.sent().as_slice() {
        [OutboundEnvelope::Answer { data }] => assert_eq!(data.sdp, "v=0 mock-answer-1"),
        other => panic!("expected one answer, got {:?}", other),
    }

    // Late candidates go straight to the engine
    t.deliver(candidate("candidate:b")).await;
    assert_eq!(
        conn.candidates_added(),
        vec!["candidate:a".to_string(), "candidate:b".to_string()]
    );
}
