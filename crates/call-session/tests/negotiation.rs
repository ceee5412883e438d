//! Offer/answer ordering through a full CallSession

mod harness;

use harness::*;
use remotemedia_call_session::engine::mock::MockOp;
use remotemedia_call_session::signaling::OutboundEnvelope;
use remotemedia_call_session::signaling::{CandidateDescriptor, SdpKind};
use remotemedia_call_session::{CallSessionConfig, MediaKind, NegotiationPhase, Role};

fn offers(sent: &[OutboundEnvelope]) -> usize {
    sent.iter()
        .filter(|e| matches!(e, OutboundEnvelope::Offer { .. }))
        .count()
}

#[tokio::test]
async fn test_initiator_waits_for_peer_before_offering() {
    let mut t = TestSession::default_started().await;
    t.deliver(role("initiator")).await;
    t.deliver(ice_config()).await;

    assert_eq!(t.session.phase(), NegotiationPhase::ConnectionReady);
    assert_eq!(t.connection(1).offers_created(), 0);
    assert!(t.relay.sent().is_empty());

    t.deliver(peer_joined()).await;
    assert_eq!(t.session.phase(), NegotiationPhase::Negotiating);
    match t.relay.sent().as_slice() {
        [OutboundEnvelope::Offer { data }] => {
            assert_eq!(data.kind, SdpKind::Offer);
            assert_eq!(data.sdp, "v=0 mock-offer-1");
        }
        other => panic!("expected one offer, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ice_servers_reach_the_engine() {
    let mut t = TestSession::default_started().await;
    t.deliver(role("responder")).await;
    t.deliver(ice_config()).await;

    let configs = t.engine.ice_configs();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].stun_url.as_deref(), Some("stun:stun.test:3478"));
    assert_eq!(configs[0].turn_credential.as_deref(), Some("secret"));
}

#[tokio::test]
async fn test_single_offer_despite_repeated_peer_joined() {
    let mut t = TestSession::default_started().await;
    t.negotiate_as_initiator().await;
    t.deliver(peer_joined()).await;
    t.deliver(peer_joined()).await;

    assert_eq!(t.connection(1).offers_created(), 1);
    assert_eq!(offers(&t.relay.sent()), 1);
}

#[tokio::test]
async fn test_responder_never_offers() {
    let mut t = TestSession::default_started().await;
    t.deliver(role("responder")).await;
    t.deliver(ice_config()).await;
    t.deliver(peer_joined()).await;

    assert_eq!(t.connection(1).offers_created(), 0);
    assert!(t.relay.sent().is_empty());

    t.deliver(offer("v=0 remote-offer")).await;
    assert_eq!(t.session.phase(), NegotiationPhase::Active);
    assert!(t.session.remote_description_applied());
    assert!(matches!(
        t.relay.sent().as_slice(),
        [OutboundEnvelope::Answer { .. }]
    ));
    assert_eq!(t.connection(1).remote_descriptions(), vec![SdpKind::Offer]);
}

#[tokio::test]
async fn test_role_assigned_once() {
    let mut t = TestSession::default_started().await;
    t.deliver(role("responder")).await;
    t.deliver(role("initiator")).await;

    assert_eq!(t.session.role(), Role::Responder);
    let roles: Vec<_> = t
        .observer
        .events()
        .into_iter()
        .filter(|e| matches!(e, Observed::Role(_)))
        .collect();
    assert_eq!(roles, vec![Observed::Role(Role::Responder)]);
}

#[tokio::test]
async fn test_invalid_role_blocks_negotiation() {
    let mut t = TestSession::default_started().await;
    t.deliver(role("moderator")).await;
    t.deliver(ice_config()).await;
    t.deliver(peer_joined()).await;

    assert_eq!(t.session.role(), Role::Unknown);
    assert_eq!(t.session.phase(), NegotiationPhase::RolePending);
    assert!(t.engine.connections().is_empty());
    assert!(t.relay.sent().is_empty());
}

#[tokio::test]
async fn test_initiator_rejects_offers() {
    let mut t = TestSession::default_started().await;
    t.negotiate_as_initiator().await;
    t.deliver(offer("v=0 glare")).await;

    let conn = t.connection(1);
    assert!(conn.remote_descriptions().is_empty());
    assert_eq!(conn.answers_created(), 0);
    assert_eq!(t.session.phase(), NegotiationPhase::Negotiating);
    assert!(!t.session.is_terminated());
}

#[tokio::test]
async fn test_duplicate_answer_is_ignored() {
    let mut t = TestSession::default_started().await;
    t.negotiate_as_initiator().await;
    t.deliver(answer("v=0 first")).await;
    t.deliver(answer("v=0 second")).await;

    assert_eq!(t.connection(1).remote_descriptions(), vec![SdpKind::Answer]);
    assert_eq!(t.session.phase(), NegotiationPhase::Active);
}

#[tokio::test]
async fn test_candidates_before_anything_are_kept_for_first_generation() {
    let mut t = TestSession::default_started().await;
    t.deliver(candidate("candidate:early-1")).await;
    t.deliver(candidate("candidate:early-2")).await;
    assert_eq!(t.session.pending_candidates(), 2);

    t.deliver(offer("v=0 early-offer")).await;
    t.deliver(role("responder")).await;
    t.deliver(ice_config()).await;

    let ops = t.connection(1).ops();
    let set_remote = ops
        .iter()
        .position(|op| matches!(op, MockOp::SetRemoteDescription(SdpKind::Offer)))
        .expect("offer applied");
    let first_candidate = ops
        .iter()
        .position(|op| matches!(op, MockOp::AddCandidate(_)))
        .expect("candidates applied");
    assert!(set_remote < first_candidate);
    assert_eq!(
        t.connection(1).candidates_added(),
        vec!["candidate:early-1", "candidate:early-2"]
    );
    assert_eq!(t.session.pending_candidates(), 0);
}

#[tokio::test]
async fn test_end_of_candidates_marker_is_ignored() {
    let mut t = TestSession::default_started().await;
    let delivered = t
        .deliver(serde_json::json!({
            "type": "webrtc_signal",
            "signal_type": "candidate",
            "data": null
        }))
        .await;

    assert!(!delivered);
    assert_eq!(t.session.pending_candidates(), 0);
}

#[tokio::test]
async fn test_malformed_and_unknown_frames_are_dropped() {
    let mut t = TestSession::default_started().await;
    assert!(!t.relay.deliver_raw("{not json"));
    assert!(!t.relay.deliver_raw(r#"{"type":"typing_indicator"}"#));
    t.settle().await;

    t.deliver(role("responder")).await;
    assert_eq!(t.session.role(), Role::Responder);
}

#[tokio::test]
async fn test_local_candidates_from_stale_generation_are_dropped() {
    let mut t = TestSession::default_started().await;
    t.deliver(role("responder")).await;
    t.deliver(ice_config()).await;
    let first = t.connection(1);

    t.deliver(ice_config()).await;
    assert_eq!(first.close_count(), 1);
    assert_eq!(t.session.generation(), Some(2));

    first.emit_local_candidate(CandidateDescriptor::new("candidate:stale"));
    t.connection(2)
        .emit_local_candidate(CandidateDescriptor::new("candidate:fresh").with_mid("0", 0));
    t.settle().await;

    match t.relay.sent().as_slice() {
        [OutboundEnvelope::Candidate { data }] => {
            assert_eq!(data.candidate, "candidate:fresh");
            assert_eq!(data.sdp_mid.as_deref(), Some("0"));
        }
        other => panic!("expected one candidate, got {:?}", other),
    }
}

#[tokio::test]
async fn test_remote_tracks_only_from_current_generation() {
    let mut t = TestSession::default_started().await;
    t.deliver(role("responder")).await;
    t.deliver(ice_config()).await;
    t.deliver(ice_config()).await;

    t.connection(1).emit_remote_track(MediaKind::Video);
    t.connection(2).emit_remote_track(MediaKind::Video);
    t.settle().await;

    assert_eq!(t.observer.remote_tracks(), vec!["remote-video-2".to_string()]);
}

#[tokio::test]
async fn test_new_generation_renegotiates() {
    let mut t = TestSession::default_started().await;
    t.negotiate_as_initiator().await;
    t.deliver(answer("v=0 answer-1")).await;
    assert_eq!(t.session.phase(), NegotiationPhase::Active);

    // A fresh ICE config replaces the connection and offers again
    t.deliver(ice_config()).await;
    assert_eq!(t.session.generation(), Some(2));
    assert!(!t.session.remote_description_applied());
    assert_eq!(t.connection(2).offers_created(), 1);
    assert_eq!(offers(&t.relay.sent()), 2);
}

#[tokio::test]
async fn test_video_falls_back_to_single_layer() {
    let mut t = TestSession::default_started().await;
    t.engine.reject_simulcast(true);
    t.deliver(role("responder")).await;
    t.deliver(ice_config()).await;

    let ops = t.connection(1).ops();
    assert!(ops.iter().any(|op| matches!(
        op,
        MockOp::AttachTrack {
            kind: MediaKind::Video,
            ..
        }
    )));
    assert!(!ops.iter().any(|op| matches!(op, MockOp::AttachSimulcast { .. })));
    assert_eq!(t.session.phase(), NegotiationPhase::ConnectionReady);
}

#[tokio::test]
async fn test_chat_both_directions() {
    let mut t = TestSession::default_started().await;
    t.deliver(serde_json::json!({
        "type": "chat_message",
        "sender_id": "peer-b",
        "content": "hello",
        "timestamp": "2024-01-01T00:00:00"
    }))
    .await;
    assert!(t.observer.events().contains(&Observed::Chat("hello".to_string())));

    assert!(t.session.handle().send_chat("hi back"));
    t.settle().await;
    assert_eq!(
        t.relay.sent(),
        vec![OutboundEnvelope::ChatMessage {
            content: "hi back".to_string()
        }]
    );
}

#[tokio::test]
async fn test_rejected_offer_is_dropped_without_transition() {
    let mut t = TestSession::default_started().await;
    t.deliver(role("responder")).await;
    t.deliver(ice_config()).await;
    let conn = t.connection(1);
    conn.fail_remote_description(true);

    t.deliver(offer("v=0 unusable")).await;

    assert_eq!(t.session.phase(), NegotiationPhase::ConnectionReady);
    assert!(!t.session.remote_description_applied());
    assert_eq!(conn.answers_created(), 0);
    assert!(t.relay.sent().is_empty());
    assert!(!t.session.is_terminated());
}

#[tokio::test]
async fn test_rejected_answer_keeps_candidates_buffered() {
    let mut t = TestSession::default_started().await;
    t.negotiate_as_initiator().await;
    t.deliver(candidate("candidate:1")).await;
    let conn = t.connection(1);
    conn.fail_remote_description(true);

    t.deliver(answer("v=0 unusable")).await;
    assert_eq!(t.session.phase(), NegotiationPhase::Negotiating);
    assert_eq!(t.session.pending_candidates(), 1);
    assert!(conn.candidates_added().is_empty());

    // The relay forwards a usable answer later
    conn.fail_remote_description(false);
    t.deliver(answer("v=0 answer")).await;
    assert_eq!(t.session.phase(), NegotiationPhase::Active);
    assert_eq!(conn.candidates_added(), vec!["candidate:1".to_string()]);
}

#[tokio::test]
async fn test_candidate_buffer_overflow_drops_newest() {
    let mut config = CallSessionConfig::new(RELAY_URL);
    config.max_pending_candidates = 2;
    let mut t = TestSession::start(config).await;

    for n in 1..=3 {
        t.deliver(candidate(&format!("candidate:{}", n))).await;
    }
    assert_eq!(t.session.pending_candidates(), 2);
    assert_eq!(t.session.dropped_candidates(), 1);

    t.deliver(role("responder")).await;
    t.deliver(ice_config()).await;
    t.deliver(offer("v=0 offer")).await;

    assert_eq!(
        t.connection(1).candidates_added(),
        vec!["candidate:1".to_string(), "candidate:2".to_string()]
    );
    assert_eq!(t.session.pending_candidates(), 0);
}
