//! Adaptive bitrate control through a full CallSession

mod harness;

use harness::*;
use remotemedia_call_session::engine::mock::StatsScript;
use remotemedia_call_session::session::SessionEvent;
use remotemedia_call_session::{BitratePreset, CallSessionConfig, NegotiationPhase, NetworkSample};
use std::time::Duration;

fn sample(packets_lost: u64, frames_per_second: f64) -> StatsScript {
    StatsScript::Sample(NetworkSample {
        bytes_sent: 250_000,
        packets_sent: 1_000,
        packets_lost,
        frames_per_second,
    })
}

async fn active_session() -> TestSession {
    let mut t = TestSession::default_started().await;
    t.negotiate_as_initiator().await;
    t.deliver(answer("v=0 answer")).await;
    t
}

async fn tick(t: &mut TestSession, generation: u64) {
    t.session
        .handle_event(SessionEvent::AdaptationTick { generation })
        .await;
}

#[tokio::test]
async fn test_initial_caps_are_nominal() {
    let t = active_session().await;
    assert_eq!(t.connection(1).applied_bitrates(), vec![BitratePreset::NOMINAL]);

    let video = t.session.local_media().video().expect("video track");
    assert_eq!(video.current_targets(), Some(BitratePreset::NOMINAL));
}

#[tokio::test]
async fn test_heavy_loss_degrades() {
    let mut t = active_session().await;
    t.connection(1).push_stats(sample(25, 30.0));
    tick(&mut t, 1).await;

    assert_eq!(
        t.connection(1).applied_bitrates(),
        vec![BitratePreset::NOMINAL, BitratePreset::REDUCED]
    );
    let video = t.session.local_media().video().expect("video track");
    assert_eq!(video.current_targets(), Some(BitratePreset::REDUCED));
}

#[tokio::test]
async fn test_low_frame_rate_degrades() {
    let mut t = active_session().await;
    t.connection(1).push_stats(sample(0, 8.0));
    tick(&mut t, 1).await;

    assert_eq!(
        t.connection(1).applied_bitrates().last(),
        Some(&BitratePreset::REDUCED)
    );
}

#[tokio::test]
async fn test_recovery_upgrades() {
    let mut t = active_session().await;
    let conn = t.connection(1);
    conn.push_stats(sample(25, 30.0));
    tick(&mut t, 1).await;
    conn.push_stats(sample(0, 30.0));
    tick(&mut t, 1).await;

    assert_eq!(
        conn.applied_bitrates(),
        vec![
            BitratePreset::NOMINAL,
            BitratePreset::REDUCED,
            BitratePreset::NOMINAL
        ]
    );
}

#[tokio::test]
async fn test_hysteresis_band_holds() {
    let mut t = active_session().await;
    let conn = t.connection(1);
    conn.push_stats(sample(25, 30.0));
    tick(&mut t, 1).await;

    // Between the thresholds: neither degrade nor upgrade
    conn.push_stats(sample(10, 30.0));
    tick(&mut t, 1).await;
    conn.push_stats(sample(0, 20.0));
    tick(&mut t, 1).await;

    assert_eq!(
        conn.applied_bitrates(),
        vec![BitratePreset::NOMINAL, BitratePreset::REDUCED]
    );
}

#[tokio::test]
async fn test_repeated_degrade_writes_once() {
    let mut t = active_session().await;
    let conn = t.connection(1);
    for _ in 0..3 {
        conn.push_stats(sample(40, 5.0));
        tick(&mut t, 1).await;
    }

    assert_eq!(
        conn.applied_bitrates(),
        vec![BitratePreset::NOMINAL, BitratePreset::REDUCED]
    );
}

#[tokio::test]
async fn test_missing_stats_change_nothing() {
    let mut t = active_session().await;
    let conn = t.connection(1);
    conn.push_stats(StatsScript::Empty);
    tick(&mut t, 1).await;
    conn.push_stats(StatsScript::Unavailable);
    tick(&mut t, 1).await;

    assert_eq!(conn.applied_bitrates(), vec![BitratePreset::NOMINAL]);
    assert!(!t.session.is_terminated());
}

#[tokio::test]
async fn test_encoding_failure_keeps_previous_caps() {
    let mut t = active_session().await;
    let conn = t.connection(1);
    conn.fail_encoding(true);
    conn.push_stats(sample(25, 30.0));
    tick(&mut t, 1).await;

    let video = t.session.local_media().video().expect("video track");
    assert_eq!(video.current_targets(), Some(BitratePreset::NOMINAL));

    // Once the engine accepts again the same decision goes through
    conn.fail_encoding(false);
    conn.push_stats(sample(25, 30.0));
    tick(&mut t, 1).await;
    assert_eq!(
        conn.applied_bitrates(),
        vec![BitratePreset::NOMINAL, BitratePreset::REDUCED]
    );
}

#[tokio::test]
async fn test_stale_generation_tick_is_ignored() {
    let mut t = active_session().await;
    t.deliver(ice_config()).await;
    let current = t.connection(2);
    current.push_stats(sample(25, 30.0));

    tick(&mut t, 1).await;
    assert_eq!(current.applied_bitrates(), vec![BitratePreset::NOMINAL]);

    tick(&mut t, 2).await;
    assert_eq!(
        current.applied_bitrates(),
        vec![BitratePreset::NOMINAL, BitratePreset::REDUCED]
    );
}

#[tokio::test(start_paused = true)]
async fn test_ticker_samples_on_interval() {
    let mut t = active_session().await;
    let conn = t.connection(1);
    conn.push_stats(sample(25, 30.0));

    tokio::time::sleep(Duration::from_millis(2_900)).await;
    t.settle().await;
    assert_eq!(conn.applied_bitrates(), vec![BitratePreset::NOMINAL]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    t.settle().await;
    assert_eq!(
        conn.applied_bitrates(),
        vec![BitratePreset::NOMINAL, BitratePreset::REDUCED]
    );
}

#[tokio::test(start_paused = true)]
async fn test_disabled_adaptation_never_samples() {
    let mut config = CallSessionConfig::new(RELAY_URL);
    config.adaptation.enabled = false;
    let mut t = TestSession::start(config).await;
    t.negotiate_as_initiator().await;
    t.deliver(answer("v=0 answer")).await;

    let conn = t.connection(1);
    conn.push_stats(sample(25, 30.0));
    tokio::time::sleep(Duration::from_secs(10)).await;
    t.settle().await;

    assert_eq!(conn.applied_bitrates(), vec![BitratePreset::NOMINAL]);
}

#[tokio::test(start_paused = true)]
async fn test_ticker_stops_after_termination() {
    let mut t = active_session().await;
    t.session
        .terminate(remotemedia_call_session::TerminationReason::PeerLeft)
        .await;

    let conn = t.connection(1);
    conn.push_stats(sample(25, 30.0));
    tokio::time::sleep(Duration::from_secs(10)).await;
    t.settle().await;

    assert_eq!(conn.applied_bitrates(), vec![BitratePreset::NOMINAL]);
}

#[tokio::test(start_paused = true)]
async fn test_ticker_runs_when_replayed_offer_is_rejected() {
    let mut t = TestSession::default_started().await;
    t.engine.fail_remote_descriptions(true);
    t.deliver(offer("v=0 early-offer")).await;
    t.deliver(role("responder")).await;
    t.deliver(ice_config()).await;

    let conn = t.connection(1);
    assert_eq!(t.session.phase(), NegotiationPhase::ConnectionReady);
    assert!(t.session.is_adapting());

    conn.push_stats(sample(25, 30.0));
    tokio::time::sleep(Duration::from_secs(10)).await;
    t.settle().await;

    assert_eq!(
        conn.applied_bitrates(),
        vec![BitratePreset::NOMINAL, BitratePreset::REDUCED]
    );
}
