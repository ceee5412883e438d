//! Headless call client
//!
//! Joins a matched session on the signaling relay with synthetic capture and
//! runs it until the call ends or Ctrl+C is pressed.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin call_client -- \
//!   --signaling-url wss://relay.example.com \
//!   --session-id 3f1c... \
//!   --token eyJhbGciOi...
//!
//! # Constrained link preset with JSON logs
//! cargo run --bin call_client -- \
//!   --preset low-bandwidth --log-format json \
//!   --session-id 3f1c... --token eyJhbGciOi...
//! ```

use anyhow::Context;
use clap::Parser;
use remotemedia_call_session::{
    CallSession, CallSessionConfig, ChatMessage, ConnectionStatus, EndReason, LocalTrack,
    RemoteTrack, Role, SessionCredentials, SessionObserver, SyntheticCapture, TerminationReason,
    WebRtcEngine, WebSocketConnector,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// One-to-one video call client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling relay base URL
    #[arg(
        long,
        default_value = "ws://localhost:8000",
        env = "CALL_SIGNALING_URL"
    )]
    signaling_url: String,

    /// Session id assigned by matchmaking
    #[arg(long, env = "CALL_SESSION_ID")]
    session_id: String,

    /// Auth token for the relay
    #[arg(long, env = "CALL_AUTH_TOKEN")]
    token: String,

    /// Matched peer's user id (informational)
    #[arg(long, env = "CALL_PEER_ID")]
    peer: Option<String>,

    /// Configuration preset
    #[arg(long, env = "CALL_PRESET")]
    preset: Option<ConfigPreset>,

    /// Adaptation sampling interval in milliseconds
    #[arg(long, env = "CALL_ADAPTATION_INTERVAL_MS")]
    adaptation_interval_ms: Option<u64>,

    /// Disable adaptive bitrate
    #[arg(long, default_value_t = false)]
    no_adaptation: bool,

    /// Send a single video encoding instead of three
    #[arg(long, default_value_t = false)]
    no_simulcast: bool,

    /// End the call if negotiation takes longer than this many seconds
    #[arg(long, env = "CALL_NEGOTIATION_TIMEOUT")]
    negotiation_timeout_secs: Option<u64>,

    /// Log output format
    #[arg(long, default_value = "text", env = "CALL_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ConfigPreset {
    /// 360p capture, lower caps, faster sampling
    LowBandwidth,
    /// 1080p capture, default caps
    HighQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Build the session config from CLI arguments; explicit flags override presets
fn build_config_from_args(args: &Args) -> anyhow::Result<CallSessionConfig> {
    let mut config = match args.preset {
        Some(ConfigPreset::LowBandwidth) => {
            info!("Using low_bandwidth preset");
            CallSessionConfig::low_bandwidth_preset(&args.signaling_url)
        }
        Some(ConfigPreset::HighQuality) => {
            info!("Using high_quality preset");
            CallSessionConfig::high_quality_preset(&args.signaling_url)
        }
        None => CallSessionConfig::new(args.signaling_url.clone()),
    };

    if let Some(interval) = args.adaptation_interval_ms {
        config.adaptation.interval_ms = interval;
    }
    if args.no_adaptation {
        config.adaptation.enabled = false;
    }
    if args.no_simulcast {
        config.simulcast_enabled = false;
    }
    if let Some(secs) = args.negotiation_timeout_secs {
        config = config.with_negotiation_timeout(Duration::from_secs(secs));
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Observer that reports session progress to the log
struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_status_changed(&self, status: ConnectionStatus) {
        info!(?status, "Signaling status changed");
    }

    fn on_role_assigned(&self, role: Role) {
        info!(%role, "Role assigned");
    }

    fn on_local_track_ready(&self, track: &LocalTrack) {
        info!(kind = %track.kind(), label = track.label(), "Local track ready");
    }

    fn on_remote_track_ready(&self, track: &RemoteTrack) {
        info!(kind = %track.kind, id = %track.id, "Remote track ready");
    }

    fn on_chat_message(&self, message: &ChatMessage) {
        info!(
            from = message.sender_id.as_deref().unwrap_or("unknown"),
            "Chat: {}",
            message.content
        );
    }

    fn on_terminated(&self, reason: &TerminationReason) {
        info!(%reason, "Call ended");
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,remotemedia_call_session=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        session = %args.session_id,
        "Call client starting"
    );

    let config = build_config_from_args(&args)?;
    let mut credentials = SessionCredentials::new(args.session_id.clone(), args.token.clone());
    if let Some(peer) = &args.peer {
        credentials = credentials.with_peer(peer.clone());
    }

    let session = CallSession::start(
        config,
        credentials,
        &SyntheticCapture::new(),
        Arc::new(WebRtcEngine::new()),
        &WebSocketConnector::default(),
        Arc::new(LoggingObserver),
    )
    .await
    .context("failed to start call session")?;

    let handle = session.handle();
    let mut driver = tokio::spawn(session.run());

    let reason = tokio::select! {
        result = &mut driver => result.context("session task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, ending call");
            if !handle.end(EndReason::UserEnded) {
                warn!("Session already ended");
            }
            driver.await.context("session task panicked")?
        }
    };

    info!(%reason, "Call client exiting");
    Ok(())
}
