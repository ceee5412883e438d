//! Signaling envelopes exchanged with the relay
//!
//! Inbound messages are decoded into the closed [`SignalEnvelope`] enum.
//! The decoder accepts two vocabularies for the same concepts: the
//! canonical tags (`role`, `ice_server_config`, `peer_joined`, ...) and the
//! relay's own tags (`stun_turn`, `user_connected`, `webrtc_signal`, ...).
//! Unknown tags decode to `Ok(None)` and are never fatal.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace};

/// STUN server used when the relay supplies no ICE servers at all
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate, in the browser `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateDescriptor {
    pub candidate: String,

    #[serde(default, alias = "sdp_mid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(
        default,
        rename = "sdpMLineIndex",
        alias = "sdp_mline_index",
        alias = "sdpMlineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    #[serde(
        default,
        alias = "username_fragment",
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl CandidateDescriptor {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_mline_index = Some(sdp_mline_index);
        self
    }
}

/// STUN/TURN servers for one connection generation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    #[serde(default, rename = "stunUrl", alias = "stun", alias = "stun_url")]
    pub stun_url: Option<String>,

    #[serde(default, rename = "turnUrl", alias = "turn", alias = "turn_url")]
    pub turn_url: Option<String>,

    #[serde(default, rename = "turnUsername", alias = "turn_username")]
    pub turn_username: Option<String>,

    #[serde(
        default,
        rename = "turnCredential",
        alias = "turn_password",
        alias = "turn_credential"
    )]
    pub turn_credential: Option<String>,
}

/// One ICE server entry ready to hand to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServerConfig {
    /// Server list for the engine
    ///
    /// Blank URLs are skipped. When neither STUN nor TURN is usable the
    /// public default STUN server is returned.
    pub fn entries(&self) -> Vec<IceServerEntry> {
        let mut entries = Vec::new();

        if let Some(stun) = non_blank(&self.stun_url) {
            entries.push(IceServerEntry {
                urls: vec![stun.to_string()],
                username: String::new(),
                credential: String::new(),
            });
        }

        if let Some(turn) = non_blank(&self.turn_url) {
            entries.push(IceServerEntry {
                urls: vec![turn.to_string()],
                username: self.turn_username.clone().unwrap_or_default(),
                credential: self.turn_credential.clone().unwrap_or_default(),
            });
        }

        if entries.is_empty() {
            entries.push(IceServerEntry {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                username: String::new(),
                credential: String::new(),
            });
        }

        entries
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Chat line relayed alongside signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, alias = "senderId")]
    pub sender_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Inbound signaling envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEnvelope {
    /// Role assignment; the raw value is validated by the role assigner
    Role { role: String },
    IceServerConfig(IceServerConfig),
    PeerJoined { peer_id: Option<String> },
    PeerLeft { peer_id: Option<String> },
    SessionTerminated { reason: Option<String> },
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(CandidateDescriptor),
    Chat(ChatMessage),
}

impl SignalEnvelope {
    /// Decode one text frame
    ///
    /// # Returns
    ///
    /// `Ok(None)` for well-formed envelopes with a tag this client does not
    /// handle, `Err(MalformedSignal)` when the frame cannot be decoded.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedSignal(format!("invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    /// Decode an already-parsed JSON value
    pub fn from_value(value: &Value) -> Result<Option<Self>> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MalformedSignal("envelope is not a JSON object".to_string()))?;

        let tag = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedSignal("envelope has no type tag".to_string()))?;

        trace!("Decoding envelope type={}", tag);

        let envelope = match tag {
            "role" => {
                let role = scalar_field(obj, &["role"])
                    .ok_or_else(|| Error::MalformedSignal("role envelope without role".into()))?;
                SignalEnvelope::Role { role }
            }
            "ice_server_config" | "stun_turn" => {
                let body = nested_object(obj, &["data", "config"]).unwrap_or(obj);
                let config = serde_json::from_value(Value::Object(body.clone())).map_err(|e| {
                    Error::MalformedSignal(format!("invalid ICE server config: {}", e))
                })?;
                SignalEnvelope::IceServerConfig(config)
            }
            "peer_joined" | "user_connected" => SignalEnvelope::PeerJoined {
                peer_id: scalar_field(obj, PEER_ID_KEYS),
            },
            "peer_left" | "user_disconnected" => SignalEnvelope::PeerLeft {
                peer_id: scalar_field(obj, PEER_ID_KEYS),
            },
            "session_terminated" | "session_ended" => SignalEnvelope::SessionTerminated {
                reason: scalar_field(obj, &["reason"]),
            },
            "chat" | "chat_message" | "message" => {
                let chat = serde_json::from_value(value.clone())
                    .map_err(|e| Error::MalformedSignal(format!("invalid chat message: {}", e)))?;
                SignalEnvelope::Chat(chat)
            }
            "offer" | "answer" | "candidate" | "webrtc_signal" | "signal" => {
                let signal_type = obj
                    .get("signal_type")
                    .and_then(Value::as_str)
                    .unwrap_or(tag);
                return Self::decode_webrtc_signal(signal_type, obj);
            }
            other => {
                debug!("Ignoring envelope with unknown type '{}'", other);
                return Ok(None);
            }
        };

        Ok(Some(envelope))
    }

    fn decode_webrtc_signal(signal_type: &str, obj: &Map<String, Value>) -> Result<Option<Self>> {
        match signal_type {
            "offer" => Ok(Some(SignalEnvelope::Offer(decode_description(
                SdpKind::Offer,
                obj,
            )?))),
            "answer" => Ok(Some(SignalEnvelope::Answer(decode_description(
                SdpKind::Answer,
                obj,
            )?))),
            "candidate" => Ok(decode_candidate(obj)?.map(SignalEnvelope::Candidate)),
            "webrtc_signal" | "signal" => Err(Error::MalformedSignal(
                "webrtc signal without signal_type".to_string(),
            )),
            other => {
                debug!("Ignoring webrtc signal with unknown signal_type '{}'", other);
                Ok(None)
            }
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalEnvelope::Role { .. } => "role",
            SignalEnvelope::IceServerConfig(_) => "ice_server_config",
            SignalEnvelope::PeerJoined { .. } => "peer_joined",
            SignalEnvelope::PeerLeft { .. } => "peer_left",
            SignalEnvelope::SessionTerminated { .. } => "session_terminated",
            SignalEnvelope::Offer(_) => "offer",
            SignalEnvelope::Answer(_) => "answer",
            SignalEnvelope::Candidate(_) => "candidate",
            SignalEnvelope::Chat(_) => "chat",
        }
    }
}

const PEER_ID_KEYS: &[&str] = &["peerId", "peer_id", "user_id"];
const DESCRIPTION_KEYS: &[&str] = &["sessionDescription", "data", "sdp"];
const CANDIDATE_KEYS: &[&str] = &["candidateDescriptor", "data", "candidate"];

/// First present key rendered as a string (numbers are accepted for ids)
fn scalar_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn nested_object<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Map<String, Value>> {
    keys.iter().find_map(|key| obj.get(*key).and_then(Value::as_object))
}

fn decode_description(expected: SdpKind, obj: &Map<String, Value>) -> Result<SessionDescription> {
    let payload = DESCRIPTION_KEYS
        .iter()
        .find_map(|key| obj.get(*key).filter(|v| !v.is_null()))
        .ok_or_else(|| Error::MalformedSignal("session description missing".to_string()))?;

    let description = match payload {
        Value::String(sdp) => SessionDescription {
            kind: expected,
            sdp: sdp.clone(),
        },
        Value::Object(inner) => {
            let sdp = inner
                .get("sdp")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::MalformedSignal("session description has no sdp".into()))?;
            let kind = match inner.get("type").and_then(Value::as_str) {
                None => expected,
                Some("offer") => SdpKind::Offer,
                Some("answer") => SdpKind::Answer,
                Some(other) => {
                    return Err(Error::MalformedSignal(format!(
                        "unsupported session description type '{}'",
                        other
                    )))
                }
            };
            SessionDescription {
                kind,
                sdp: sdp.to_string(),
            }
        }
        _ => {
            return Err(Error::MalformedSignal(
                "session description must be a string or object".to_string(),
            ))
        }
    };

    if description.kind != expected {
        return Err(Error::MalformedSignal(format!(
            "{:?} envelope carries a {:?} description",
            expected, description.kind
        )));
    }

    Ok(description)
}

fn decode_candidate(obj: &Map<String, Value>) -> Result<Option<CandidateDescriptor>> {
    let payload = CANDIDATE_KEYS.iter().find_map(|key| obj.get(*key));

    let body = match payload {
        // End-of-candidates marker
        None | Some(Value::Null) => {
            debug!("Received end-of-candidates marker");
            return Ok(None);
        }
        Some(Value::Object(inner)) => Value::Object(inner.clone()),
        // Flat form: the candidate line sits next to sdpMid at top level
        Some(Value::String(_)) => Value::Object(obj.clone()),
        Some(_) => {
            return Err(Error::MalformedSignal(
                "candidate must be an object".to_string(),
            ))
        }
    };

    let descriptor: CandidateDescriptor = serde_json::from_value(body)
        .map_err(|e| Error::MalformedSignal(format!("invalid candidate: {}", e)))?;

    if descriptor.candidate.is_empty() {
        debug!("Received empty candidate (end-of-candidates)");
        return Ok(None);
    }

    Ok(Some(descriptor))
}

/// Outbound signaling envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEnvelope {
    Offer { data: SessionDescription },
    Answer { data: SessionDescription },
    Candidate { data: CandidateDescriptor },
    EndSession { reason: String },
    ChatMessage { content: String },
}

impl OutboundEnvelope {
    /// Serialize for the wire
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEnvelope::Offer { .. } => "offer",
            OutboundEnvelope::Answer { .. } => "answer",
            OutboundEnvelope::Candidate { .. } => "candidate",
            OutboundEnvelope::EndSession { .. } => "end_session",
            OutboundEnvelope::ChatMessage { .. } => "chat_message",
        }
    }
}
