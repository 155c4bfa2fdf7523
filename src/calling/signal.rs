//! Signal wire format.
//!
//! Every frame on the signaling socket is a JSON object
//! `{ "type", "to", "from", "payload" }`. Decoding goes through an untyped
//! envelope first so that unknown `type` values can be skipped instead of
//! failing, then the payload is parsed into the variant for that type.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a call participant (the user id on the chat socket).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("malformed signal: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Why a call was rejected. Unrecognised reasons from newer peers decode as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    Busy,
    Declined,
    MediaUnavailable,
    #[serde(other)]
    Other,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Busy => "busy",
            RejectReason::Declined => "declined",
            RejectReason::MediaUnavailable => "media unavailable",
            RejectReason::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP blob plus its role, shaped like a browser `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate, shaped like a browser `RTCIceCandidateInit`.
///
/// An empty `candidate` string marks end-of-candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RejectPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<RejectReason>,
}

/// Ring signaling (`call.*`) versus media negotiation (`webrtc.*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalFamily {
    Call,
    Media,
}

/// Typed signal body, one variant per recognised `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    CallStart,
    CallAccept,
    CallReject { reason: Option<RejectReason> },
    CallEnd,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Ice(IceCandidateInit),
}

impl SignalKind {
    pub const CALL_START: &'static str = "call.start";
    pub const CALL_ACCEPT: &'static str = "call.accept";
    pub const CALL_REJECT: &'static str = "call.reject";
    pub const CALL_END: &'static str = "call.end";
    pub const OFFER: &'static str = "webrtc.offer";
    pub const ANSWER: &'static str = "webrtc.answer";
    pub const ICE: &'static str = "webrtc.ice";

    /// Wire `type` string for this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalKind::CallStart => Self::CALL_START,
            SignalKind::CallAccept => Self::CALL_ACCEPT,
            SignalKind::CallReject { .. } => Self::CALL_REJECT,
            SignalKind::CallEnd => Self::CALL_END,
            SignalKind::Offer(_) => Self::OFFER,
            SignalKind::Answer(_) => Self::ANSWER,
            SignalKind::Ice(_) => Self::ICE,
        }
    }

    pub fn family(&self) -> SignalFamily {
        match self {
            SignalKind::CallStart
            | SignalKind::CallAccept
            | SignalKind::CallReject { .. }
            | SignalKind::CallEnd => SignalFamily::Call,
            SignalKind::Offer(_) | SignalKind::Answer(_) | SignalKind::Ice(_) => {
                SignalFamily::Media
            }
        }
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            SignalKind::CallStart | SignalKind::CallAccept | SignalKind::CallEnd => Ok(Value::Null),
            SignalKind::CallReject { reason } => {
                serde_json::to_value(RejectPayload { reason: *reason })
            }
            SignalKind::Offer(desc) | SignalKind::Answer(desc) => serde_json::to_value(desc),
            SignalKind::Ice(candidate) => serde_json::to_value(candidate),
        }
    }

    fn from_parts(kind: &str, payload: Value) -> Result<Option<Self>, SignalError> {
        let parsed = match kind {
            Self::CALL_START => SignalKind::CallStart,
            Self::CALL_ACCEPT => SignalKind::CallAccept,
            Self::CALL_END => SignalKind::CallEnd,
            Self::CALL_REJECT => {
                let reason = if payload.is_null() {
                    None
                } else {
                    serde_json::from_value::<RejectPayload>(payload)
                        .map_err(|source| SignalError::Payload {
                            kind: Self::CALL_REJECT,
                            source,
                        })?
                        .reason
                };
                SignalKind::CallReject { reason }
            }
            Self::OFFER => SignalKind::Offer(description(Self::OFFER, SdpType::Offer, payload)?),
            Self::ANSWER => {
                SignalKind::Answer(description(Self::ANSWER, SdpType::Answer, payload)?)
            }
            Self::ICE => SignalKind::Ice(serde_json::from_value(payload).map_err(|source| {
                SignalError::Payload {
                    kind: Self::ICE,
                    source,
                }
            })?),
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }
}

/// Accept either a full `{type, sdp}` object or a bare SDP string.
fn description(
    kind: &'static str,
    expected: SdpType,
    payload: Value,
) -> Result<SessionDescription, SignalError> {
    if let Value::String(sdp) = payload {
        return Ok(SessionDescription {
            sdp_type: expected,
            sdp,
        });
    }
    serde_json::from_value(payload).map_err(|source| SignalError::Payload { kind, source })
}

/// Untyped envelope as it appears on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct RawSignal {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

/// A decoded signal with its addressing.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    pub from: Option<ParticipantId>,
    /// `None` means broadcast.
    pub to: Option<ParticipantId>,
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Signal(Signal),
    /// Well-formed envelope with a `type` this build does not know.
    Unknown(String),
}

impl Signal {
    pub fn new(kind: SignalKind, from: ParticipantId, to: ParticipantId) -> Self {
        Self {
            kind,
            from: Some(from),
            to: Some(to),
        }
    }

    /// True when `to` is absent or equals `local`.
    pub fn is_addressed_to(&self, local: &ParticipantId) -> bool {
        self.to.as_ref().map_or(true, |to| to == local)
    }

    pub fn decode(text: &str) -> Result<Decoded, SignalError> {
        let raw: RawSignal = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSignal) -> Result<Decoded, SignalError> {
        match SignalKind::from_parts(&raw.kind, raw.payload)? {
            Some(kind) => Ok(Decoded::Signal(Signal {
                kind,
                from: raw.from,
                to: raw.to,
            })),
            None => Ok(Decoded::Unknown(raw.kind)),
        }
    }

    pub fn to_value(&self) -> Result<Value, SignalError> {
        let raw = RawSignal {
            kind: self.kind.type_name().to_string(),
            to: self.to.clone(),
            from: self.from.clone(),
            payload: self.kind.payload()?,
        };
        Ok(serde_json::to_value(raw)?)
    }

    pub fn encode(&self) -> Result<String, SignalError> {
        Ok(self.to_value()?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_known(text: &str) -> Signal {
        match Signal::decode(text).unwrap() {
            Decoded::Signal(s) => s,
            Decoded::Unknown(t) => panic!("unexpected unknown type {}", t),
        }
    }

    #[test]
    fn test_decode_call_start() {
        let s = decode_known(r#"{"type":"call.start","from":"U3","to":"me"}"#);
        assert_eq!(s.kind, SignalKind::CallStart);
        assert_eq!(s.from, Some(ParticipantId::from("U3")));
        assert_eq!(s.to, Some(ParticipantId::from("me")));
        assert_eq!(s.kind.family(), SignalFamily::Call);
    }

    #[test]
    fn test_decode_reject_with_and_without_reason() {
        let busy = decode_known(r#"{"type":"call.reject","from":"U2","payload":{"reason":"busy"}}"#);
        assert_eq!(
            busy.kind,
            SignalKind::CallReject {
                reason: Some(RejectReason::Busy)
            }
        );

        let bare = decode_known(r#"{"type":"call.reject","from":"U2"}"#);
        assert_eq!(bare.kind, SignalKind::CallReject { reason: None });

        let novel =
            decode_known(r#"{"type":"call.reject","from":"U2","payload":{"reason":"do-not-disturb"}}"#);
        assert_eq!(
            novel.kind,
            SignalKind::CallReject {
                reason: Some(RejectReason::Other)
            }
        );
    }

    #[test]
    fn test_decode_offer_object_and_bare_string() {
        let obj = decode_known(
            r#"{"type":"webrtc.offer","from":"U2","to":"me","payload":{"type":"offer","sdp":"v=0\r\n"}}"#,
        );
        assert_eq!(obj.kind, SignalKind::Offer(SessionDescription::offer("v=0\r\n")));
        assert_eq!(obj.kind.family(), SignalFamily::Media);

        let bare = decode_known(r#"{"type":"webrtc.answer","from":"U2","payload":"v=0"}"#);
        assert_eq!(bare.kind, SignalKind::Answer(SessionDescription::answer("v=0")));
    }

    #[test]
    fn test_decode_ice_browser_shape() {
        let s = decode_known(
            r#"{"type":"webrtc.ice","from":"U2","to":"me","payload":{"candidate":"candidate:1 1 UDP 2130706431 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}}"#,
        );
        match s.kind {
            SignalKind::Ice(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_m_line_index, Some(0));
                assert_eq!(c.username_fragment.as_deref(), Some("abcd"));
                assert!(!c.is_end_of_candidates());
            }
            other => panic!("expected ice, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let d = Signal::decode(r#"{"type":"chat.typing","from":"U2","payload":{"x":1}}"#).unwrap();
        assert_eq!(d, Decoded::Unknown("chat.typing".to_string()));
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let err = Signal::decode(r#"{"type":"webrtc.ice","from":"U2","payload":{"sdpMid":"0"}}"#)
            .unwrap_err();
        assert!(matches!(err, SignalError::Payload { kind: "webrtc.ice", .. }));

        assert!(matches!(
            Signal::decode("not json").unwrap_err(),
            SignalError::Json(_)
        ));
    }

    #[test]
    fn test_encode_shape() {
        let s = Signal::new(
            SignalKind::CallReject {
                reason: Some(RejectReason::Busy),
            },
            "me".into(),
            "U3".into(),
        );
        assert_eq!(
            s.to_value().unwrap(),
            json!({"type":"call.reject","from":"me","to":"U3","payload":{"reason":"busy"}})
        );

        let start = Signal::new(SignalKind::CallStart, "me".into(), "U2".into());
        assert_eq!(
            start.to_value().unwrap(),
            json!({"type":"call.start","from":"me","to":"U2"})
        );
    }

    #[test]
    fn test_addressing() {
        let me = ParticipantId::from("me");
        let mut s = Signal::new(SignalKind::CallEnd, "U2".into(), "me".into());
        assert!(s.is_addressed_to(&me));
        s.to = Some("otherUser".into());
        assert!(!s.is_addressed_to(&me));
        s.to = None;
        assert!(s.is_addressed_to(&me));
    }
}
