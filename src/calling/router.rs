//! Inbound signal filtering and dispatch.

use super::session::CallSession;
use super::signal::{Decoded, ParticipantId, Signal, SignalFamily};

/// What the router did with one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Addressed to someone else.
    NotForUs,
    /// Sent by ourselves and reflected back by the server.
    Echo,
    /// Not valid JSON, or a known type with a bad payload.
    Malformed,
    /// A type we do not know.
    Unknown(String),
    Lifecycle,
    Negotiation,
}

pub struct SignalRouter {
    local_participant_id: ParticipantId,
}

impl SignalRouter {
    pub fn new(local_participant_id: ParticipantId) -> Self {
        Self {
            local_participant_id,
        }
    }

    /// Decide where a decoded signal goes.
    pub fn route(&self, signal: &Signal) -> Route {
        if !signal.is_addressed_to(&self.local_participant_id) {
            return Route::NotForUs;
        }
        if signal.from.as_ref() == Some(&self.local_participant_id) {
            return Route::Echo;
        }
        match signal.kind.family() {
            SignalFamily::Call => Route::Lifecycle,
            SignalFamily::Media => Route::Negotiation,
        }
    }

    /// Decode one text frame and hand it to `session` if it is ours.
    pub async fn dispatch(&self, session: &mut CallSession, frame: &str) -> Route {
        let signal = match Signal::decode(frame) {
            Ok(Decoded::Signal(signal)) => signal,
            Ok(Decoded::Unknown(kind)) => {
                tracing::debug!("Ignoring signal of unknown type {:?}", kind);
                return Route::Unknown(kind);
            }
            Err(e) => {
                tracing::warn!("Dropping malformed signal: {}", e);
                return Route::Malformed;
            }
        };

        let route = self.route(&signal);
        match route {
            Route::Lifecycle => {
                tracing::debug!("<- {} from {:?}", signal.kind.type_name(), signal.from);
                session.handle_call_signal(signal).await;
            }
            Route::Negotiation => {
                tracing::debug!("<- {} from {:?}", signal.kind.type_name(), signal.from);
                session.handle_media_signal(signal).await;
            }
            _ => tracing::trace!(
                "Discarding {} to {:?} ({:?})",
                signal.kind.type_name(),
                signal.to,
                route
            ),
        }
        route
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::calling::media::MediaConstraints;
    use crate::calling::peer::RtcConfiguration;
    use crate::calling::session::{SessionChannels, SessionDeps};
    use crate::calling::testing::{FakeDevices, FakePeerFactory, RecordingSink};
    use crate::calling::CallStatus;

    struct Harness {
        router: SignalRouter,
        session: CallSession,
        _channels: SessionChannels,
        sink: Arc<RecordingSink>,
        peers: Arc<FakePeerFactory>,
    }

    fn harness() -> Harness {
        let sink = Arc::new(RecordingSink::new());
        let peers = Arc::new(FakePeerFactory::new());
        let (session, channels) = CallSession::new(
            "me".into(),
            SessionDeps {
                signals: sink.clone(),
                peers: peers.clone(),
                devices: Arc::new(FakeDevices::working()),
                rtc: RtcConfiguration::default(),
                constraints: MediaConstraints::default(),
            },
        );
        Harness {
            router: SignalRouter::new("me".into()),
            session,
            _channels: channels,
            sink,
            peers,
        }
    }

    fn ice_frame(to: &str) -> String {
        json!({
            "type": "webrtc.ice",
            "from": "U2",
            "to": to,
            "payload": {
                "candidate": "candidate:1 1 UDP 2130706431 10.0.0.2 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        })
        .to_string()
    }

    async fn active_with_u2(h: &mut Harness) {
        let start = json!({"type": "call.start", "from": "U2", "to": "me"}).to_string();
        assert_eq!(h.router.dispatch(&mut h.session, &start).await, Route::Lifecycle);
        h.session.accept_call().await.unwrap();
        let offer = json!({
            "type": "webrtc.offer",
            "from": "U2",
            "to": "me",
            "payload": {"type": "offer", "sdp": "v=0\r\n"}
        })
        .to_string();
        assert_eq!(h.router.dispatch(&mut h.session, &offer).await, Route::Negotiation);
        assert_eq!(h.peers.created(), 1);
    }

    #[tokio::test]
    async fn test_ice_for_someone_else_is_discarded() {
        let mut h = harness();
        active_with_u2(&mut h).await;

        let route = h.router.dispatch(&mut h.session, &ice_frame("otherUser")).await;
        assert_eq!(route, Route::NotForUs);
        assert!(h.peers.peer(0).candidates().is_empty());

        let route = h.router.dispatch(&mut h.session, &ice_frame("me")).await;
        assert_eq!(route, Route::Negotiation);
        assert_eq!(h.peers.peer(0).candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_is_accepted() {
        let mut h = harness();
        let start = json!({"type": "call.start", "from": "U3"}).to_string();
        assert_eq!(h.router.dispatch(&mut h.session, &start).await, Route::Lifecycle);
        assert_eq!(h.session.status(), CallStatus::Incoming);
    }

    #[tokio::test]
    async fn test_own_echo_is_discarded() {
        let mut h = harness();
        let echo = json!({"type": "call.start", "from": "me"}).to_string();
        assert_eq!(h.router.dispatch(&mut h.session, &echo).await, Route::Echo);
        assert_eq!(h.session.status(), CallStatus::Idle);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed() {
        let mut h = harness();
        let unknown = json!({"type": "chat.message", "to": "me", "payload": "hi"}).to_string();
        assert_eq!(
            h.router.dispatch(&mut h.session, &unknown).await,
            Route::Unknown("chat.message".into())
        );
        assert_eq!(
            h.router.dispatch(&mut h.session, "{not json").await,
            Route::Malformed
        );
        let bad_payload =
            json!({"type": "webrtc.ice", "to": "me", "from": "U2", "payload": 42}).to_string();
        assert_eq!(
            h.router.dispatch(&mut h.session, &bad_payload).await,
            Route::Malformed
        );
        assert_eq!(h.session.status(), CallStatus::Idle);
        assert!(h.sink.sent().is_empty());
    }

    #[test]
    fn test_route_by_family() {
        let router = SignalRouter::new("me".into());
        let end = Signal::new(
            crate::calling::signal::SignalKind::CallEnd,
            "U2".into(),
            "me".into(),
        );
        assert_eq!(router.route(&end), Route::Lifecycle);

        let offer = Signal::new(
            crate::calling::signal::SignalKind::Offer(
                crate::calling::signal::SessionDescription::offer("v=0"),
            ),
            "U2".into(),
            "me".into(),
        );
        assert_eq!(router.route(&offer), Route::Negotiation);
    }
}
