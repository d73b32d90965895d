//! Message-Typen für das Call-Signaling-Protokoll
//!
//! Eine `SignalingMessage` ist eine gerichtete Protokoll-Nachricht auf dem
//! Per-Call-Topic des externen Pub/Sub-Busses. Der Payload ist eine Tagged
//! Union über `signal_type` - jede Variante trägt nur die Felder, die ihre
//! Art benötigt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// TOPIC
// ============================================================================

/// Topic-Name für eine Call-Session auf dem Bus
pub fn signal_topic(session_id: &str) -> String {
    format!("call_signals:{session_id}")
}

// ============================================================================
// PAYLOAD VARIANTS
// ============================================================================

/// Sitzungsbeschreibung (SDP) für Offer und Answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp: String,
}

/// Transport-Kandidat (ein möglicher Netzwerkpfad zwischen den Peers)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Payload einer Signaling-Nachricht, getaggt über `signal_type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "signal_type", content = "signal_data", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// SDP Offer des Initiators
    Offer(SessionDescription),

    /// SDP Answer des Angerufenen
    Answer(SessionDescription),

    /// Transport-Kandidat (beliebig oft, in beide Richtungen)
    IceCandidate(IceCandidate),

    /// Auflegen / Ablehnen - ohne Daten
    Hangup,
}

impl SignalPayload {
    /// Wire-Name der Variante (für Logging)
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "offer",
            SignalPayload::Answer(_) => "answer",
            SignalPayload::IceCandidate(_) => "ice-candidate",
            SignalPayload::Hangup => "hangup",
        }
    }

    /// Offer/Answer/Hangup blockieren den Call, wenn sie verloren gehen.
    /// ICE-Kandidaten nicht - jede Teilmenge reicht.
    pub fn is_critical(&self) -> bool {
        !matches!(self, SignalPayload::IceCandidate(_))
    }
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

/// Eine gerichtete Signaling-Nachricht auf dem Per-Call-Topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalingMessage {
    pub id: String,
    pub call_session_id: String,
    pub from_participant: String,
    pub to_participant: String,
    #[serde(flatten)]
    pub payload: SignalPayload,
    pub created_at: DateTime<Utc>,
}

impl SignalingMessage {
    /// Erstellt eine neue Nachricht mit frischer ID und Zeitstempel
    pub fn new(
        call_session_id: impl Into<String>,
        from_participant: impl Into<String>,
        to_participant: impl Into<String>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            call_session_id: call_session_id.into(),
            from_participant: from_participant.into(),
            to_participant: to_participant.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalingMessage::new(
            "session-1",
            "alice",
            "bob",
            SignalPayload::Offer(SessionDescription {
                sdp: "v=0".to_string(),
            }),
        );

        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["call_session_id"], "session-1");
        assert_eq!(json["from_participant"], "alice");
        assert_eq!(json["to_participant"], "bob");
        assert_eq!(json["signal_type"], "offer");
        assert_eq!(json["signal_data"]["sdp"], "v=0");
    }

    #[test]
    fn test_hangup_has_no_signal_data() {
        let msg = SignalingMessage::new("session-1", "alice", "bob", SignalPayload::Hangup);

        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["signal_type"], "hangup");
        assert!(json.get("signal_data").is_none());

        let back: SignalingMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload, SignalPayload::Hangup);
    }

    #[test]
    fn test_ice_candidate_round_trip() {
        let msg = SignalingMessage::new(
            "session-1",
            "bob",
            "alice",
            SignalPayload::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }),
        );

        let text = serde_json::to_string(&msg).unwrap();
        let back: SignalingMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.payload.kind(), "ice-candidate");
        assert!(!back.payload.is_critical());
    }

    #[test]
    fn test_topic_scoped_to_session() {
        assert_eq!(signal_topic("abc"), "call_signals:abc");
    }
}
