//! Datenmodell einer Call-Session
//!
//! Eine `CallSession` ist ein Anrufversuch zwischen zwei gematchten
//! Benutzern. Der Datensatz wird beim Initiieren angelegt, nur durch
//! Status-Übergänge mutiert und ist ab einem terminalen Status unveränderlich.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CALL KIND
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Voice => "voice",
            CallKind::Video => "video",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "voice" => Some(CallKind::Voice),
            "video" => Some(CallKind::Video),
            _ => None,
        }
    }

    /// Video-Anrufe fordern zusätzlich lokales Video an
    pub fn includes_video(&self) -> bool {
        matches!(self, CallKind::Video)
    }
}

// ============================================================================
// CALL STATUS
// ============================================================================

/// Lifecycle-Status einer Call-Session
///
/// `initiated → ringing → answered → ended`, mit Seitenausgängen nach
/// `rejected`, `missed`, `failed` aus jedem prä-terminalen Status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Rejected,
    Ended,
    Missed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
            CallStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(CallStatus::Initiated),
            "ringing" => Some(CallStatus::Ringing),
            "answered" => Some(CallStatus::Answered),
            "rejected" => Some(CallStatus::Rejected),
            "ended" => Some(CallStatus::Ended),
            "missed" => Some(CallStatus::Missed),
            "failed" => Some(CallStatus::Failed),
            _ => None,
        }
    }

    /// Aus einem terminalen Status gibt es keinen weiteren Übergang
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Rejected | CallStatus::Ended | CallStatus::Missed | CallStatus::Failed
        )
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein Anrufversuch zwischen zwei Teilnehmern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub id: String,
    pub caller_id: String,
    pub receiver_id: String,
    /// Verknüpfung zum Nachrichten-Thread des Matches (hier opak)
    pub conversation_id: String,
    pub call_kind: CallKind,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Neue Session ohne ID (wird vom Store beim Anlegen vergeben)
#[derive(Debug, Clone)]
pub struct NewCallSession {
    pub caller_id: String,
    pub receiver_id: String,
    pub conversation_id: String,
    pub call_kind: CallKind,
}

impl CallSession {
    /// Die Gegenseite aus Sicht des lokalen Teilnehmers
    pub fn other_participant(&self, local: &str) -> &str {
        if self.caller_id == local {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }

    pub fn is_receiver(&self, participant: &str) -> bool {
        self.receiver_id == participant
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Dauer in ganzen Sekunden, abgerundet - definiert nur wenn beide
/// Zeitstempel gesetzt sind
pub fn duration_seconds(
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
) -> Option<i64> {
    match (started_at, ended_at) {
        (Some(started), Some(ended)) => Some((ended - started).num_seconds()),
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_terminal_states() {
        assert!(!CallStatus::Initiated.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Answered.is_terminal());
        assert!(CallStatus::Rejected.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
        assert!(CallStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            CallStatus::Initiated,
            CallStatus::Ringing,
            CallStatus::Answered,
            CallStatus::Rejected,
            CallStatus::Ended,
            CallStatus::Missed,
            CallStatus::Failed,
        ] {
            assert_eq!(CallStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(CallStatus::from_str("connected"), None);
    }

    #[test]
    fn test_duration_requires_both_timestamps() {
        let started = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let ended = Utc.with_ymd_and_hms(2025, 6, 1, 12, 1, 30).unwrap();

        assert_eq!(duration_seconds(Some(started), Some(ended)), Some(90));
        assert_eq!(duration_seconds(Some(started), None), None);
        assert_eq!(duration_seconds(None, Some(ended)), None);
        assert_eq!(duration_seconds(None, None), None);
    }

    #[test]
    fn test_duration_floors_sub_second_remainder() {
        let started = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let ended = started + chrono::Duration::milliseconds(90_900);

        assert_eq!(duration_seconds(Some(started), Some(ended)), Some(90));
    }

    #[test]
    fn test_other_participant() {
        let session = CallSession {
            id: "s1".to_string(),
            caller_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            conversation_id: "conv-1".to_string(),
            call_kind: CallKind::Voice,
            status: CallStatus::Initiated,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            created_at: Utc::now(),
        };

        assert_eq!(session.other_participant("alice"), "bob");
        assert_eq!(session.other_participant("bob"), "alice");
        assert!(session.is_receiver("bob"));
        assert!(!session.is_receiver("alice"));
    }
}
