//! Call Store
//!
//! SQLite-Anbindung an den externen Store: Session-Datensätze
//! (mutierbar bis terminal), das Append-only Call-Log und der
//! Signaling-Backlog für Replay an späte Subscriber.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::session::{CallKind, CallSession, CallStatus, NewCallSession};
use crate::signaling::{
    IceCandidate, SessionDescription, SignalPayload, SignalingMessage,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Call session not found: {0}")]
    SessionNotFound(String),

    #[error("Call session already terminal: {0}")]
    SessionTerminal(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

// ============================================================================
// CALL LOG RECORD
// ============================================================================

/// Append-only Log-Eintrag - Spiegel der terminalen Session-Felder plus
/// denormalisierte Anzeige-Daten der Gegenseite für die History-Ansicht
#[derive(Debug, Clone)]
pub struct CallLogRecord {
    pub session_id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub conversation_id: String,
    pub call_kind: CallKind,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub peer_name: Option<String>,
    pub peer_avatar: Option<String>,
    pub logged_at: DateTime<Utc>,
}

impl CallLogRecord {
    /// Log-Eintrag aus einer terminalen Session, ohne Anzeige-Daten
    pub fn from_session(session: &CallSession) -> Self {
        Self {
            session_id: session.id.clone(),
            caller_id: session.caller_id.clone(),
            receiver_id: session.receiver_id.clone(),
            conversation_id: session.conversation_id.clone(),
            call_kind: session.call_kind,
            status: session.status,
            started_at: session.started_at,
            ended_at: session.ended_at,
            duration_seconds: session.duration_seconds,
            peer_name: None,
            peer_avatar: None,
            logged_at: Utc::now(),
        }
    }

    pub fn with_peer_display(
        mut self,
        name: Option<String>,
        avatar: Option<String>,
    ) -> Self {
        self.peer_name = name;
        self.peer_avatar = avatar;
        self
    }
}

// ============================================================================
// TIMESTAMP HELPERS
// ============================================================================

fn to_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|v| Utc.timestamp_millis_opt(v).single())
}

fn parse_status(s: &str) -> rusqlite::Result<CallStatus> {
    CallStatus::from_str(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown call status: {s}").into(),
        )
    })
}

fn parse_kind(s: &str) -> rusqlite::Result<CallKind> {
    CallKind::from_str(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown call kind: {s}").into(),
        )
    })
}

// ============================================================================
// CALL STORE
// ============================================================================

/// SQLite-Store für Call-Sessions (thread-safe durch Mutex)
pub struct CallStore {
    conn: Mutex<Connection>,
}

impl CallStore {
    /// Öffnet oder erstellt die Datenbank am Standard-Pfad
    pub fn open() -> Result<Self, StoreError> {
        let db_path = Self::database_path()?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call store at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// In-Memory Store für Tests und Ephemeral-Deployments
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn database_path() -> Result<PathBuf, StoreError> {
        let proj_dirs = directories::ProjectDirs::from("de", "herzlink", "herzlink")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("calls.db");
        Ok(path)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS call_sessions (
                id TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                call_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                duration_seconds INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_call_sessions_pair
                ON call_sessions(caller_id, receiver_id, status);

            CREATE TABLE IF NOT EXISTS call_log (
                session_id TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                call_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                duration_seconds INTEGER,
                peer_name TEXT,
                peer_avatar TEXT,
                logged_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_call_log_participants
                ON call_log(caller_id, receiver_id);

            CREATE TABLE IF NOT EXISTS call_signals (
                id TEXT PRIMARY KEY,
                call_session_id TEXT NOT NULL,
                from_participant TEXT NOT NULL,
                to_participant TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                signal_data TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_call_signals_session
                ON call_signals(call_session_id);
            "#,
        )?;

        Ok(())
    }

    /// Zugriff für den read-only History-Reader
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        f(&conn).map_err(StoreError::from)
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Legt eine neue Session in `initiated` an und vergibt die ID
    pub fn create_session(&self, new: NewCallSession) -> Result<CallSession, StoreError> {
        let session = CallSession {
            id: Uuid::new_v4().to_string(),
            caller_id: new.caller_id,
            receiver_id: new.receiver_id,
            conversation_id: new.conversation_id,
            call_kind: new.call_kind,
            status: CallStatus::Initiated,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            created_at: Utc::now(),
        };

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO call_sessions
                (id, caller_id, receiver_id, conversation_id, call_kind, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                session.id,
                session.caller_id,
                session.receiver_id,
                session.conversation_id,
                session.call_kind.as_str(),
                session.status.as_str(),
                session.created_at.timestamp_millis(),
            ],
        )?;

        Ok(session)
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallSession> {
        let kind: String = row.get(4)?;
        let status: String = row.get(5)?;
        let created: i64 = row.get(9)?;
        Ok(CallSession {
            id: row.get(0)?,
            caller_id: row.get(1)?,
            receiver_id: row.get(2)?,
            conversation_id: row.get(3)?,
            call_kind: parse_kind(&kind)?,
            status: parse_status(&status)?,
            started_at: from_millis(row.get(6)?),
            ended_at: from_millis(row.get(7)?),
            duration_seconds: row.get(8)?,
            created_at: from_millis(Some(created)).unwrap_or_else(Utc::now),
        })
    }

    const SESSION_COLUMNS: &'static str = "id, caller_id, receiver_id, conversation_id, \
         call_kind, status, started_at, ended_at, duration_seconds, created_at";

    /// Holt eine Session anhand ihrer ID
    pub fn get_session(&self, session_id: &str) -> Result<CallSession, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM call_sessions WHERE id = ?1",
                Self::SESSION_COLUMNS
            ),
            params![session_id],
            Self::row_to_session,
        )
        .optional()?
        .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    /// Aktive (nicht-terminale) Session für ein ungeordnetes Teilnehmer-Paar
    pub fn find_active_for_pair(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Option<CallSession>, StoreError> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!(
                    r#"
                    SELECT {} FROM call_sessions
                    WHERE status IN ('initiated', 'ringing', 'answered')
                      AND ((caller_id = ?1 AND receiver_id = ?2)
                        OR (caller_id = ?2 AND receiver_id = ?1))
                    LIMIT 1
                    "#,
                    Self::SESSION_COLUMNS
                ),
                params![a, b],
                Self::row_to_session,
            )
            .optional()?;
        Ok(result)
    }

    /// `initiated → ringing`, sobald die Gegenseite den Anruf sieht
    pub fn mark_ringing(&self, session_id: &str) -> Result<CallSession, StoreError> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE call_sessions SET status = 'ringing' WHERE id = ?1 AND status = 'initiated'",
                params![session_id],
            )?;
        }
        self.get_session(session_id)
    }

    /// Übergang nach `answered`; setzt `started_at` genau hier
    pub fn mark_answered(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<CallSession, StoreError> {
        let current = self.get_session(session_id)?;
        if current.is_terminal() {
            return Err(StoreError::SessionTerminal(session_id.to_string()));
        }

        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE call_sessions SET status = 'answered', started_at = ?2 WHERE id = ?1",
                params![session_id, started_at.timestamp_millis()],
            )?;
        }
        self.get_session(session_id)
    }

    /// Terminaler Übergang. Bereits terminale Sessions bleiben unberührt -
    /// der zweite Schreiber bekommt den bestehenden Datensatz zurück.
    pub fn finish_session(
        &self,
        session_id: &str,
        status: CallStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<CallSession, StoreError> {
        debug_assert!(status.is_terminal());

        let current = self.get_session(session_id)?;
        if current.is_terminal() {
            return Ok(current);
        }

        let duration = crate::session::duration_seconds(current.started_at, Some(ended_at));

        {
            let conn = self.conn.lock();
            conn.execute(
                r#"
                UPDATE call_sessions
                SET status = ?2, ended_at = ?3, duration_seconds = ?4
                WHERE id = ?1 AND status IN ('initiated', 'ringing', 'answered')
                "#,
                params![
                    session_id,
                    status.as_str(),
                    ended_at.timestamp_millis(),
                    duration,
                ],
            )?;
        }
        self.get_session(session_id)
    }

    // ========================================================================
    // CALL LOG (append-only)
    // ========================================================================

    /// Hängt den terminalen Log-Eintrag an. Idempotent über die Session-ID -
    /// gibt `false` zurück, wenn der Eintrag schon existiert.
    pub fn append_log(&self, record: &CallLogRecord) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO call_log
                (session_id, caller_id, receiver_id, conversation_id, call_kind,
                 status, started_at, ended_at, duration_seconds,
                 peer_name, peer_avatar, logged_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.session_id,
                record.caller_id,
                record.receiver_id,
                record.conversation_id,
                record.call_kind.as_str(),
                record.status.as_str(),
                to_millis(record.started_at),
                to_millis(record.ended_at),
                record.duration_seconds,
                record.peer_name,
                record.peer_avatar,
                record.logged_at.timestamp_millis(),
            ],
        )?;
        Ok(inserted > 0)
    }

    // ========================================================================
    // SIGNALING BACKLOG
    // ========================================================================

    /// Persistiert eine Signaling-Nachricht. Die referenzierte Session muss
    /// existieren und nicht-terminal sein.
    pub fn append_signal(&self, message: &SignalingMessage) -> Result<(), StoreError> {
        let session = self.get_session(&message.call_session_id)?;
        if session.is_terminal() {
            return Err(StoreError::SessionTerminal(message.call_session_id.clone()));
        }

        let (signal_type, signal_data) = payload_to_columns(&message.payload)?;

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO call_signals
                (id, call_session_id, from_participant, to_participant,
                 signal_type, signal_data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                message.id,
                message.call_session_id,
                message.from_participant,
                message.to_participant,
                signal_type,
                signal_data,
                message.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Backlog einer Session in Erstellungs-Reihenfolge
    pub fn signals_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<SignalingMessage>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, call_session_id, from_participant, to_participant,
                   signal_type, signal_data, created_at
            FROM call_signals
            WHERE call_session_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )?;

        let rows = stmt
            .query_map(params![session_id], |row| {
                let signal_type: String = row.get(4)?;
                let signal_data: Option<String> = row.get(5)?;
                let created: i64 = row.get(6)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    signal_type,
                    signal_data,
                    created,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut messages = Vec::with_capacity(rows.len());
        for (id, call_session_id, from, to, signal_type, signal_data, created) in rows {
            messages.push(SignalingMessage {
                id,
                call_session_id,
                from_participant: from,
                to_participant: to,
                payload: columns_to_payload(&signal_type, signal_data.as_deref())?,
                created_at: from_millis(Some(created)).unwrap_or_else(Utc::now),
            });
        }
        Ok(messages)
    }
}

// ============================================================================
// PAYLOAD (DE-)SERIALISIERUNG
// ============================================================================

fn payload_to_columns(
    payload: &SignalPayload,
) -> Result<(&'static str, Option<String>), StoreError> {
    let data = match payload {
        SignalPayload::Offer(sd) | SignalPayload::Answer(sd) => Some(
            serde_json::to_string(sd)
                .map_err(|e| StoreError::CorruptRecord(e.to_string()))?,
        ),
        SignalPayload::IceCandidate(c) => Some(
            serde_json::to_string(c)
                .map_err(|e| StoreError::CorruptRecord(e.to_string()))?,
        ),
        SignalPayload::Hangup => None,
    };
    Ok((payload.kind(), data))
}

fn columns_to_payload(
    signal_type: &str,
    signal_data: Option<&str>,
) -> Result<SignalPayload, StoreError> {
    let parse_sd = |data: Option<&str>| -> Result<SessionDescription, StoreError> {
        let raw = data.ok_or_else(|| {
            StoreError::CorruptRecord(format!("{signal_type} without signal_data"))
        })?;
        serde_json::from_str(raw).map_err(|e| StoreError::CorruptRecord(e.to_string()))
    };

    match signal_type {
        "offer" => Ok(SignalPayload::Offer(parse_sd(signal_data)?)),
        "answer" => Ok(SignalPayload::Answer(parse_sd(signal_data)?)),
        "ice-candidate" => {
            let raw = signal_data.ok_or_else(|| {
                StoreError::CorruptRecord("ice-candidate without signal_data".to_string())
            })?;
            let candidate: IceCandidate = serde_json::from_str(raw)
                .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
            Ok(SignalPayload::IceCandidate(candidate))
        }
        "hangup" => Ok(SignalPayload::Hangup),
        other => Err(StoreError::CorruptRecord(format!(
            "unknown signal type: {other}"
        ))),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(caller: &str, receiver: &str) -> NewCallSession {
        NewCallSession {
            caller_id: caller.to_string(),
            receiver_id: receiver.to_string(),
            conversation_id: "conv-1".to_string(),
            call_kind: CallKind::Video,
        }
    }

    #[test]
    fn test_create_and_get_session() {
        let store = CallStore::open_in_memory().unwrap();

        let session = store.create_session(new_session("alice", "bob")).unwrap();
        assert_eq!(session.status, CallStatus::Initiated);
        assert!(session.started_at.is_none());

        let loaded = store.get_session(&session.id).unwrap();
        assert_eq!(loaded.caller_id, "alice");
        assert_eq!(loaded.call_kind, CallKind::Video);
    }

    #[test]
    fn test_active_pair_is_unordered() {
        let store = CallStore::open_in_memory().unwrap();
        let session = store.create_session(new_session("alice", "bob")).unwrap();

        assert!(store.find_active_for_pair("alice", "bob").unwrap().is_some());
        assert!(store.find_active_for_pair("bob", "alice").unwrap().is_some());
        assert!(store.find_active_for_pair("alice", "carol").unwrap().is_none());

        store
            .finish_session(&session.id, CallStatus::Ended, Utc::now())
            .unwrap();
        assert!(store.find_active_for_pair("alice", "bob").unwrap().is_none());
    }

    #[test]
    fn test_answer_and_finish_computes_duration() {
        let store = CallStore::open_in_memory().unwrap();
        let session = store.create_session(new_session("alice", "bob")).unwrap();

        let started = Utc::now();
        let answered = store.mark_answered(&session.id, started).unwrap();
        assert_eq!(answered.status, CallStatus::Answered);
        assert!(answered.started_at.is_some());

        let ended = started + chrono::Duration::seconds(42);
        let finished = store
            .finish_session(&session.id, CallStatus::Ended, ended)
            .unwrap();
        assert_eq!(finished.status, CallStatus::Ended);
        assert_eq!(finished.duration_seconds, Some(42));
    }

    #[test]
    fn test_finish_is_a_no_op_when_already_terminal() {
        let store = CallStore::open_in_memory().unwrap();
        let session = store.create_session(new_session("alice", "bob")).unwrap();

        let first = store
            .finish_session(&session.id, CallStatus::Rejected, Utc::now())
            .unwrap();
        assert_eq!(first.status, CallStatus::Rejected);

        // Zweiter Schreiber verliert das Rennen - Status bleibt
        let second = store
            .finish_session(&session.id, CallStatus::Ended, Utc::now())
            .unwrap();
        assert_eq!(second.status, CallStatus::Rejected);
        assert!(second.duration_seconds.is_none());
    }

    #[test]
    fn test_append_log_is_idempotent() {
        let store = CallStore::open_in_memory().unwrap();
        let session = store.create_session(new_session("alice", "bob")).unwrap();
        let finished = store
            .finish_session(&session.id, CallStatus::Ended, Utc::now())
            .unwrap();

        let record = CallLogRecord::from_session(&finished)
            .with_peer_display(Some("Bob".to_string()), None);
        assert!(store.append_log(&record).unwrap());
        assert!(!store.append_log(&record).unwrap());
    }

    #[test]
    fn test_append_signal_requires_live_session() {
        let store = CallStore::open_in_memory().unwrap();
        let session = store.create_session(new_session("alice", "bob")).unwrap();

        let offer = SignalingMessage::new(
            &session.id,
            "alice",
            "bob",
            SignalPayload::Offer(SessionDescription {
                sdp: "v=0".to_string(),
            }),
        );
        store.append_signal(&offer).unwrap();

        let missing = SignalingMessage::new("nope", "alice", "bob", SignalPayload::Hangup);
        assert!(matches!(
            store.append_signal(&missing),
            Err(StoreError::SessionNotFound(_))
        ));

        store
            .finish_session(&session.id, CallStatus::Ended, Utc::now())
            .unwrap();
        let late = SignalingMessage::new(&session.id, "alice", "bob", SignalPayload::Hangup);
        assert!(matches!(
            store.append_signal(&late),
            Err(StoreError::SessionTerminal(_))
        ));
    }

    #[test]
    fn test_signal_backlog_preserves_order_and_payloads() {
        let store = CallStore::open_in_memory().unwrap();
        let session = store.create_session(new_session("alice", "bob")).unwrap();

        let offer = SignalingMessage::new(
            &session.id,
            "alice",
            "bob",
            SignalPayload::Offer(SessionDescription {
                sdp: "offer-sdp".to_string(),
            }),
        );
        let candidate = SignalingMessage::new(
            &session.id,
            "alice",
            "bob",
            SignalPayload::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 1 192.0.2.1 1 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }),
        );
        store.append_signal(&offer).unwrap();
        store.append_signal(&candidate).unwrap();

        let backlog = store.signals_for_session(&session.id).unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].payload, offer.payload);
        assert_eq!(backlog[1].payload, candidate.payload);
    }
}
