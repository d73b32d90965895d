//! Call History & Stats
//!
//! Read-only Aggregation über das Append-only Call-Log.
//! Keine Mutations-Fähigkeit - die History-Ansicht liest nur.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rusqlite::params;
use serde::Serialize;

use super::calls::{CallLogRecord, CallStore, StoreError};
use crate::session::{CallKind, CallStatus};

// ============================================================================
// STATS
// ============================================================================

/// Aggregierte Anruf-Statistik eines Teilnehmers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStats {
    pub total_calls: i64,
    pub voice_calls: i64,
    pub video_calls: i64,
    pub answered_count: i64,
    pub missed_count: i64,
    pub total_duration_seconds: i64,
    pub average_duration_seconds: Option<f64>,
}

// ============================================================================
// HISTORY READER
// ============================================================================

/// Read-only Sicht auf das Call-Log
pub struct CallHistoryReader {
    store: Arc<CallStore>,
}

impl CallHistoryReader {
    pub fn new(store: Arc<CallStore>) -> Self {
        Self { store }
    }

    /// Terminale Sessions eines Teilnehmers, neueste zuerst
    pub fn history(
        &self,
        participant: &str,
        limit: usize,
    ) -> Result<Vec<CallLogRecord>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT session_id, caller_id, receiver_id, conversation_id,
                       call_kind, status, started_at, ended_at, duration_seconds,
                       peer_name, peer_avatar, logged_at
                FROM call_log
                WHERE caller_id = ?1 OR receiver_id = ?1
                ORDER BY logged_at DESC, rowid DESC
                LIMIT ?2
                "#,
            )?;

            let records = stmt
                .query_map(params![participant, limit as i64], |row| {
                    let kind: String = row.get(4)?;
                    let status: String = row.get(5)?;
                    Ok(CallLogRecord {
                        session_id: row.get(0)?,
                        caller_id: row.get(1)?,
                        receiver_id: row.get(2)?,
                        conversation_id: row.get(3)?,
                        call_kind: CallKind::from_str(&kind).unwrap_or(CallKind::Voice),
                        status: CallStatus::from_str(&status).unwrap_or(CallStatus::Failed),
                        started_at: row
                            .get::<_, Option<i64>>(6)?
                            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                        ended_at: row
                            .get::<_, Option<i64>>(7)?
                            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                        duration_seconds: row.get(8)?,
                        peer_name: row.get(9)?,
                        peer_avatar: row.get(10)?,
                        logged_at: Utc
                            .timestamp_millis_opt(row.get(11)?)
                            .single()
                            .unwrap_or_else(Utc::now),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(records)
        })
    }

    /// Aggregierte Statistik über alle geloggten Anrufe eines Teilnehmers
    pub fn stats(&self, participant: &str) -> Result<CallStats, StoreError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(CASE WHEN call_kind = 'voice' THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN call_kind = 'video' THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN started_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN status = 'missed' THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(duration_seconds), 0)
                FROM call_log
                WHERE caller_id = ?1 OR receiver_id = ?1
                "#,
                params![participant],
                |row| {
                    let answered_count: i64 = row.get(3)?;
                    let total_duration_seconds: i64 = row.get(5)?;
                    Ok(CallStats {
                        total_calls: row.get(0)?,
                        voice_calls: row.get(1)?,
                        video_calls: row.get(2)?,
                        answered_count,
                        missed_count: row.get(4)?,
                        total_duration_seconds,
                        average_duration_seconds: if answered_count > 0 {
                            Some(total_duration_seconds as f64 / answered_count as f64)
                        } else {
                            None
                        },
                    })
                },
            )
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NewCallSession;
    use chrono::Duration;

    fn finish_call(
        store: &CallStore,
        caller: &str,
        receiver: &str,
        kind: CallKind,
        status: CallStatus,
        duration: Option<i64>,
    ) {
        let session = store
            .create_session(NewCallSession {
                caller_id: caller.to_string(),
                receiver_id: receiver.to_string(),
                conversation_id: "conv".to_string(),
                call_kind: kind,
            })
            .unwrap();

        let ended = Utc::now();
        if let Some(secs) = duration {
            store
                .mark_answered(&session.id, ended - Duration::seconds(secs))
                .unwrap();
        }
        let finished = store.finish_session(&session.id, status, ended).unwrap();
        store
            .append_log(&CallLogRecord::from_session(&finished))
            .unwrap();
    }

    #[test]
    fn test_history_most_recent_first() {
        let store = Arc::new(CallStore::open_in_memory().unwrap());
        finish_call(&store, "alice", "bob", CallKind::Voice, CallStatus::Ended, Some(10));
        finish_call(&store, "carol", "alice", CallKind::Video, CallStatus::Missed, None);
        finish_call(&store, "dave", "carol", CallKind::Voice, CallStatus::Ended, Some(5));

        let reader = CallHistoryReader::new(Arc::clone(&store));
        let history = reader.history("alice", 10).unwrap();

        assert_eq!(history.len(), 2);
        // Neueste zuerst
        assert_eq!(history[0].caller_id, "carol");
        assert_eq!(history[1].caller_id, "alice");

        let limited = reader.history("alice", 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_stats_aggregation() {
        let store = Arc::new(CallStore::open_in_memory().unwrap());
        finish_call(&store, "alice", "bob", CallKind::Voice, CallStatus::Ended, Some(30));
        finish_call(&store, "alice", "bob", CallKind::Video, CallStatus::Ended, Some(60));
        finish_call(&store, "bob", "alice", CallKind::Voice, CallStatus::Missed, None);

        let reader = CallHistoryReader::new(Arc::clone(&store));
        let stats = reader.stats("alice").unwrap();

        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.voice_calls, 2);
        assert_eq!(stats.video_calls, 1);
        assert_eq!(stats.answered_count, 2);
        assert_eq!(stats.missed_count, 1);
        assert_eq!(stats.total_duration_seconds, 90);
        assert_eq!(stats.average_duration_seconds, Some(45.0));
    }

    #[test]
    fn test_stats_empty_log() {
        let store = Arc::new(CallStore::open_in_memory().unwrap());
        let reader = CallHistoryReader::new(store);
        let stats = reader.stats("nobody").unwrap();

        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.total_duration_seconds, 0);
        assert_eq!(stats.average_duration_seconds, None);
    }
}
