//! Signaling Channel - Per-Call-Topic auf dem Bus
//!
//! Ein Kanal pro Call-Session: abonniert `call_signals:{session_id}`,
//! spielt den persistierten Backlog an späte Subscriber nach und stellt
//! eingehende Nachrichten über eine explizite, geordnete Inbox zu.
//! Eigene Nachrichten werden nie lokal zugestellt (Echo-Filter), erneut
//! zugestellte Nachrichten über die ID dedupliziert.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bus::SignalBus;
use super::messages::{signal_topic, SignalPayload, SignalingMessage};
use crate::storage::{CallStore, StoreError};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Failed to deliver signaling message: {0}")]
    DeliveryFailed(String),

    #[error("Call session not found: {0}")]
    SessionNotFound(String),

    #[error("Call session already terminal: {0}")]
    SessionTerminal(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SignalingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(id) => SignalingError::SessionNotFound(id),
            StoreError::SessionTerminal(id) => SignalingError::SessionTerminal(id),
            other => SignalingError::Store(other),
        }
    }
}

// ============================================================================
// INBOX
// ============================================================================

/// Geordnete Inbox einer Session - Backlog zuerst, dann Live-Nachrichten
pub struct SignalingInbox {
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl SignalingInbox {
    /// Nächste Nachricht, `None` wenn der Kanal geschlossen wurde
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

/// Sende-Seite des Per-Call-Kanals
pub struct SignalingChannel {
    session_id: String,
    local_participant: String,
    remote_participant: String,
    topic: String,
    bus: Arc<dyn SignalBus>,
    store: Arc<CallStore>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SignalingChannel {
    /// Öffnet den Kanal für eine Session und liefert die zugehörige Inbox.
    ///
    /// Der persistierte Backlog wird vor den Live-Nachrichten eingereiht -
    /// ein Angerufener, der erst beim Annehmen abonniert, sieht das Offer
    /// des Anrufers trotzdem, genau einmal und in Reihenfolge.
    pub async fn open(
        bus: Arc<dyn SignalBus>,
        store: Arc<CallStore>,
        session_id: &str,
        local_participant: &str,
        remote_participant: &str,
    ) -> Result<(Self, SignalingInbox), SignalingError> {
        let topic = signal_topic(session_id);
        let mut subscription = bus
            .subscribe(&topic)
            .await
            .map_err(|e| SignalingError::DeliveryFailed(e.to_string()))?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        // Backlog nachspielen, eigene Nachrichten ausfiltern
        let mut seen: HashSet<String> = HashSet::new();
        for message in store.signals_for_session(session_id)? {
            seen.insert(message.id.clone());
            if message.from_participant != local_participant {
                let _ = inbox_tx.send(message);
            }
        }

        // Live-Zustellung: Echo-Filter, ID-Dedupe, nie blockierend
        let task_session_id = session_id.to_string();
        let task_local = local_participant.to_string();
        let forward_task = tokio::spawn(async move {
            while let Some(text) = subscription.next().await {
                let message: SignalingMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("Unparseable signaling message: {}", e);
                        continue;
                    }
                };

                if message.call_session_id != task_session_id {
                    continue;
                }
                if message.from_participant == task_local {
                    continue;
                }
                if !seen.insert(message.id.clone()) {
                    tracing::debug!("Dropping redelivered signal {}", message.id);
                    continue;
                }

                if inbox_tx.send(message).is_err() {
                    break;
                }
            }
        });

        let channel = Self {
            session_id: session_id.to_string(),
            local_participant: local_participant.to_string(),
            remote_participant: remote_participant.to_string(),
            topic,
            bus,
            store,
            forward_task: Mutex::new(Some(forward_task)),
            closed: AtomicBool::new(false),
        };

        Ok((channel, SignalingInbox { rx: inbox_rx }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Persistiert und publiziert eine Signaling-Nachricht.
    /// Publish wird bei Fehlschlag genau einmal wiederholt.
    pub async fn send(&self, payload: SignalPayload) -> Result<(), SignalingError> {
        let message = SignalingMessage::new(
            &self.session_id,
            &self.local_participant,
            &self.remote_participant,
            payload,
        );

        self.store.append_signal(&message)?;

        let text = serde_json::to_string(&message)
            .map_err(|e| SignalingError::DeliveryFailed(e.to_string()))?;

        match self.bus.publish(&self.topic, text.clone()).await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(
                    "Publish of {} failed, retrying once: {}",
                    message.payload.kind(),
                    first
                );
                self.bus
                    .publish(&self.topic, text)
                    .await
                    .map_err(|e| SignalingError::DeliveryFailed(e.to_string()))
            }
        }
    }

    /// Schließt den Kanal; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.forward_task.lock().take() {
            task.abort();
        }
        self.bus.unsubscribe(&self.topic).await;
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(task) = self.forward_task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("topic", &self.topic)
            .field("local_participant", &self.local_participant)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CallKind, NewCallSession};
    use crate::signaling::bus::InMemorySignalBus;
    use crate::signaling::messages::SessionDescription;
    use std::time::Duration;

    fn setup() -> (Arc<InMemorySignalBus>, Arc<CallStore>, String) {
        let bus = Arc::new(InMemorySignalBus::new());
        let store = Arc::new(CallStore::open_in_memory().unwrap());
        let session = store
            .create_session(NewCallSession {
                caller_id: "alice".to_string(),
                receiver_id: "bob".to_string(),
                conversation_id: "conv-1".to_string(),
                call_kind: CallKind::Voice,
            })
            .unwrap();
        (bus, store, session.id)
    }

    async fn recv_with_timeout(inbox: &mut SignalingInbox) -> SignalingMessage {
        tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .expect("timed out waiting for signal")
            .expect("inbox closed")
    }

    #[tokio::test]
    async fn test_own_messages_are_never_delivered_locally() {
        let (bus, store, session_id) = setup();

        let (alice, mut alice_inbox) = SignalingChannel::open(
            bus.clone() as Arc<dyn SignalBus>,
            store.clone(),
            &session_id,
            "alice",
            "bob",
        )
        .await
        .unwrap();
        let (_bob, mut bob_inbox) = SignalingChannel::open(
            bus.clone() as Arc<dyn SignalBus>,
            store.clone(),
            &session_id,
            "bob",
            "alice",
        )
        .await
        .unwrap();

        alice.send(SignalPayload::Hangup).await.unwrap();

        let received = recv_with_timeout(&mut bob_inbox).await;
        assert_eq!(received.payload, SignalPayload::Hangup);
        assert_eq!(received.from_participant, "alice");

        // Echo-Filter: Alice sieht ihre eigene Nachricht nicht
        assert!(alice_inbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_backlog_is_replayed_to_late_subscriber() {
        let (bus, store, session_id) = setup();

        let (alice, _alice_inbox) = SignalingChannel::open(
            bus.clone() as Arc<dyn SignalBus>,
            store.clone(),
            &session_id,
            "alice",
            "bob",
        )
        .await
        .unwrap();

        // Offer geht raus, bevor Bob überhaupt abonniert hat
        alice
            .send(SignalPayload::Offer(SessionDescription {
                sdp: "offer-sdp".to_string(),
            }))
            .await
            .unwrap();

        let (_bob, mut bob_inbox) = SignalingChannel::open(
            bus.clone() as Arc<dyn SignalBus>,
            store.clone(),
            &session_id,
            "bob",
            "alice",
        )
        .await
        .unwrap();

        let received = recv_with_timeout(&mut bob_inbox).await;
        match received.payload {
            SignalPayload::Offer(sd) => assert_eq!(sd.sdp, "offer-sdp"),
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redelivered_messages_are_deduplicated() {
        let (bus, store, session_id) = setup();

        let (alice, _alice_inbox) = SignalingChannel::open(
            bus.clone() as Arc<dyn SignalBus>,
            store.clone(),
            &session_id,
            "alice",
            "bob",
        )
        .await
        .unwrap();
        let (_bob, mut bob_inbox) = SignalingChannel::open(
            bus.clone() as Arc<dyn SignalBus>,
            store.clone(),
            &session_id,
            "bob",
            "alice",
        )
        .await
        .unwrap();

        alice
            .send(SignalPayload::Offer(SessionDescription {
                sdp: "offer-sdp".to_string(),
            }))
            .await
            .unwrap();
        let first = recv_with_timeout(&mut bob_inbox).await;

        // Der Bus stellt dieselbe Nachricht erneut zu
        let duplicate = serde_json::to_string(&first).unwrap();
        bus.publish(&signal_topic(&session_id), duplicate)
            .await
            .unwrap();
        alice.send(SignalPayload::Hangup).await.unwrap();

        // Nach dem Duplikat kommt direkt das Hangup - kein zweites Offer
        let next = recv_with_timeout(&mut bob_inbox).await;
        assert_eq!(next.payload, SignalPayload::Hangup);
    }

    #[tokio::test]
    async fn test_send_on_terminal_session_is_rejected() {
        let (bus, store, session_id) = setup();

        let (alice, _inbox) = SignalingChannel::open(
            bus as Arc<dyn SignalBus>,
            store.clone(),
            &session_id,
            "alice",
            "bob",
        )
        .await
        .unwrap();

        store
            .finish_session(&session_id, crate::session::CallStatus::Ended, chrono::Utc::now())
            .unwrap();

        assert!(matches!(
            alice.send(SignalPayload::Hangup).await,
            Err(SignalingError::SessionTerminal(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (bus, store, session_id) = setup();
        let (alice, _inbox) = SignalingChannel::open(
            bus as Arc<dyn SignalBus>,
            store,
            &session_id,
            "alice",
            "bob",
        )
        .await
        .unwrap();

        alice.close().await;
        alice.close().await;
    }
}
