//! Signal Bus - schmale Schnittstelle zum externen Pub/Sub-Substrat
//!
//! Der Call-Core konsumiert den Realtime-Bus der Plattform ausschließlich
//! über dieses Trait: Topic-basiertes Publish/Subscribe mit geordneter
//! Zustellung pro Topic. `InMemorySignalBus` bedient Tests und
//! Single-Process-Deployments, `WebSocketSignalBus` (ws.rs) den
//! Produktions-Bus.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("Bus connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signal bus")]
    NotConnected,

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Laufende Subscription auf ein Topic. Zustellung in Ankunfts-Reihenfolge
/// pro Topic; über Topics hinweg gibt es keine Ordnungs-Garantie.
pub struct BusSubscription {
    rx: broadcast::Receiver<String>,
}

impl BusSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Nächste Nachricht, `None` wenn das Topic geschlossen wurde
    pub async fn next(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Bus subscription lagged, skipped {} messages", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ============================================================================
// SIGNAL BUS TRAIT
// ============================================================================

/// Topic-basierter Realtime-Bus (extern betrieben, hier nur konsumiert)
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Publiziert eine Nachricht auf einem Topic
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;

    /// Abonniert ein Topic
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError>;

    /// Beendet das Abonnement eines Topics (best effort)
    async fn unsubscribe(&self, topic: &str);
}

// ============================================================================
// IN-MEMORY BUS
// ============================================================================

/// Prozess-lokaler Bus: ein Broadcast-Kanal pro Topic
pub struct InMemorySignalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemorySignalBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.write();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(128).0)
            .clone()
    }
}

impl Default for InMemorySignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalBus for InMemorySignalBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        // Kein Subscriber ist kein Fehler - der Empfänger liest den Backlog
        let _ = self.sender_for(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        Ok(BusSubscription::new(self.sender_for(topic).subscribe()))
    }

    async fn unsubscribe(&self, topic: &str) {
        let mut topics = self.topics.write();
        if let Some(tx) = topics.get(topic) {
            if tx.receiver_count() == 0 {
                topics.remove(topic);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_in_order() {
        let bus = InMemorySignalBus::new();
        let mut sub_a = bus.subscribe("call_signals:1").await.unwrap();
        let mut sub_b = bus.subscribe("call_signals:1").await.unwrap();

        bus.publish("call_signals:1", "first".to_string()).await.unwrap();
        bus.publish("call_signals:1", "second".to_string()).await.unwrap();

        assert_eq!(sub_a.next().await.as_deref(), Some("first"));
        assert_eq!(sub_a.next().await.as_deref(), Some("second"));
        assert_eq!(sub_b.next().await.as_deref(), Some("first"));
        assert_eq!(sub_b.next().await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = InMemorySignalBus::new();
        let mut sub = bus.subscribe("call_signals:1").await.unwrap();

        bus.publish("call_signals:2", "other".to_string()).await.unwrap();
        bus.publish("call_signals:1", "mine".to_string()).await.unwrap();

        assert_eq!(sub.next().await.as_deref(), Some("mine"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = InMemorySignalBus::new();
        bus.publish("call_signals:empty", "msg".to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_idle_topics() {
        let bus = InMemorySignalBus::new();
        {
            let _sub = bus.subscribe("call_signals:1").await.unwrap();
        }
        bus.unsubscribe("call_signals:1").await;
        assert!(bus.topics.read().is_empty());
    }
}
