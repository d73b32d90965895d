//! WebSocket-Anbindung an den Realtime-Bus
//!
//! Verbindet sich mit dem Bus-Gateway der Plattform und bildet dessen
//! Topic-Protokoll auf das `SignalBus`-Trait ab:
//! - Eine Verbindung pro Client, Topics werden darüber gemultiplext
//! - Lese-Task verteilt eingehende Frames an lokale Topic-Kanäle
//! - Schreib-Task serialisiert alle ausgehenden Frames über eine Queue

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::bus::{BusError, BusSubscription, SignalBus};

// ============================================================================
// WIRE FRAMES
// ============================================================================

/// Frames des Bus-Gateways (beide Richtungen)
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BusFrame {
    /// Client → Gateway: Topic abonnieren
    Subscribe { topic: String },

    /// Client → Gateway: Abonnement beenden
    Unsubscribe { topic: String },

    /// Client → Gateway: Nachricht publizieren
    Publish { topic: String, payload: String },

    /// Gateway → Client: Nachricht auf einem abonnierten Topic
    Message { topic: String, payload: String },
}

// ============================================================================
// WEBSOCKET BUS
// ============================================================================

type TopicMap = Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>;

/// `SignalBus` über das WebSocket-Gateway des Plattform-Busses
pub struct WebSocketSignalBus {
    tx: mpsc::Sender<String>,
    topics: TopicMap,
    connected: Arc<AtomicBool>,
}

impl WebSocketSignalBus {
    /// Verbindet mit dem Bus-Gateway
    pub async fn connect(server_url: &str) -> Result<Self, BusError> {
        let ws_url = url::Url::parse(server_url)
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connecting to signal bus: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        let topics: TopicMap = Arc::new(RwLock::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // Lese-Task: Frames an lokale Topic-Kanäle verteilen
        let topics_clone = Arc::clone(&topics);
        let connected_clone = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<BusFrame>(&text) {
                            Ok(BusFrame::Message { topic, payload }) => {
                                let sender = topics_clone.read().get(&topic).cloned();
                                if let Some(sender) = sender {
                                    let _ = sender.send(payload);
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!("Unparseable bus frame: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Signal bus closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Signal bus read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            connected_clone.store(false, Ordering::SeqCst);
            // Offene Subscriptions beenden
            topics_clone.write().clear();
        });

        // Schreib-Task: Queue → Socket
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send bus frame: {}", e);
                    break;
                }
            }
        });

        Ok(Self {
            tx,
            topics,
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_frame(&self, frame: &BusFrame) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let text = serde_json::to_string(frame)
            .map_err(|e| BusError::PublishFailed(e.to_string()))?;
        self.tx
            .send(text)
            .await
            .map_err(|e| BusError::PublishFailed(e.to_string()))
    }
}

#[async_trait]
impl SignalBus for WebSocketSignalBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        self.send_frame(&BusFrame::Publish {
            topic: topic.to_string(),
            payload,
        })
        .await
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let rx = {
            let mut topics = self.topics.write();
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(128).0)
                .subscribe()
        };

        self.send_frame(&BusFrame::Subscribe {
            topic: topic.to_string(),
        })
        .await?;

        Ok(BusSubscription::new(rx))
    }

    async fn unsubscribe(&self, topic: &str) {
        {
            let mut topics = self.topics.write();
            if let Some(tx) = topics.get(topic) {
                if tx.receiver_count() == 0 {
                    topics.remove(topic);
                }
            }
        }

        let _ = self
            .send_frame(&BusFrame::Unsubscribe {
                topic: topic.to_string(),
            })
            .await;
    }
}

impl std::fmt::Debug for WebSocketSignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSignalBus")
            .field("connected", &self.is_connected())
            .field("topics", &self.topics.read().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_shape() {
        let frame = BusFrame::Publish {
            topic: "call_signals:1".to_string(),
            payload: "{}".to_string(),
        };

        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "publish");
        assert_eq!(json["topic"], "call_signals:1");
    }

    #[test]
    fn test_frame_round_trip() {
        for frame in [
            BusFrame::Subscribe {
                topic: "t".to_string(),
            },
            BusFrame::Unsubscribe {
                topic: "t".to_string(),
            },
            BusFrame::Message {
                topic: "t".to_string(),
                payload: "hello".to_string(),
            },
        ] {
            let text = serde_json::to_string(&frame).unwrap();
            let back: BusFrame = serde_json::from_str(&text).unwrap();
            assert_eq!(back, frame);
        }
    }
}
