//! Peer Transport Controller - WebRTC-Verbindung eines Anrufs
//!
//! Besitzt genau eine Peer Connection pro aktivem Anruf, führt die
//! Offer/Answer/ICE-Negotiation und meldet Remote-Medien und
//! Verbindungszustände über den beim Öffnen übergebenen Event-Kanal.
//!
//! Früh eintreffende Remote-Kandidaten (vor der Remote Description)
//! werden gepuffert und beim Anwenden der Description nachgezogen,
//! nie verworfen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::signaling::IceCandidate;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Transport already closed")]
    Closed,
}

// ============================================================================
// TRANSPORT STATE & EVENTS
// ============================================================================

/// Verbindungszustand der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// `failed`/`closed` beenden den Transport - die Session muss nach
    /// `failed` übergehen, sofern nicht schon terminal
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

/// Events des Transports, zugestellt über den beim Öffnen übergebenen Kanal
pub enum TransportEvent {
    StateChanged(TransportState),

    /// Lokal entdeckter Kandidat - sofort über Signaling weiterreichen
    LocalCandidate(IceCandidate),

    /// Remote-Medien angekommen (genau einmal)
    RemoteMedia {
        kind: &'static str,
        track: Arc<TrackRemote>,
    },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::StateChanged(state) => {
                f.debug_tuple("StateChanged").field(state).finish()
            }
            TransportEvent::LocalCandidate(c) => {
                f.debug_tuple("LocalCandidate").field(&c.candidate).finish()
            }
            TransportEvent::RemoteMedia { kind, .. } => {
                f.debug_struct("RemoteMedia").field("kind", kind).finish()
            }
        }
    }
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN-Server (reichen für die meisten Verbindungen)
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

/// Relay-Endpunkte aus der Umgebung: `HERZLINK_ICE_SERVERS` als
/// Komma-Liste, optional `HERZLINK_TURN_USERNAME`/`HERZLINK_TURN_CREDENTIAL`
pub fn ice_servers_from_env() -> Vec<RTCIceServer> {
    match std::env::var("HERZLINK_ICE_SERVERS") {
        Ok(list) if !list.trim().is_empty() => {
            let urls: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();

            let mut server = RTCIceServer {
                urls,
                ..Default::default()
            };
            if let (Ok(username), Ok(credential)) = (
                std::env::var("HERZLINK_TURN_USERNAME"),
                std::env::var("HERZLINK_TURN_CREDENTIAL"),
            ) {
                server.username = username;
                server.credential = credential;
            }
            vec![server]
        }
        _ => default_ice_servers(),
    }
}

/// Konfiguration des Transports - wird beim Öffnen opak durchgereicht
#[derive(Clone)]
pub struct TransportConfig {
    pub ice_servers: Vec<RTCIceServer>,
}

impl TransportConfig {
    pub fn from_env() -> Self {
        Self {
            ice_servers: ice_servers_from_env(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

// ============================================================================
// PENDING CANDIDATES
// ============================================================================

/// Puffer für Remote-Kandidaten, die vor der Remote Description eintreffen
#[derive(Debug, Default)]
struct PendingCandidates {
    ready: bool,
    queued: Vec<IceCandidate>,
}

impl PendingCandidates {
    /// Gibt den Kandidaten zurück, wenn er sofort angewendet werden kann,
    /// sonst wird er eingereiht
    fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.ready {
            Some(candidate)
        } else {
            self.queued.push(candidate);
            None
        }
    }

    /// Remote Description ist gesetzt - alles Gepufferte wird fällig
    fn mark_ready(&mut self) -> Vec<IceCandidate> {
        self.ready = true;
        std::mem::take(&mut self.queued)
    }

    fn queued_len(&self) -> usize {
        self.queued.len()
    }
}

// ============================================================================
// PEER TRANSPORT
// ============================================================================

/// Eine Peer Connection samt Negotiation-Zustand
pub struct PeerTransport {
    pc: Arc<RTCPeerConnection>,
    pending: Arc<Mutex<PendingCandidates>>,
    closed: Arc<AtomicBool>,
}

impl PeerTransport {
    /// Öffnet den Transport: Peer Connection bauen, lokale Tracks anhängen,
    /// symmetrische Empfangsfähigkeit für Audio und Video anmelden.
    ///
    /// Alle lokalen Tracks hängen, bevor irgendeine Negotiation-Nachricht
    /// das Haus verlässt.
    pub async fn open(
        config: TransportConfig,
        local_tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| TransportError::WebRtc(e.to_string()))?,
        );

        // Empfangsfähigkeit unabhängig von der Anruf-Art - die Gegenseite
        // entscheidet, was sie rendert
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;
        }

        for track in local_tracks {
            pc.add_track(track)
                .await
                .map_err(|e| TransportError::WebRtc(e.to_string()))?;
        }

        let transport = Self {
            pc,
            pending: Arc::new(Mutex::new(PendingCandidates::default())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        transport.setup_handlers(events);

        Ok(transport)
    }

    /// Registriert die Event-Handler der Peer Connection
    fn setup_handlers(&self, events: mpsc::UnboundedSender<TransportEvent>) {
        // Connection State Handler
        let events_clone = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);

                let state = match s {
                    RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                    RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                    RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                    _ => None,
                };

                if let Some(state) = state {
                    let _ = events_clone.send(TransportEvent::StateChanged(state));
                }

                Box::pin(async {})
            }));

        // ICE Candidate Handler - sofort weiterreichen, sobald entdeckt
        let events_clone = events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = events_clone.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => {
                        tracing::warn!("Failed to serialize ICE candidate: {}", e);
                    }
                }
            }
            Box::pin(async {})
        }));

        // Track Handler - Remote-Medien genau einmal melden
        let remote_seen = Arc::new(AtomicBool::new(false));
        self.pc.on_track(Box::new(move |track, _, _| {
            let events = events.clone();
            let remote_seen = Arc::clone(&remote_seen);
            Box::pin(async move {
                tracing::info!("Received remote track: {:?}", track.codec());
                if !remote_seen.swap(true, Ordering::SeqCst) {
                    let kind = match track.kind() {
                        RTPCodecType::Video => "video",
                        _ => "audio",
                    };
                    let _ = events.send(TransportEvent::RemoteMedia { kind, track });
                }
            })
        }));
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    /// Initiator: erstellt das Offer und setzt es als Local Description
    pub async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        Ok(offer.sdp)
    }

    /// Angerufener: wendet das Offer an und erstellt das Answer
    pub async fn accept_offer(&self, offer_sdp: &str) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        self.drain_pending().await;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        Ok(answer.sdp)
    }

    /// Initiator: wendet das Answer der Gegenseite an
    pub async fn apply_answer(&self, answer_sdp: &str) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        self.drain_pending().await;
        Ok(())
    }

    /// Wendet einen Remote-Kandidaten an oder puffert ihn, solange die
    /// Remote Description noch fehlt
    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let apply_now = self.pending.lock().push(candidate);
        if let Some(candidate) = apply_now {
            self.apply_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn drain_pending(&self) {
        let due = self.pending.lock().mark_ready();
        for candidate in due {
            if let Err(e) = self.apply_candidate(candidate).await {
                tracing::warn!("Failed to apply buffered ICE candidate: {}", e);
            }
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))
    }

    #[cfg(test)]
    fn buffered_candidates(&self) -> usize {
        self.pending.lock().queued_len()
    }

    /// Schließt die Peer Connection; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error while closing peer connection: {}", e);
        }
    }
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTransport")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("buffered_candidates", &self.pending.lock().queued_len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalMedia;

    fn host_candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn test_pending_candidates_buffer_until_ready() {
        let mut pending = PendingCandidates::default();

        assert!(pending.push(host_candidate()).is_none());
        assert!(pending.push(host_candidate()).is_none());
        assert_eq!(pending.queued_len(), 2);

        let due = pending.mark_ready();
        assert_eq!(due.len(), 2);
        assert_eq!(pending.queued_len(), 0);

        // Ab jetzt direkt anwendbar
        assert!(pending.push(host_candidate()).is_some());
        assert!(pending.mark_ready().is_empty());
    }

    #[tokio::test]
    async fn test_offer_answer_exchange_and_candidate_buffering() {
        let config = TransportConfig {
            ice_servers: vec![],
        };

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        let caller_media = LocalMedia::without_capture(true);
        let callee_media = LocalMedia::without_capture(true);

        let caller = PeerTransport::open(config.clone(), caller_media.tracks(), tx_a)
            .await
            .unwrap();
        let callee = PeerTransport::open(config, callee_media.tracks(), tx_b)
            .await
            .unwrap();

        // Kandidat trifft vor dem Answer ein - muss gepuffert werden
        caller.add_remote_candidate(host_candidate()).await.unwrap();
        assert_eq!(caller.buffered_candidates(), 1);

        let offer_sdp = caller.create_offer().await.unwrap();
        assert!(offer_sdp.contains("audio"));
        assert!(offer_sdp.contains("video"));

        let answer_sdp = callee.accept_offer(&offer_sdp).await.unwrap();
        caller.apply_answer(&answer_sdp).await.unwrap();

        // Remote Description gesetzt - Puffer ist abgearbeitet
        assert_eq!(caller.buffered_candidates(), 0);

        // Späte Kandidaten gehen jetzt direkt durch
        caller.add_remote_candidate(host_candidate()).await.unwrap();
        assert_eq!(caller.buffered_candidates(), 0);

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let media = LocalMedia::without_capture(false);
        let transport = PeerTransport::open(
            TransportConfig {
                ice_servers: vec![],
            },
            media.tracks(),
            tx,
        )
        .await
        .unwrap();

        transport.close().await;
        transport.close().await;

        assert!(matches!(
            transport.add_remote_candidate(host_candidate()).await,
            Err(TransportError::Closed)
        ));
    }
}
