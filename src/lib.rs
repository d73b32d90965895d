//! Herzlink Call Core - Session- und Signaling-Kern der Anruf-Funktion
//!
//! Stellt P2P Voice/Video-Anrufe zwischen zwei gematchten Benutzern her:
//! - Call-Session-Lifecycle (initiated → ringing → answered → ended)
//! - Signaling-Protokoll über den Realtime-Bus der Plattform
//! - WebRTC Offer/Answer/ICE-Negotiation
//! - Lokale Medien (Mikrofon-Capture, Mute, Kamera an/aus)
//! - Call-History und Statistik über das Append-only Log
//!
//! Auth, Profile, Chat und UI liegen außerhalb dieses Crates; Store und
//! Bus werden nur über schmale Schnittstellen konsumiert.

pub mod media;
pub mod session;
pub mod signaling;
pub mod storage;
pub mod transport;

pub use media::{LocalMedia, MediaError, MediaGateway, MediaSource};
pub use session::{
    CallKind, CallManagerEvent, CallSession, CallSessionManager, CallStatus, SessionError,
};
pub use signaling::{
    InMemorySignalBus, SignalBus, SignalPayload, SignalingChannel, SignalingError,
    SignalingMessage, WebSocketSignalBus,
};
pub use storage::{CallHistoryReader, CallLogRecord, CallStats, CallStore, StoreError};
pub use transport::{PeerTransport, TransportConfig, TransportError, TransportState};

/// Initialisiert das Logging für Binaries, die diesen Core einbetten
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("herzlink_call=debug".parse().expect("valid directive"))
                .add_directive("webrtc=warn".parse().expect("valid directive")),
        )
        .init();
}
