//! Transport Module - Peer-Verbindung und Negotiation
//!
//! Dieses Modul verwaltet:
//! - Die WebRTC Peer Connection eines aktiven Anrufs
//! - Offer/Answer/ICE-Negotiation inkl. Kandidaten-Pufferung
//! - ICE/TURN-Konfiguration aus der Umgebung

mod peer;

pub use peer::{
    default_ice_servers, ice_servers_from_env, PeerTransport, TransportConfig, TransportError,
    TransportEvent, TransportState,
};
