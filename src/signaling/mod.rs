//! Signaling Module - Protokoll-Nachrichten und Relay über den Bus
//!
//! Dieses Modul verwaltet den Signalweg eines Anrufs:
//! - Wire-Typen des Signaling-Protokolls (Tagged Union über `signal_type`)
//! - Schmale Anbindung an den externen Pub/Sub-Bus (`SignalBus`)
//! - Per-Call-Kanal mit Echo-Filter, Backlog-Replay und geordneter Inbox
//!

mod bus;
mod channel;
mod messages;
mod ws;

pub use bus::{BusError, BusSubscription, InMemorySignalBus, SignalBus};
pub use channel::{SignalingChannel, SignalingError, SignalingInbox};
pub use messages::{
    signal_topic, IceCandidate, SessionDescription, SignalPayload, SignalingMessage,
};
pub use ws::WebSocketSignalBus;
