//! Session Module - Call-Lifecycle
//!
//! Dieses Modul verwaltet:
//! - Das Datenmodell einer Call-Session (Status, Zeitstempel, Dauer)
//! - Den Call Session Manager mit der Lifecycle-State-Machine
//!

mod manager;
mod types;

pub use manager::{CallManagerEvent, CallSessionManager, SessionError};
pub use types::{duration_seconds, CallKind, CallSession, CallStatus, NewCallSession};
