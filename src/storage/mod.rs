//! Storage Module - Anbindung an den externen Store
//!
//! Dieses Modul verwaltet:
//! - Session-Datensätze (mutierbar bis terminal)
//! - Das Append-only Call-Log für History und Statistik
//! - Den persistierten Signaling-Backlog
//!

mod calls;
mod history;

pub use calls::{CallLogRecord, CallStore, StoreError};
pub use history::{CallHistoryReader, CallStats};
