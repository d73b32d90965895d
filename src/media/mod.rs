//! Media Module - lokale Audio/Video-Beschaffung
//!
//! Dieses Modul verwaltet:
//! - Mikrofon-Capture über cpal
//! - Die lokalen WebRTC-Tracks eines Anrufs
//! - Enable/Disable pro Track (Mute, Kamera aus)

mod source;

pub use source::{
    LocalMedia, MediaError, MediaGateway, MediaSource, CHANNELS, FRAME_SIZE, SAMPLE_RATE,
};
