//! Media Source Adapter - lokale Audio/Video-Quellen
//!
//! Beschafft die lokalen Tracks für einen Anruf und die Mikrofon-Aufnahme
//! über cpal. Audio wird immer angefordert, Video nur bei Video-Anrufen.
//! Keine Retries - Berechtigungs- und Gerätefehler gehen an den Aufrufer.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, Opus-Standard)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für den Capture-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

/// Clock Rate für Video-RTP (fix, unabhängig von der Framerate)
const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media access denied: {0}")]
    AccessDenied(String),

    #[error("No usable capture device: {0}")]
    DeviceUnavailable(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),
}

// ============================================================================
// MEDIA GATEWAY
// ============================================================================

/// Naht zur Medien-Beschaffung - produktiv cpal-gestützt, in Tests gefaked
pub trait MediaGateway: Send + Sync {
    fn acquire(&self, include_video: bool) -> Result<LocalMedia, MediaError>;
}

// ============================================================================
// LOCAL MEDIA HANDLE
// ============================================================================

/// Handle auf die lokalen Medien eines Anrufs
///
/// Note: cpal-Streams sind nicht Send, daher der explizite Send-Impl -
/// das Handle wird nur von seinem Manager benutzt.
pub struct LocalMedia {
    audio_track: Arc<TrackLocalStaticRTP>,
    video_track: Option<Arc<TrackLocalStaticRTP>>,
    capture_stream: Option<Stream>,

    /// Audio aktiv? Wird im Capture-Callback geprüft (Mute)
    audio_enabled: Arc<Mutex<bool>>,
    video_enabled: Mutex<bool>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,

    released: bool,
}

unsafe impl Send for LocalMedia {}

impl LocalMedia {
    /// Erstellt die lokalen Tracks ohne Capture-Pipeline - für Relays,
    /// Headless-Betrieb und Tests
    pub fn without_capture(include_video: bool) -> Self {
        Self {
            audio_track: make_audio_track(),
            video_track: include_video.then(make_video_track),
            capture_stream: None,
            audio_enabled: Arc::new(Mutex::new(true)),
            video_enabled: Mutex::new(include_video),
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            input_level: Arc::new(Mutex::new(0.0)),
            released: false,
        }
    }

    /// Alle lokalen Tracks für den Transport
    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> =
            vec![Arc::clone(&self.audio_track) as Arc<dyn TrackLocal + Send + Sync>];
        if let Some(video) = &self.video_track {
            tracks.push(Arc::clone(video) as Arc<dyn TrackLocal + Send + Sync>);
        }
        tracks
    }

    /// Schaltet Audio um und gibt den neuen Zustand zurück
    pub fn toggle_audio(&self) -> bool {
        let mut enabled = self.audio_enabled.lock();
        *enabled = !*enabled;
        tracing::debug!("Audio enabled: {}", *enabled);
        *enabled
    }

    /// Schaltet Video um und gibt den neuen Zustand zurück.
    /// Ohne Video-Track bleibt der Zustand aus.
    pub fn toggle_video(&self) -> bool {
        if self.video_track.is_none() {
            return false;
        }
        let mut enabled = self.video_enabled.lock();
        *enabled = !*enabled;
        tracing::debug!("Video enabled: {}", *enabled);
        *enabled
    }

    pub fn audio_enabled(&self) -> bool {
        *self.audio_enabled.lock()
    }

    pub fn video_enabled(&self) -> bool {
        *self.video_enabled.lock()
    }

    /// Liest einen 20ms-Frame aufgenommenes PCM für einen Encoder
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    /// RMS-Pegel des Mikrofons (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    /// Gibt alle Medien frei; idempotent
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.capture_stream = None;
        self.released = true;
        tracing::info!("Local media released");
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("has_video", &self.video_track.is_some())
            .field("audio_enabled", &self.audio_enabled())
            .field("released", &self.released)
            .finish()
    }
}

fn make_audio_track() -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: SAMPLE_RATE,
            channels: CHANNELS,
            ..Default::default()
        },
        "audio".to_string(),
        "herzlink-call".to_string(),
    ))
}

fn make_video_track() -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            ..Default::default()
        },
        "video".to_string(),
        "herzlink-call".to_string(),
    ))
}

// ============================================================================
// CPAL-BACKED MEDIA SOURCE
// ============================================================================

/// Produktive Medien-Quelle: Mikrofon-Capture über cpal
///
/// Video-Frames produziert die App-Schicht selbst und schreibt sie auf den
/// Video-Track - Codec-Wahl ist hier bewusst kein Thema.
pub struct MediaSource;

impl MediaSource {
    pub fn new() -> Self {
        Self
    }

    fn find_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Wählt die beste Konfiguration: 48kHz F32 > F32 > erste verfügbare
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, MediaError> {
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(MediaError::UnsupportedConfig(
            "No suitable audio configuration found".to_string(),
        ))
    }
}

impl Default for MediaSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaGateway for MediaSource {
    fn acquire(&self, include_video: bool) -> Result<LocalMedia, MediaError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            MediaError::DeviceUnavailable("no audio input device found".to_string())
        })?;

        let config = Self::find_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let media = LocalMedia::without_capture(include_video);
        let capture_buffer = Arc::clone(&media.capture_buffer);
        let audio_enabled = Arc::clone(&media.audio_enabled);
        let input_level = Arc::clone(&media.input_level);
        let target_sample_rate = SAMPLE_RATE;
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Audio Level berechnen (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    if !*audio_enabled.lock() {
                        return;
                    }

                    // Resampling falls nötig (zu 48kHz)
                    let samples: Vec<f32> = if source_sample_rate != target_sample_rate {
                        let ratio = target_sample_rate as f32 / source_sample_rate as f32;
                        let new_len = (data.len() as f32 * ratio) as usize;
                        (0..new_len)
                            .map(|i| {
                                let src_idx = i as f32 / ratio;
                                let idx = src_idx as usize;
                                let frac = src_idx - idx as f32;
                                let s1 = data.get(idx).copied().unwrap_or(0.0);
                                let s2 = data.get(idx + 1).copied().unwrap_or(s1);
                                s1 + (s2 - s1) * frac
                            })
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::AccessDenied(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::AccessDenied(e.to_string()))?;

        let mut media = media;
        media.capture_stream = Some(stream);
        Ok(media)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_call_has_no_video_track() {
        let media = LocalMedia::without_capture(false);
        assert_eq!(media.tracks().len(), 1);
        assert!(!media.video_enabled());
    }

    #[test]
    fn test_video_call_has_both_tracks() {
        let media = LocalMedia::without_capture(true);
        assert_eq!(media.tracks().len(), 2);
        assert!(media.audio_enabled());
        assert!(media.video_enabled());
    }

    #[test]
    fn test_toggle_audio_flips_and_reports_new_state() {
        let media = LocalMedia::without_capture(false);
        assert!(media.audio_enabled());
        assert!(!media.toggle_audio());
        assert!(!media.audio_enabled());
        assert!(media.toggle_audio());
    }

    #[test]
    fn test_toggle_video_without_track_stays_off() {
        let media = LocalMedia::without_capture(false);
        assert!(!media.toggle_video());
        assert!(!media.toggle_video());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut media = LocalMedia::without_capture(true);
        assert!(!media.is_released());
        media.release();
        media.release();
        assert!(media.is_released());
    }
}
