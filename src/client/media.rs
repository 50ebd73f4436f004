//! Media model and the capture capability the orchestrator drives.
//!
//! Capture and audio-graph wiring live behind [`MediaCapability`]; each request
//! completes later with exactly one [`MediaEvent`] on the event queue.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::client::events::{Event, EventSender, MediaEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a track's media comes from.
#[derive(Clone, Default)]
pub enum TrackSource {
    #[default]
    Detached,
    Local(Arc<dyn TrackLocal + Send + Sync>),
    Remote(Arc<TrackRemote>),
}

impl fmt::Debug for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackSource::Detached => f.write_str("Detached"),
            TrackSource::Local(_) => f.write_str("Local"),
            TrackSource::Remote(_) => f.write_str("Remote"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub muted: bool,
    pub source: TrackSource,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            muted: false,
            source: TrackSource::Detached,
        }
    }

    pub fn local(kind: TrackKind, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            id: track.id().to_string(),
            kind,
            muted: false,
            source: TrackSource::Local(track),
        }
    }

    pub fn remote(id: String, kind: TrackKind, track: Arc<TrackRemote>) -> Self {
        Self {
            id,
            kind,
            muted: false,
            source: TrackSource::Remote(track),
        }
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.muted == other.muted
    }
}

/// A group of tracks announced to peers under one id.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.add_track(track);
        self
    }

    /// Replaces a track with the same id.
    pub fn add_track(&mut self, track: MediaTrack) {
        match self.tracks.iter_mut().find(|t| t.id == track.id) {
            Some(existing) => *existing = track,
            None => self.tracks.push(track),
        }
    }

    pub fn remove_track(&mut self, track_id: &str) -> Option<MediaTrack> {
        let index = self.tracks.iter().position(|t| t.id == track_id)?;
        Some(self.tracks.remove(index))
    }

    pub fn track(&self, track_id: &str) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.id == track_id)
    }

    pub fn set_muted(&mut self, track_id: &str, muted: bool) -> bool {
        match self.tracks.iter_mut().find(|t| t.id == track_id) {
            Some(track) => {
                track.muted = muted;
                true
            }
            None => false,
        }
    }

    /// No video track is currently delivering frames.
    pub fn is_audio_only(&self) -> bool {
        !self
            .tracks
            .iter()
            .any(|t| t.kind == TrackKind::Video && !t.muted)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// What a capture request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    Audio,
    Video,
    Cast,
}

/// Capture constraints handed to the media capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    pub noise_suppression: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub facing_user: bool,
}

pub const USER_STREAM_WIDTH: u32 = 1280;
pub const USER_STREAM_HEIGHT: u32 = 720;
pub const CAST_STREAM_WIDTH: u32 = 1920;
pub const CAST_STREAM_HEIGHT: u32 = 1080;

impl Constraints {
    /// Audio processing stays off for every kind: calls carry music as well as voice.
    pub fn for_kind(kind: CaptureKind) -> Self {
        let raw_audio = Self {
            echo_cancellation: false,
            auto_gain_control: false,
            noise_suppression: false,
            width: None,
            height: None,
            facing_user: false,
        };

        match kind {
            CaptureKind::Audio => raw_audio,
            CaptureKind::Video => Self {
                width: Some(USER_STREAM_WIDTH),
                height: Some(USER_STREAM_HEIGHT),
                facing_user: true,
                ..raw_audio
            },
            CaptureKind::Cast => Self {
                width: Some(CAST_STREAM_WIDTH),
                height: Some(CAST_STREAM_HEIGHT),
                ..raw_audio
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub device_id: String,
    pub label: String,
}

/// Active microphone and its channel mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceSettings {
    pub label: String,
    pub device_id: String,
    pub channel_count: u32,
    pub left: u32,
    pub right: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Device not found: {0}")]
    NotFound(String),
    #[error("Capture unavailable: {0}")]
    Unavailable(String),
}

/// Capture devices as seen by the orchestrator.
///
/// Calls return immediately; results arrive as [`MediaEvent`]s.
pub trait MediaCapability: Send {
    fn acquire(&mut self, kind: CaptureKind, constraints: Constraints);
    fn release(&mut self, kind: CaptureKind);
    fn set_audio_muted(&mut self, muted: bool);
    /// Report audio inputs, and whether permission is already granted.
    fn check_audio(&mut self);
    fn set_audio_source(&mut self, device_id: &str);
    /// `None` keeps the current mapping for that side.
    fn set_channel_map(&mut self, left: Option<u32>, right: Option<u32>);
}

/// Capability for a participant that only listens and watches.
pub struct ReceiveOnlyMedia {
    events: EventSender,
}

impl ReceiveOnlyMedia {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    fn emit(&self, event: MediaEvent) {
        if self.events.send(Event::Media(event)).is_err() {
            tracing::debug!("Event queue closed, dropping media event");
        }
    }
}

impl MediaCapability for ReceiveOnlyMedia {
    fn acquire(&mut self, kind: CaptureKind, _constraints: Constraints) {
        self.emit(MediaEvent::AcquireError {
            kind,
            error: MediaError::Unavailable("receive-only participant".to_string()),
        });
    }

    fn release(&mut self, _kind: CaptureKind) {}

    fn set_audio_muted(&mut self, _muted: bool) {}

    fn check_audio(&mut self) {
        self.emit(MediaEvent::AudioDevices(Vec::new()));
    }

    fn set_audio_source(&mut self, device_id: &str) {
        tracing::debug!(device_id = %device_id, "No audio source to switch");
    }

    fn set_channel_map(&mut self, _left: Option<u32>, _right: Option<u32>) {}
}

/// One 20 ms Opus frame that decodes to silence.
const SILENT_OPUS_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);
const SILENCE_DEVICE_ID: &str = "silence";

/// Capability for a headless participant that takes part in voice with a
/// microphone that only ever produces silence. Video and cast are refused.
pub struct SilentMicrophone {
    events: EventSender,
    stream_id: String,
    track: Option<Arc<TrackLocalStaticSample>>,
    writer: Option<AbortHandle>,
    muted: Arc<AtomicBool>,
}

impl SilentMicrophone {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            stream_id: format!("huddle-{}", uuid::Uuid::new_v4()),
            track: None,
            writer: None,
            muted: Arc::new(AtomicBool::new(true)),
        }
    }

    fn emit(&self, event: MediaEvent) {
        if self.events.send(Event::Media(event)).is_err() {
            tracing::debug!("Event queue closed, dropping media event");
        }
    }

    fn start_audio(&mut self) {
        if self.track.is_some() {
            self.emit(MediaEvent::AcquiredAudio);
            return;
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            format!("{}-audio", self.stream_id),
            self.stream_id.clone(),
        ));
        let writer = tokio::spawn(write_silence(track.clone(), self.muted.clone()));
        self.writer = Some(writer.abort_handle());
        self.track = Some(track.clone());

        tracing::info!(stream_id = %self.stream_id, "Silent microphone started");

        let mut microphone = MediaTrack::local(TrackKind::Audio, track);
        microphone.muted = self.muted.load(Ordering::SeqCst);
        self.emit(MediaEvent::UserAddStream(
            MediaStream::new(self.stream_id.clone()).with_track(microphone),
        ));
        self.emit(MediaEvent::AudioSettings(AudioDeviceSettings {
            label: "Silence".to_string(),
            device_id: SILENCE_DEVICE_ID.to_string(),
            channel_count: 2,
            left: 0,
            right: 1,
        }));
        self.emit(MediaEvent::AcquiredAudio);
    }
}

impl Drop for SilentMicrophone {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Muted microphones send nothing.
async fn write_silence(track: Arc<TrackLocalStaticSample>, muted: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(OPUS_FRAME_DURATION);
    loop {
        ticker.tick().await;
        if muted.load(Ordering::SeqCst) {
            continue;
        }
        let sample = Sample {
            data: SILENT_OPUS_FRAME.to_vec().into(),
            duration: OPUS_FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            tracing::trace!(error = %e, "Failed to write silence");
        }
    }
}

impl MediaCapability for SilentMicrophone {
    fn acquire(&mut self, kind: CaptureKind, _constraints: Constraints) {
        match kind {
            CaptureKind::Audio => self.start_audio(),
            CaptureKind::Video | CaptureKind::Cast => self.emit(MediaEvent::AcquireError {
                kind,
                error: MediaError::Unavailable("no camera or screen on this host".to_string()),
            }),
        }
    }

    fn release(&mut self, kind: CaptureKind) {
        if kind != CaptureKind::Audio {
            return;
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(track) = self.track.take() {
            tracing::info!(stream_id = %self.stream_id, "Silent microphone stopped");
            self.emit(MediaEvent::UserRemoveTrack {
                stream_id: self.stream_id.clone(),
                track_id: track.id().to_string(),
            });
        }
    }

    fn set_audio_muted(&mut self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        let stream_id = self.stream_id.clone();
        self.emit(if muted {
            MediaEvent::UserAudioMuted { stream_id }
        } else {
            MediaEvent::UserAudioUnmuted { stream_id }
        });
    }

    fn check_audio(&mut self) {
        self.emit(MediaEvent::AudioDevices(vec![AudioDevice {
            device_id: SILENCE_DEVICE_ID.to_string(),
            label: "Silence".to_string(),
        }]));
        self.emit(MediaEvent::AudioGranted);
    }

    fn set_audio_source(&mut self, device_id: &str) {
        if device_id != SILENCE_DEVICE_ID {
            tracing::warn!(device_id = %device_id, "Unknown audio source");
        }
    }

    fn set_channel_map(&mut self, left: Option<u32>, right: Option<u32>) {
        tracing::debug!(?left, ?right, "Silence has no channels to map");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_only_tracks_unmuted_video() {
        let mut stream = MediaStream::new("s1").with_track(MediaTrack::new("a", TrackKind::Audio));
        assert!(stream.is_audio_only());

        stream.add_track(MediaTrack::new("v", TrackKind::Video));
        assert!(!stream.is_audio_only());

        assert!(stream.set_muted("v", true));
        assert!(stream.is_audio_only());

        stream.set_muted("v", false);
        stream.remove_track("v");
        assert!(stream.is_audio_only());
        assert_eq!(stream.tracks.len(), 1);
    }

    #[test]
    fn test_add_track_replaces_same_id() {
        let mut stream = MediaStream::new("s1");
        stream.add_track(MediaTrack::new("a", TrackKind::Audio));
        let mut muted = MediaTrack::new("a", TrackKind::Audio);
        muted.muted = true;
        stream.add_track(muted);

        assert_eq!(stream.tracks.len(), 1);
        assert!(stream.track("a").is_some_and(|t| t.muted));
    }

    #[test]
    fn test_constraints_disable_audio_processing() {
        for kind in [CaptureKind::Audio, CaptureKind::Video, CaptureKind::Cast] {
            let c = Constraints::for_kind(kind);
            assert!(!c.echo_cancellation && !c.auto_gain_control && !c.noise_suppression);
        }
        assert!(Constraints::for_kind(CaptureKind::Video).facing_user);
        assert_eq!(Constraints::for_kind(CaptureKind::Cast).width, Some(CAST_STREAM_WIDTH));
    }

    #[test]
    fn test_receive_only_rejects_capture() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut media = ReceiveOnlyMedia::new(tx);

        media.acquire(CaptureKind::Video, Constraints::for_kind(CaptureKind::Video));
        match rx.try_recv() {
            Ok(Event::Media(MediaEvent::AcquireError { kind, .. })) => {
                assert_eq!(kind, CaptureKind::Video)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn next_media(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> MediaEvent {
        match rx.try_recv() {
            Ok(Event::Media(event)) => event,
            other => panic!("expected media event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_microphone_offers_a_local_audio_track() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut media = SilentMicrophone::new(tx);

        media.check_audio();
        assert!(matches!(next_media(&mut rx), MediaEvent::AudioDevices(devices) if devices.len() == 1));
        assert!(matches!(next_media(&mut rx), MediaEvent::AudioGranted));

        media.acquire(CaptureKind::Audio, Constraints::for_kind(CaptureKind::Audio));
        let stream = match next_media(&mut rx) {
            MediaEvent::UserAddStream(stream) => stream,
            other => panic!("expected user stream, got {:?}", other),
        };
        assert_eq!(stream.tracks.len(), 1);
        let track = &stream.tracks[0];
        assert_eq!(track.kind, TrackKind::Audio);
        assert!(track.muted);
        assert!(matches!(track.source, TrackSource::Local(_)));
        assert!(matches!(next_media(&mut rx), MediaEvent::AudioSettings(_)));
        assert!(matches!(next_media(&mut rx), MediaEvent::AcquiredAudio));

        media.set_audio_muted(false);
        assert!(matches!(
            next_media(&mut rx),
            MediaEvent::UserAudioUnmuted { stream_id } if stream_id == stream.id
        ));

        media.acquire(CaptureKind::Cast, Constraints::for_kind(CaptureKind::Cast));
        assert!(matches!(
            next_media(&mut rx),
            MediaEvent::AcquireError { kind: CaptureKind::Cast, .. }
        ));

        media.release(CaptureKind::Audio);
        assert!(matches!(
            next_media(&mut rx),
            MediaEvent::UserRemoveTrack { track_id, .. } if track_id == track.id
        ));
        assert!(rx.try_recv().is_err());
    }
}
