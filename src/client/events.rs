//! Everything the orchestrator consumes arrives as an [`Event`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::client::media::{
    AudioDevice, AudioDeviceSettings, CaptureKind, MediaError, MediaStream, MediaTrack,
};
use crate::client::peers::PeerSnapshot;
use crate::ws::ServerMessage;

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmitMode {
    #[default]
    Ptt,
    Continuous,
}

#[derive(Debug, Clone)]
pub enum Event {
    // User intents
    Start,
    Shutdown,
    SetRoomId(Option<String>),
    VoiceStart,
    VoiceStop,
    VideoStart,
    VideoStop,
    CastStart,
    CastStop,
    DismissCastingTips,
    SetTransmitMode(TransmitMode),
    ToggleInputSelector,
    SetAudioSource(String),
    SetChannelMap {
        left: Option<u32>,
        right: Option<u32>,
    },

    /// From the signaling transport started under `epoch`.
    Transport {
        epoch: u64,
        event: TransportEvent,
    },
    /// From the peer link opened as `generation` during peer run `run`.
    Peer {
        run: u64,
        peer_id: String,
        generation: u64,
        event: PeerEvent,
    },
    PeersChanged {
        run: u64,
        peers: PeerSnapshot,
    },
    Media(MediaEvent),
    VoiceReleaseElapsed {
        generation: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { code: Option<u16> },
    Error(String),
    Received(ServerMessage),
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Negotiation payload to relay through the broker.
    Signal(Value),
    Connect,
    Data(String),
    Track {
        stream_id: String,
        track: MediaTrack,
    },
    TrackMuted {
        stream_id: String,
        track_id: String,
        muted: bool,
    },
    TrackEnded {
        stream_id: String,
        track_id: String,
    },
    Close,
    Error(String),
    /// Grace period after an error-close elapsed.
    Expired,
}

#[derive(Debug, Clone)]
pub enum MediaEvent {
    UserAddStream(MediaStream),
    UserAddTrack {
        stream_id: String,
        track: MediaTrack,
    },
    UserRemoveTrack {
        stream_id: String,
        track_id: String,
    },
    UserAudioMuted {
        stream_id: String,
    },
    UserAudioUnmuted {
        stream_id: String,
    },
    AcquiredAudio,
    AcquiredVideo,
    AcquireError {
        kind: CaptureKind,
        error: MediaError,
    },
    AudioGranted,
    AudioDevices(Vec<AudioDevice>),
    AudioSettings(AudioDeviceSettings),
    CastAddStream(MediaStream),
    CastRemoveStream {
        stream_id: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::Shutdown => "shutdown",
            Event::SetRoomId(_) => "set_room_id",
            Event::VoiceStart => "voice_start",
            Event::VoiceStop => "voice_stop",
            Event::VideoStart => "video_start",
            Event::VideoStop => "video_stop",
            Event::CastStart => "cast_start",
            Event::CastStop => "cast_stop",
            Event::DismissCastingTips => "dismiss_casting_tips",
            Event::SetTransmitMode(_) => "set_transmit_mode",
            Event::ToggleInputSelector => "toggle_input_selector",
            Event::SetAudioSource(_) => "set_audio_source",
            Event::SetChannelMap { .. } => "set_channel_map",
            Event::Transport { event, .. } => match event {
                TransportEvent::Connected => "ws_connected",
                TransportEvent::Disconnected { .. } => "ws_disconnected",
                TransportEvent::Error(_) => "ws_error",
                TransportEvent::Received(_) => "ws_message",
            },
            Event::Peer { event, .. } => match event {
                PeerEvent::Signal(_) => "peer_signal",
                PeerEvent::Connect => "peer_connect",
                PeerEvent::Data(_) => "peer_data",
                PeerEvent::Track { .. } => "peer_track",
                PeerEvent::TrackMuted { .. } => "peer_track_muted",
                PeerEvent::TrackEnded { .. } => "peer_track_ended",
                PeerEvent::Close => "peer_close",
                PeerEvent::Error(_) => "peer_error",
                PeerEvent::Expired => "peer_expired",
            },
            Event::PeersChanged { .. } => "peers_changed",
            Event::Media(event) => match event {
                MediaEvent::UserAddStream(_) => "user_add_stream",
                MediaEvent::UserAddTrack { .. } => "user_add_track",
                MediaEvent::UserRemoveTrack { .. } => "user_remove_track",
                MediaEvent::UserAudioMuted { .. } => "user_audio_muted",
                MediaEvent::UserAudioUnmuted { .. } => "user_audio_unmuted",
                MediaEvent::AcquiredAudio => "acquired_audio",
                MediaEvent::AcquiredVideo => "acquired_video",
                MediaEvent::AcquireError { .. } => "acquire_error",
                MediaEvent::AudioGranted => "audio_granted",
                MediaEvent::AudioDevices(_) => "audio_devices",
                MediaEvent::AudioSettings(_) => "audio_settings",
                MediaEvent::CastAddStream(_) => "cast_add_stream",
                MediaEvent::CastRemoveStream { .. } => "cast_remove_stream",
            },
            Event::VoiceReleaseElapsed { .. } => "voice_release_elapsed",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Event::Transport {
                event: TransportEvent::Error(_),
                ..
            } | Event::Peer {
                event: PeerEvent::Error(_),
                ..
            } | Event::Media(MediaEvent::AcquireError { .. })
        )
    }

    /// High-volume events kept out of the debug log.
    pub fn is_chatty(&self) -> bool {
        matches!(
            self,
            Event::PeersChanged { .. }
                | Event::Peer {
                    event: PeerEvent::Signal(_),
                    ..
                }
                | Event::Transport {
                    event: TransportEvent::Received(ServerMessage::Signal { .. }),
                    ..
                }
        )
    }
}
