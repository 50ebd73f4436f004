//! Call orchestration.
//!
//! A call is a fixed set of regions (connection, signaling, peer, voice,
//! video, cast, ui) advanced by one dispatcher. Every event is offered to every
//! region, one event at a time, so regions never need locks. Regions talk to
//! each other only through queued events and the shared [`CallContext`], where
//! each field has exactly one writing region:
//!
//! | field | writer |
//! |---|---|
//! | `status`, `room_id`, `session_id`, `session_secret` | connection |
//! | `peers` | peer |
//! | `user_stream`, `audio_active`, `audio_devices`, `audio_device_settings` | media |
//! | `transmit_mode` | ui |
//! | `cast_stream`, `casting_tips_seen` | cast |

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::client::events::{
    Event, EventReceiver, EventSender, MediaEvent, PeerEvent, TransmitMode, TransportEvent,
};
use crate::client::media::{
    AudioDevice, AudioDeviceSettings, CaptureKind, Constraints, MediaCapability, MediaStream,
};
use crate::client::peers::{PeerConnectionManager, PeerFactory, PeerNotice, PeerSnapshot};
use crate::client::transport::{SignalingConnector, SignalingLink};
use crate::config::ClientConfig;
use crate::ws::{ClientMessage, Credentials, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    FirstTry,
    Retrying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Nowhere,
    Connecting(Attempt),
    Joining,
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRegion {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceActivity {
    Idle,
    Sending,
    Releasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    NoPermission,
    WaitingForMedia,
    HasMedia(VoiceActivity),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoState {
    Idle,
    WaitingForMedia,
    Sending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastState {
    Idle,
    ShowingTips,
    WaitingForMedia,
    Sending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UiState {
    pub input_selector_open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Regions {
    pub connection: ConnectionState,
    pub signaling: SignalingState,
    pub peer: PeerRegion,
    pub voice: VoiceState,
    pub video: VideoState,
    pub cast: CastState,
    pub ui: UiState,
}

impl Default for Regions {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Nowhere,
            signaling: SignalingState::Idle,
            peer: PeerRegion::Idle,
            voice: VoiceState::NoPermission,
            video: VideoState::Idle,
            cast: CastState::Idle,
            ui: UiState::default(),
        }
    }
}

/// Coarse connection progress for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Idle,
    Connecting,
    Retrying,
    Joining,
    Joined,
}

impl From<ConnectionState> for CallStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Nowhere => CallStatus::Idle,
            ConnectionState::Connecting(Attempt::FirstTry) => CallStatus::Connecting,
            ConnectionState::Connecting(Attempt::Retrying) => CallStatus::Retrying,
            ConnectionState::Joining => CallStatus::Joining,
            ConnectionState::Joined => CallStatus::Joined,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub status: CallStatus,
    pub room_id: Option<String>,
    pub session_id: Option<String>,
    pub session_secret: Option<String>,
    pub user_stream: Option<MediaStream>,
    pub cast_stream: Option<MediaStream>,
    pub audio_active: bool,
    pub audio_devices: Vec<AudioDevice>,
    pub audio_device_settings: Option<AudioDeviceSettings>,
    pub transmit_mode: TransmitMode,
    pub peers: PeerSnapshot,
    pub casting_tips_seen: bool,
}

impl CallContext {
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.session_id, &self.session_secret) {
            (Some(session_id), Some(session_secret)) => Some(Credentials {
                session_id: session_id.clone(),
                session_secret: session_secret.clone(),
            }),
            _ => None,
        }
    }
}

/// What presentation observes after every dispatch.
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub regions: Regions,
    pub context: CallContext,
}

/// Messages regions raise for each other.
#[derive(Debug)]
enum Internal {
    TransportStart,
    TransportStop,
    PeersStart,
    PeersStop,
    RemoteCast,
}

enum Queued {
    External(Event),
    Internal(Internal),
}

pub struct CallMachine {
    config: ClientConfig,
    events: EventSender,
    connector: Box<dyn SignalingConnector>,
    peer_factory: Arc<dyn PeerFactory>,
    media: Box<dyn MediaCapability>,

    transport: Option<Box<dyn SignalingLink>>,
    transport_epoch: u64,
    peers: Option<PeerConnectionManager>,
    peer_run: u64,
    release_generation: u64,
    release_timer: Option<AbortHandle>,

    regions: Regions,
    context: CallContext,
    queue: VecDeque<Queued>,
    publisher: watch::Sender<CallSnapshot>,
    stopped: bool,
}

impl CallMachine {
    pub fn new(
        config: ClientConfig,
        events: EventSender,
        connector: Box<dyn SignalingConnector>,
        peer_factory: Arc<dyn PeerFactory>,
        media: Box<dyn MediaCapability>,
    ) -> Self {
        let context = CallContext {
            room_id: config.room_id.clone(),
            ..Default::default()
        };
        let (publisher, _) = watch::channel(CallSnapshot {
            regions: Regions::default(),
            context: context.clone(),
        });

        Self {
            config,
            events,
            connector,
            peer_factory,
            media,
            transport: None,
            transport_epoch: 0,
            peers: None,
            peer_run: 0,
            release_generation: 0,
            release_timer: None,
            regions: Regions::default(),
            context,
            queue: VecDeque::new(),
            publisher,
            stopped: false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.publisher.subscribe()
    }

    pub fn regions(&self) -> &Regions {
        &self.regions
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Process events until shutdown.
    pub async fn run(mut self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
            if self.stopped {
                break;
            }
        }
        tracing::info!("Call orchestrator stopped");
    }

    /// Handle one event and everything it raises, then publish.
    pub fn dispatch(&mut self, event: Event) {
        self.queue.push_back(Queued::External(event));

        while let Some(item) = self.queue.pop_front() {
            match item {
                Queued::External(event) => self.process(event),
                Queued::Internal(internal) => self.process_internal(internal),
            }
        }

        self.publisher.send_replace(CallSnapshot {
            regions: self.regions,
            context: self.context.clone(),
        });
    }

    fn raise(&mut self, internal: Internal) {
        self.queue.push_back(Queued::Internal(internal));
    }

    fn is_stale(&self, event: &Event) -> bool {
        match event {
            Event::Transport { epoch, .. } => {
                self.transport.is_none() || *epoch != self.transport_epoch
            }
            Event::Peer { run, .. } | Event::PeersChanged { run, .. } => {
                self.peers.as_ref().map(|p| p.run()) != Some(*run)
            }
            _ => false,
        }
    }

    fn process(&mut self, event: Event) {
        if self.stopped {
            return;
        }
        if self.is_stale(&event) {
            tracing::trace!(event = event.name(), "Dropping stale event");
            return;
        }
        log_event(&event);

        if let Event::Shutdown = event {
            self.shutdown();
            return;
        }

        self.media_region(&event);
        self.ui_region(&event);
        self.signaling_region(&event);
        self.connection_region(&event);
        self.peer_region(&event);
        self.voice_region(&event);
        self.video_region(&event);
        self.cast_region(&event);
    }

    fn process_internal(&mut self, internal: Internal) {
        tracing::trace!(internal = ?internal, "Internal event");
        match internal {
            Internal::TransportStart => self.start_transport(),
            Internal::TransportStop => self.stop_transport(),
            Internal::PeersStart => self.start_peers(),
            Internal::PeersStop => self.stop_peers(),
            Internal::RemoteCast => {
                if self.regions.cast == CastState::Sending {
                    tracing::info!("Remote peer started casting, stopping local cast");
                    self.exit_cast_sending();
                }
            }
        }
    }

    // ==================== media ====================

    fn media_region(&mut self, event: &Event) {
        match event {
            Event::SetAudioSource(device_id) => self.media.set_audio_source(device_id),
            Event::SetChannelMap { left, right } => self.media.set_channel_map(*left, *right),
            Event::Media(media) => match media {
                MediaEvent::AudioDevices(devices) => self.context.audio_devices = devices.clone(),
                MediaEvent::AudioSettings(settings) => {
                    self.context.audio_device_settings = Some(settings.clone())
                }
                MediaEvent::UserAddStream(stream) => self.context.user_stream = Some(stream.clone()),
                MediaEvent::UserAddTrack { stream_id, track } => {
                    self.context
                        .user_stream
                        .get_or_insert_with(|| MediaStream::new(stream_id.clone()))
                        .add_track(track.clone());
                }
                MediaEvent::UserRemoveTrack {
                    stream_id,
                    track_id,
                } => {
                    if let Some(stream) = self
                        .context
                        .user_stream
                        .as_mut()
                        .filter(|s| &s.id == stream_id)
                    {
                        stream.remove_track(track_id);
                    }
                }
                MediaEvent::UserAudioMuted { .. } => self.context.audio_active = false,
                MediaEvent::UserAudioUnmuted { .. } => self.context.audio_active = true,
                _ => {}
            },
            _ => {}
        }
    }

    // ==================== ui ====================

    fn ui_region(&mut self, event: &Event) {
        match event {
            Event::ToggleInputSelector => {
                self.regions.ui.input_selector_open = !self.regions.ui.input_selector_open
            }
            Event::SetTransmitMode(mode) => self.context.transmit_mode = *mode,
            Event::VoiceStop => self.context.transmit_mode = TransmitMode::Ptt,
            _ => {}
        }
    }

    // ==================== signaling ====================

    fn signaling_region(&mut self, event: &Event) {
        let Event::Transport { event, .. } = event else {
            return;
        };
        self.regions.signaling = match (self.regions.signaling, event) {
            (SignalingState::Idle, _) => SignalingState::Idle,
            (_, TransportEvent::Connected) => SignalingState::Connected,
            (_, TransportEvent::Disconnected { .. }) => SignalingState::Reconnecting,
            (state, _) => state,
        };
    }

    fn start_transport(&mut self) {
        if let Some(link) = self.transport.take() {
            link.stop();
        }
        self.transport_epoch += 1;
        self.transport = Some(
            self.connector
                .connect(self.transport_epoch, self.events.clone()),
        );
        self.regions.signaling = SignalingState::Connecting;
    }

    fn stop_transport(&mut self) {
        if let Some(link) = self.transport.take() {
            link.stop();
        }
        self.transport_epoch += 1;
        self.regions.signaling = SignalingState::Idle;
    }

    fn send_to_broker(&self, msg: ClientMessage) {
        match &self.transport {
            Some(link) => {
                if let Err(e) = link.send(msg) {
                    tracing::warn!(error = %e, "Failed to queue broker message");
                }
            }
            None => tracing::warn!(?msg, "No signaling transport, dropping message"),
        }
    }

    // ==================== connection ====================

    fn connection_region(&mut self, event: &Event) {
        if let Event::SetRoomId(room_id) = event {
            if *room_id != self.context.room_id {
                self.context.room_id = room_id.clone();
                self.enter_nowhere();
            }
            return;
        }

        match (self.regions.connection, event) {
            (ConnectionState::Nowhere, Event::Start) => self.enter_connecting(),
            (
                ConnectionState::Connecting(Attempt::FirstTry),
                Event::Transport {
                    event: TransportEvent::Error(_),
                    ..
                },
            ) => self.set_connection(ConnectionState::Connecting(Attempt::Retrying)),
            (
                ConnectionState::Connecting(_) | ConnectionState::Joining | ConnectionState::Joined,
                Event::Transport {
                    event: TransportEvent::Connected,
                    ..
                },
            ) => self.enter_joining(),
            (
                ConnectionState::Joining,
                Event::Transport {
                    event:
                        TransportEvent::Received(ServerMessage::Joined {
                            room_id,
                            session_id,
                            session_secret,
                        }),
                    ..
                },
            ) => {
                self.context.room_id = Some(room_id.clone());
                self.context.session_id = Some(session_id.clone());
                self.context.session_secret = Some(session_secret.clone());
                self.enter_joined();
            }
            (
                _,
                Event::Transport {
                    event: TransportEvent::Received(ServerMessage::Error { error }),
                    ..
                },
            ) => {
                tracing::error!(error = %error, "Broker rejected request");
            }
            _ => {}
        }
    }

    fn set_connection(&mut self, state: ConnectionState) {
        self.regions.connection = state;
        self.context.status = state.into();
    }

    fn enter_nowhere(&mut self) {
        self.set_connection(ConnectionState::Nowhere);
        self.raise(Internal::PeersStop);
        self.raise(Internal::TransportStop);
    }

    fn enter_connecting(&mut self) {
        self.set_connection(ConnectionState::Connecting(Attempt::FirstTry));
        self.raise(Internal::TransportStart);
    }

    fn enter_joining(&mut self) {
        self.set_connection(ConnectionState::Joining);
        self.raise(Internal::PeersStart);

        let credentials = self.context.credentials();
        let msg = match &self.context.room_id {
            Some(room_id) => ClientMessage::join(room_id, credentials.as_ref()),
            None => ClientMessage::create(credentials.as_ref()),
        };
        tracing::info!(
            room_id = ?self.context.room_id,
            resuming = credentials.is_some(),
            "Requesting room"
        );
        self.send_to_broker(msg);
    }

    fn enter_joined(&mut self) {
        self.set_connection(ConnectionState::Joined);
        tracing::info!(
            room_id = ?self.context.room_id,
            session_id = ?self.context.session_id,
            "Joined room"
        );
        self.media.check_audio();
    }

    // ==================== peer ====================

    fn start_peers(&mut self) {
        if self.peers.is_some() {
            return;
        }
        self.peer_run += 1;
        let manager = PeerConnectionManager::new(
            self.peer_run,
            self.peer_factory.clone(),
            self.events.clone(),
            self.config.error_peer_grace(),
        )
        .with_local_media(
            self.context.user_stream.clone(),
            self.context.cast_stream.clone(),
            self.context.audio_active,
        );
        self.peers = Some(manager);
        self.regions.peer = PeerRegion::Running;
    }

    fn stop_peers(&mut self) {
        if let Some(manager) = self.peers.take() {
            manager.stop();
        }
        self.context.peers.clear();
        self.regions.peer = PeerRegion::Idle;
    }

    fn peer_region(&mut self, event: &Event) {
        if let Event::Peer {
            peer_id,
            generation,
            event: PeerEvent::Signal(data),
            ..
        } = event
        {
            let current = self
                .peers
                .as_ref()
                .is_some_and(|p| p.is_current(peer_id, *generation));
            if current {
                self.send_to_broker(ClientMessage::Signal {
                    peer_id: peer_id.clone(),
                    data: data.clone(),
                });
            }
            return;
        }

        let Some(manager) = self.peers.as_mut() else {
            return;
        };

        let notice = match event {
            Event::PeersChanged { peers, .. } => {
                self.context.peers = peers.clone();
                None
            }
            Event::Transport {
                event: TransportEvent::Received(msg),
                ..
            } => {
                match msg {
                    ServerMessage::NewPeer { peer_id, initiator } => {
                        if let Err(e) = manager.start_peer(peer_id, *initiator) {
                            tracing::warn!(peer_id = %peer_id, error = %e, "Could not start peer");
                        }
                    }
                    ServerMessage::Signal { peer_id, data } => {
                        manager.relay_remote_signal(peer_id, data.clone())
                    }
                    _ => {}
                }
                None
            }
            Event::Peer {
                peer_id,
                generation,
                event,
                ..
            } => manager.handle_event(peer_id, *generation, event.clone()),
            Event::Media(media) => {
                match media {
                    MediaEvent::UserAddStream(stream) => manager.add_user_stream(stream.clone()),
                    MediaEvent::UserAddTrack { stream_id, track } => {
                        manager.add_user_track(stream_id, track.clone())
                    }
                    MediaEvent::UserRemoveTrack {
                        stream_id,
                        track_id,
                    } => manager.remove_user_track(stream_id, track_id),
                    MediaEvent::UserAudioMuted { stream_id } => {
                        manager.set_audio_active(stream_id, false)
                    }
                    MediaEvent::UserAudioUnmuted { stream_id } => {
                        manager.set_audio_active(stream_id, true)
                    }
                    _ => {}
                }
                None
            }
            _ => None,
        };

        match notice {
            Some(PeerNotice::RemoteCast { peer_id, stream_id }) => {
                tracing::debug!(peer_id = %peer_id, stream_id = %stream_id, "Remote cast announced");
                self.raise(Internal::RemoteCast);
            }
            Some(PeerNotice::DataError { peer_id, error }) => {
                tracing::warn!(peer_id = %peer_id, error = %error, "Peer data error");
            }
            Some(PeerNotice::Error { peer_id, error }) => {
                tracing::error!(peer_id = %peer_id, error = %error, "Peer connection error");
            }
            None => {}
        }
    }

    // ==================== voice ====================

    fn voice_region(&mut self, event: &Event) {
        use VoiceActivity::{Idle, Releasing, Sending};

        match (self.regions.voice, event) {
            (
                VoiceState::NoPermission,
                Event::Media(MediaEvent::AudioGranted) | Event::VoiceStart,
            ) => {
                self.regions.voice = VoiceState::WaitingForMedia;
                self.media
                    .acquire(CaptureKind::Audio, Constraints::for_kind(CaptureKind::Audio));
            }
            (VoiceState::WaitingForMedia, Event::Media(MediaEvent::AcquiredAudio)) => {
                self.regions.voice = VoiceState::HasMedia(Idle);
            }
            (
                VoiceState::WaitingForMedia,
                Event::Media(MediaEvent::AcquireError {
                    kind: CaptureKind::Audio,
                    ..
                }),
            ) => {
                self.regions.voice = VoiceState::NoPermission;
            }
            (
                VoiceState::HasMedia(Idle),
                Event::VoiceStart | Event::SetTransmitMode(TransmitMode::Continuous),
            ) => self.enter_voice_sending(),
            (
                VoiceState::HasMedia(Sending),
                Event::VoiceStop | Event::SetTransmitMode(TransmitMode::Ptt),
            ) => self.enter_voice_releasing(),
            (VoiceState::HasMedia(Releasing), Event::VoiceStart) => {
                self.exit_voice_releasing();
                self.enter_voice_sending();
            }
            (VoiceState::HasMedia(Releasing), Event::VoiceReleaseElapsed { generation })
                if *generation == self.release_generation =>
            {
                self.exit_voice_releasing();
                self.regions.voice = VoiceState::HasMedia(Idle);
            }
            _ => {}
        }
    }

    fn enter_voice_sending(&mut self) {
        self.regions.voice = VoiceState::HasMedia(VoiceActivity::Sending);
        self.media.set_audio_muted(false);
    }

    fn enter_voice_releasing(&mut self) {
        self.regions.voice = VoiceState::HasMedia(VoiceActivity::Releasing);
        self.release_generation += 1;

        let generation = self.release_generation;
        let delay = self.config.release_delay();
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::VoiceReleaseElapsed { generation });
        });
        self.release_timer = Some(timer.abort_handle());
    }

    fn exit_voice_releasing(&mut self) {
        if let Some(timer) = self.release_timer.take() {
            timer.abort();
        }
        self.media.set_audio_muted(true);
    }

    // ==================== video ====================

    fn video_region(&mut self, event: &Event) {
        match (self.regions.video, event) {
            (VideoState::Idle, Event::VideoStart) => {
                self.regions.video = VideoState::WaitingForMedia;
                self.media
                    .acquire(CaptureKind::Video, Constraints::for_kind(CaptureKind::Video));
            }
            (VideoState::Idle, Event::Media(MediaEvent::AcquiredVideo)) => {
                // Camera arrived after the request was withdrawn.
                tracing::debug!("Releasing camera acquired after video stop");
                self.media.release(CaptureKind::Video);
            }
            (VideoState::WaitingForMedia, Event::Media(MediaEvent::AcquiredVideo)) => {
                self.regions.video = VideoState::Sending;
            }
            (
                VideoState::WaitingForMedia,
                Event::VideoStop
                | Event::Media(MediaEvent::AcquireError {
                    kind: CaptureKind::Video,
                    ..
                }),
            ) => {
                self.regions.video = VideoState::Idle;
            }
            (VideoState::Sending, Event::VideoStop) => {
                self.media.release(CaptureKind::Video);
                self.regions.video = VideoState::Idle;
            }
            _ => {}
        }
    }

    // ==================== cast ====================

    fn cast_region(&mut self, event: &Event) {
        match (self.regions.cast, event) {
            (CastState::Idle, Event::CastStart) => {
                if self.context.casting_tips_seen {
                    self.enter_cast_waiting();
                } else {
                    self.regions.cast = CastState::ShowingTips;
                }
            }
            (
                CastState::Idle | CastState::ShowingTips,
                Event::Media(MediaEvent::CastAddStream(stream)),
            ) => {
                tracing::debug!(stream_id = %stream.id, "Releasing cast acquired after cast stop");
                self.media.release(CaptureKind::Cast);
            }
            (CastState::ShowingTips, Event::DismissCastingTips) => {
                self.context.casting_tips_seen = true;
                self.enter_cast_waiting();
            }
            (CastState::ShowingTips, Event::CastStop) => self.regions.cast = CastState::Idle,
            (CastState::WaitingForMedia, Event::Media(MediaEvent::CastAddStream(stream))) => {
                if let Some(manager) = self.peers.as_mut() {
                    manager.add_cast_stream(stream.clone());
                }
                self.context.cast_stream = Some(stream.clone());
                self.regions.cast = CastState::Sending;
            }
            (
                CastState::WaitingForMedia,
                Event::CastStop
                | Event::Media(MediaEvent::AcquireError {
                    kind: CaptureKind::Cast,
                    ..
                }),
            ) => self.regions.cast = CastState::Idle,
            (CastState::Sending, Event::CastStop) => self.exit_cast_sending(),
            (CastState::Sending, Event::Media(MediaEvent::CastRemoveStream { stream_id })) => {
                if self
                    .context
                    .cast_stream
                    .as_ref()
                    .is_some_and(|s| &s.id == stream_id)
                {
                    self.exit_cast_sending();
                }
            }
            _ => {}
        }
    }

    fn enter_cast_waiting(&mut self) {
        self.regions.cast = CastState::WaitingForMedia;
        self.media
            .acquire(CaptureKind::Cast, Constraints::for_kind(CaptureKind::Cast));
    }

    fn exit_cast_sending(&mut self) {
        self.media.release(CaptureKind::Cast);
        if let Some(stream) = self.context.cast_stream.take() {
            if let Some(manager) = self.peers.as_mut() {
                manager.remove_cast_stream(&stream.id);
            }
        }
        self.regions.cast = CastState::Idle;
    }

    // ==================== shutdown ====================

    fn shutdown(&mut self) {
        tracing::info!("Shutting down call");
        if let Some(timer) = self.release_timer.take() {
            timer.abort();
        }
        if self.regions.video == VideoState::Sending {
            self.media.release(CaptureKind::Video);
        }
        if self.regions.cast == CastState::Sending {
            self.media.release(CaptureKind::Cast);
        }
        if matches!(self.regions.voice, VoiceState::HasMedia(_)) {
            self.media.release(CaptureKind::Audio);
        }
        self.stop_peers();
        self.stop_transport();
        self.set_connection(ConnectionState::Nowhere);
        self.stopped = true;
    }
}

fn log_event(event: &Event) {
    if event.is_error() {
        tracing::error!(event = event.name(), detail = ?event, "Call event");
    } else if event.is_chatty() {
        tracing::trace!(event = event.name(), "Call event");
    } else {
        tracing::debug!(event = event.name(), detail = ?event, "Call event");
    }
}
