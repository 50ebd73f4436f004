//! Peer links backed by webrtc-rs.
//!
//! Each link runs as its own task that owns the `RTCPeerConnection`; the
//! [`PeerLink`] handed to the manager only queues commands for it. Negotiation
//! payloads use the JSON shapes browser peers exchange:
//! `{"type":"offer"|"answer","sdp":..}`, `{"type":"candidate","candidate":{..}}`
//! and `{"type":"renegotiate"}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::client::events::PeerEvent;
use crate::client::media::{MediaStream, MediaTrack, TrackKind, TrackSource};
use crate::client::peers::{PeerError, PeerEventSink, PeerFactory, PeerLink, PeerOptions};
use crate::config::ClientConfig;

const CONTROL_CHANNEL: &str = "control";

/// A remote track that delivers no RTP for this long is reported muted.
const REMOTE_TRACK_IDLE: Duration = Duration::from_secs(2);

impl From<webrtc::Error> for PeerError {
    fn from(err: webrtc::Error) -> Self {
        PeerError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        }
    }
}

/// Negotiation payload relayed through the broker's `signal` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalData {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
    Renegotiate,
}

impl SignalData {
    fn to_value(&self) -> Result<Value, PeerError> {
        Ok(serde_json::to_value(self)?)
    }
}

pub struct WebRtcPeerFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(config: &ClientConfig) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = vec![RTCIceServer {
            urls: vec![config.stun_server.clone()],
            ..Default::default()
        }];

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }
}

impl PeerFactory for WebRtcPeerFactory {
    fn open(
        &self,
        peer_id: &str,
        options: PeerOptions,
        sink: PeerEventSink,
    ) -> Result<Box<dyn PeerLink>, PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel_open = Arc::new(AtomicBool::new(false));
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        tracing::debug!(peer_id = %peer_id, initiator = options.initiator, "Opening WebRTC peer");

        tokio::spawn(run_peer(
            self.api.clone(),
            config,
            options,
            sink,
            tx.clone(),
            rx,
            channel_open.clone(),
        ));

        Ok(Box::new(WebRtcPeer {
            commands: tx,
            channel_open,
        }))
    }
}

enum PeerCommand {
    Signal(Value),
    Send(String),
    AddStream(MediaStream),
    RemoveStream(MediaStream),
    AddTrack(MediaTrack),
    RemoveTrack(MediaTrack),
    Renegotiate,
    Destroy,
}

struct WebRtcPeer {
    commands: mpsc::UnboundedSender<PeerCommand>,
    channel_open: Arc<AtomicBool>,
}

impl WebRtcPeer {
    fn queue(&self, command: PeerCommand) -> Result<(), PeerError> {
        self.commands
            .send(command)
            .map_err(|_| PeerError::LinkClosed)
    }
}

impl PeerLink for WebRtcPeer {
    fn signal(&mut self, data: Value) -> Result<(), PeerError> {
        self.queue(PeerCommand::Signal(data))
    }

    fn send(&mut self, text: String) -> Result<(), PeerError> {
        if !self.channel_open.load(Ordering::SeqCst) {
            return Err(PeerError::ChannelClosed);
        }
        self.queue(PeerCommand::Send(text))
    }

    fn add_stream(&mut self, stream: &MediaStream) -> Result<(), PeerError> {
        self.queue(PeerCommand::AddStream(stream.clone()))
    }

    fn remove_stream(&mut self, stream: &MediaStream) -> Result<(), PeerError> {
        self.queue(PeerCommand::RemoveStream(stream.clone()))
    }

    fn add_track(&mut self, track: &MediaTrack, _stream: &MediaStream) -> Result<(), PeerError> {
        self.queue(PeerCommand::AddTrack(track.clone()))
    }

    fn remove_track(&mut self, track: &MediaTrack, _stream: &MediaStream) -> Result<(), PeerError> {
        self.queue(PeerCommand::RemoveTrack(track.clone()))
    }

    fn destroy(&mut self) {
        self.channel_open.store(false, Ordering::SeqCst);
        let _ = self.commands.send(PeerCommand::Destroy);
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        let _ = self.commands.send(PeerCommand::Destroy);
    }
}

async fn run_peer(
    api: Arc<API>,
    config: RTCConfiguration,
    options: PeerOptions,
    sink: PeerEventSink,
    commands_tx: mpsc::UnboundedSender<PeerCommand>,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    channel_open: Arc<AtomicBool>,
) {
    let mut session =
        match PeerSession::open(&api, config, options, sink.clone(), commands_tx, channel_open)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(peer_id = %sink.peer_id(), error = %e, "Failed to set up peer connection");
                sink.emit(PeerEvent::Error(e.to_string()));
                sink.emit(PeerEvent::Close);
                return;
            }
        };

    while let Some(command) = commands.recv().await {
        let result = match command {
            PeerCommand::Destroy => break,
            PeerCommand::Signal(data) => session.apply_signal(data).await,
            PeerCommand::Send(text) => {
                session.send_text(text).await;
                Ok(())
            }
            PeerCommand::AddStream(stream) => session.add_stream(&stream).await,
            PeerCommand::RemoveStream(stream) => session.remove_stream(&stream).await,
            PeerCommand::AddTrack(track) => session.add_local_track(&track).await,
            PeerCommand::RemoveTrack(track) => session.remove_local_track(&track.id).await,
            PeerCommand::Renegotiate => session.renegotiate().await,
        };

        if let Err(e) = result {
            tracing::warn!(peer_id = %sink.peer_id(), error = %e, "Peer command failed");
            sink.emit(PeerEvent::Error(e.to_string()));
        }
    }

    session.close().await;
}

/// State owned by one link's task.
struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    initiator: bool,
    sink: PeerEventSink,
    sdp_transform: fn(&str) -> String,
    control: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    senders: HashMap<String, Arc<RTCRtpSender>>,
    pending_candidates: Vec<RTCIceCandidateInit>,
    negotiation: Negotiation,
}

impl PeerSession {
    async fn open(
        api: &API,
        config: RTCConfiguration,
        options: PeerOptions,
        sink: PeerEventSink,
        commands: mpsc::UnboundedSender<PeerCommand>,
        channel_open: Arc<AtomicBool>,
    ) -> Result<Self, PeerError> {
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let closed = Arc::new(AtomicBool::new(false));
        let control: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let signal = candidate
                    .to_json()
                    .map_err(PeerError::from)
                    .and_then(|init| {
                        SignalData::Candidate {
                            candidate: init.into(),
                        }
                        .to_value()
                    });
                match signal {
                    Ok(value) => {
                        sink.emit(PeerEvent::Signal(value));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode ICE candidate"),
                }
            })
        }));

        let state_sink = sink.clone();
        let state_closed = closed.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            tracing::debug!(peer_id = %state_sink.peer_id(), state = ?state, "Peer connection state changed");
            let sink = state_sink.clone();
            let closed = state_closed.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed => {
                        sink.emit(PeerEvent::Error("peer connection failed".to_string()));
                        if !closed.swap(true, Ordering::SeqCst) {
                            sink.emit(PeerEvent::Close);
                        }
                    }
                    RTCPeerConnectionState::Closed => {
                        if !closed.swap(true, Ordering::SeqCst) {
                            sink.emit(PeerEvent::Close);
                        }
                    }
                    _ => {}
                }
            })
        }));

        let track_sink = sink.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = track_sink.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let stream_id = track.stream_id();
                let track_id = track.id();

                tracing::info!(
                    peer_id = %sink.peer_id(),
                    stream_id = %stream_id,
                    kind = ?kind,
                    codec = %track.codec().capability.mime_type,
                    "Received remote track"
                );

                sink.emit(PeerEvent::Track {
                    stream_id: stream_id.clone(),
                    track: MediaTrack::remote(track_id.clone(), kind, track.clone()),
                });

                let (packets_tx, packets_rx) = mpsc::channel(1);
                tokio::spawn(watch_remote_track(
                    packets_rx,
                    REMOTE_TRACK_IDLE,
                    sink,
                    stream_id,
                    track_id,
                ));

                // Drain RTP until the remote side stops sending.
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {
                        // A full slot already marks the track live.
                        let _ = packets_tx.try_send(());
                    }
                });
            })
        }));

        let negotiation = commands.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let commands = negotiation.clone();
            Box::pin(async move {
                let _ = commands.send(PeerCommand::Renegotiate);
            })
        }));

        let remote_control = control.clone();
        let remote_sink = sink.clone();
        let remote_open = channel_open.clone();
        let remote_closed = closed.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let control = remote_control.clone();
            let sink = remote_sink.clone();
            let open = remote_open.clone();
            let closed = remote_closed.clone();
            Box::pin(async move {
                if dc.label() != CONTROL_CHANNEL {
                    tracing::debug!(label = %dc.label(), "Ignoring unexpected data channel");
                    return;
                }
                wire_control(&dc, &sink, open, closed);
                *control.lock().await = Some(dc);
            })
        }));

        let mut session = Self {
            pc,
            initiator: options.initiator,
            sink,
            sdp_transform: options.sdp_transform,
            control,
            senders: HashMap::new(),
            pending_candidates: Vec::new(),
            negotiation: Negotiation::new(options.initiator),
        };

        for stream in &options.streams {
            session.add_stream(stream).await?;
        }

        if session.initiator {
            session.add_receive_transceivers(&options.streams).await?;

            let dc = session.pc.create_data_channel(CONTROL_CHANNEL, None).await?;
            wire_control(&dc, &session.sink, channel_open, closed);
            *session.control.lock().await = Some(dc);

            session.make_offer().await?;
        }

        Ok(session)
    }

    /// Make sure the initial offer can receive both kinds even without local media.
    async fn add_receive_transceivers(&self, streams: &[MediaStream]) -> Result<(), PeerError> {
        let has_local = |kind: TrackKind| {
            streams
                .iter()
                .flat_map(|s| s.tracks.iter())
                .any(|t| t.kind == kind && matches!(t.source, TrackSource::Local(_)))
        };

        for (kind, codec_type) in [
            (TrackKind::Audio, RTPCodecType::Audio),
            (TrackKind::Video, RTPCodecType::Video),
        ] {
            if has_local(kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    codec_type,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        Ok(())
    }

    fn send_signal(&self, data: SignalData) -> Result<(), PeerError> {
        self.sink.emit(PeerEvent::Signal(data.to_value()?));
        Ok(())
    }

    fn is_stable(&self) -> bool {
        self.pc.signaling_state() == RTCSignalingState::Stable
    }

    async fn make_offer(&mut self) -> Result<(), PeerError> {
        if !self.is_stable() {
            tracing::debug!(peer_id = %self.sink.peer_id(), "Negotiation in progress, deferring offer");
            self.negotiation.pending = true;
            return Ok(());
        }

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.send_signal(SignalData::Offer {
            sdp: (self.sdp_transform)(&offer.sdp),
        })
    }

    async fn take_step(&mut self, step: NegotiationStep) -> Result<(), PeerError> {
        match step {
            NegotiationStep::Offer => self.make_offer().await,
            NegotiationStep::RequestOffer => self.send_signal(SignalData::Renegotiate),
            NegotiationStep::Wait => {
                tracing::debug!(peer_id = %self.sink.peer_id(), "Renegotiation deferred until stable");
                Ok(())
            }
        }
    }

    async fn renegotiate(&mut self) -> Result<(), PeerError> {
        let step = self.negotiation.request(self.is_stable());
        self.take_step(step).await
    }

    async fn apply_signal(&mut self, data: Value) -> Result<(), PeerError> {
        let data: SignalData = serde_json::from_value(data)?;

        match data {
            SignalData::Offer { sdp } => {
                self.pc
                    .set_remote_description(RTCSessionDescription::offer(sdp)?)
                    .await?;
                self.remote_description_applied().await?;

                let answer = self.pc.create_answer(None).await?;
                self.pc.set_local_description(answer.clone()).await?;
                self.send_signal(SignalData::Answer {
                    sdp: (self.sdp_transform)(&answer.sdp),
                })?;

                let step = self.negotiation.settled();
                self.take_step(step).await?;
            }
            SignalData::Answer { sdp } => {
                self.pc
                    .set_remote_description(RTCSessionDescription::answer(sdp)?)
                    .await?;
                self.remote_description_applied().await?;

                let step = self.negotiation.settled();
                self.take_step(step).await?;
            }
            SignalData::Candidate { candidate } => {
                let init = RTCIceCandidateInit::from(candidate);
                if self.negotiation.has_remote_description {
                    self.pc.add_ice_candidate(init).await?;
                } else {
                    self.pending_candidates.push(init);
                }
            }
            SignalData::Renegotiate => {
                if self.initiator {
                    let step = self.negotiation.request(self.is_stable());
                    self.take_step(step).await?;
                }
            }
        }
        Ok(())
    }

    async fn remote_description_applied(&mut self) -> Result<(), PeerError> {
        self.negotiation.has_remote_description = true;
        for init in std::mem::take(&mut self.pending_candidates) {
            self.pc.add_ice_candidate(init).await?;
        }
        Ok(())
    }

    async fn send_text(&self, text: String) {
        let channel = self.control.lock().await.clone();
        let Some(channel) = channel else {
            tracing::warn!(peer_id = %self.sink.peer_id(), "No control channel, dropping message");
            return;
        };
        if let Err(e) = channel.send_text(text).await {
            tracing::warn!(peer_id = %self.sink.peer_id(), error = %e, "Failed to send control message");
        }
    }

    async fn add_stream(&mut self, stream: &MediaStream) -> Result<(), PeerError> {
        for track in &stream.tracks {
            self.add_local_track(track).await?;
        }
        Ok(())
    }

    async fn remove_stream(&mut self, stream: &MediaStream) -> Result<(), PeerError> {
        for track in &stream.tracks {
            self.remove_local_track(&track.id).await?;
        }
        Ok(())
    }

    async fn add_local_track(&mut self, track: &MediaTrack) -> Result<(), PeerError> {
        let TrackSource::Local(local) = &track.source else {
            tracing::debug!(track_id = %track.id, "Track has no local source, not sending");
            return Ok(());
        };
        if self.senders.contains_key(&track.id) {
            return Ok(());
        }

        let rtp_sender = self.pc.add_track(Arc::clone(local)).await?;

        // Handle RTCP packets
        let reader = rtp_sender.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = reader.read(&mut rtcp_buf).await {}
        });

        self.senders.insert(track.id.clone(), rtp_sender);
        Ok(())
    }

    async fn remove_local_track(&mut self, track_id: &str) -> Result<(), PeerError> {
        if let Some(sender) = self.senders.remove(track_id) {
            self.pc.remove_track(&sender).await?;
        }
        Ok(())
    }

    async fn close(self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!(peer_id = %self.sink.peer_id(), error = %e, "Error closing peer connection");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationStep {
    Offer,
    /// Ask the initiating side for a fresh offer.
    RequestOffer,
    Wait,
}

/// Offer/answer bookkeeping for one link.
///
/// Only the initiator ever offers. A renegotiation requested before the first
/// exchange completes, or while an exchange is in flight, is remembered and
/// carried out once the link is stable again.
#[derive(Debug)]
struct Negotiation {
    initiator: bool,
    has_remote_description: bool,
    pending: bool,
}

impl Negotiation {
    fn new(initiator: bool) -> Self {
        Self {
            initiator,
            has_remote_description: false,
            pending: false,
        }
    }

    fn request(&mut self, stable: bool) -> NegotiationStep {
        if !self.has_remote_description || !stable {
            self.pending = true;
            return NegotiationStep::Wait;
        }
        self.next_step()
    }

    /// An offer/answer exchange just completed.
    fn settled(&mut self) -> NegotiationStep {
        if std::mem::take(&mut self.pending) {
            self.next_step()
        } else {
            NegotiationStep::Wait
        }
    }

    fn next_step(&self) -> NegotiationStep {
        if self.initiator {
            NegotiationStep::Offer
        } else {
            NegotiationStep::RequestOffer
        }
    }
}

/// Report a remote track muted when its RTP stops flowing, live again when it
/// resumes, and ended once the reader gives up.
async fn watch_remote_track(
    mut packets: mpsc::Receiver<()>,
    idle_after: Duration,
    sink: PeerEventSink,
    stream_id: String,
    track_id: String,
) {
    let mut muted = false;
    loop {
        let live = match tokio::time::timeout(idle_after, packets.recv()).await {
            Ok(Some(())) => true,
            Ok(None) => break,
            Err(_) => false,
        };
        if live == muted {
            muted = !live;
            tracing::debug!(peer_id = %sink.peer_id(), track_id = %track_id, muted, "Remote track activity changed");
            sink.emit(PeerEvent::TrackMuted {
                stream_id: stream_id.clone(),
                track_id: track_id.clone(),
                muted,
            });
        }
    }
    sink.emit(PeerEvent::TrackEnded {
        stream_id,
        track_id,
    });
}

fn wire_control(
    dc: &Arc<RTCDataChannel>,
    sink: &PeerEventSink,
    open: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
) {
    let open_sink = sink.clone();
    let open_flag = open.clone();
    dc.on_open(Box::new(move || {
        let sink = open_sink.clone();
        let open = open_flag.clone();
        Box::pin(async move {
            open.store(true, Ordering::SeqCst);
            sink.emit(PeerEvent::Connect);
        })
    }));

    let message_sink = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = message_sink.clone();
        Box::pin(async move {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            sink.emit(PeerEvent::Data(text));
        })
    }));

    let close_sink = sink.clone();
    dc.on_close(Box::new(move || {
        let sink = close_sink.clone();
        let open = open.clone();
        let closed = closed.clone();
        Box::pin(async move {
            open.store(false, Ordering::SeqCst);
            if !closed.swap(true, Ordering::SeqCst) {
                sink.emit(PeerEvent::Close);
            }
        })
    }));
}
