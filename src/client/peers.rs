//! Peer connection manager: one link per remote participant.
//!
//! The manager owns every [`PeerLink`] it opens and publishes a full
//! [`PeerSnapshot`] after each mutation. Links report back through the event
//! queue tagged with the run and generation they were opened under, so events
//! from a replaced or stopped link are recognized and dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::AbortHandle;

use crate::client::control::{ControlError, ControlMessage, StreamKind};
use crate::client::events::{Event, EventSender, PeerEvent};
use crate::client::media::{MediaStream, MediaTrack};
use crate::client::sdp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Error,
}

/// What a remote participant has told us about one of its streams.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub stream: Option<MediaStream>,
    pub audio_only: bool,
    pub audio_active: bool,
    pub kind: Option<StreamKind>,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            stream: None,
            audio_only: true,
            audio_active: false,
            kind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub state: PeerState,
    pub streams: BTreeMap<String, StreamInfo>,
}

impl PeerInfo {
    fn with_state(state: PeerState) -> Self {
        Self {
            state,
            streams: BTreeMap::new(),
        }
    }
}

pub type PeerSnapshot = BTreeMap<String, PeerInfo>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("Data channel is not open")]
    ChannelClosed,
    #[error("Peer link is gone")]
    LinkClosed,
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Peer backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::Negotiation(err.to_string())
    }
}

impl From<ControlError> for PeerError {
    fn from(err: ControlError) -> Self {
        PeerError::Negotiation(err.to_string())
    }
}

/// A live connection to one remote participant.
pub trait PeerLink: Send {
    /// Feed a negotiation payload received from the remote side.
    fn signal(&mut self, data: Value) -> Result<(), PeerError>;
    /// Send text over the data channel. Fails when the channel is not open.
    fn send(&mut self, text: String) -> Result<(), PeerError>;
    fn add_stream(&mut self, stream: &MediaStream) -> Result<(), PeerError>;
    fn remove_stream(&mut self, stream: &MediaStream) -> Result<(), PeerError>;
    fn add_track(&mut self, track: &MediaTrack, stream: &MediaStream) -> Result<(), PeerError>;
    fn remove_track(&mut self, track: &MediaTrack, stream: &MediaStream) -> Result<(), PeerError>;
    fn destroy(&mut self);
}

pub struct PeerOptions {
    pub initiator: bool,
    pub streams: Vec<MediaStream>,
    /// Applied to every outbound session description.
    pub sdp_transform: fn(&str) -> String,
}

/// Routes one link's callbacks into the event queue.
#[derive(Clone)]
pub struct PeerEventSink {
    run: u64,
    peer_id: String,
    generation: u64,
    events: EventSender,
}

impl PeerEventSink {
    pub fn new(run: u64, peer_id: String, generation: u64, events: EventSender) -> Self {
        Self {
            run,
            peer_id,
            generation,
            events,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn emit(&self, event: PeerEvent) -> bool {
        self.events
            .send(Event::Peer {
                run: self.run,
                peer_id: self.peer_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

pub trait PeerFactory: Send + Sync {
    fn open(
        &self,
        peer_id: &str,
        options: PeerOptions,
        sink: PeerEventSink,
    ) -> Result<Box<dyn PeerLink>, PeerError>;
}

/// Something the orchestrator needs to act on after a peer event.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerNotice {
    RemoteCast { peer_id: String, stream_id: String },
    DataError { peer_id: String, error: String },
    Error { peer_id: String, error: String },
}

struct PeerEntry {
    generation: u64,
    link: Option<Box<dyn PeerLink>>,
    expiry: Option<AbortHandle>,
}

impl PeerEntry {
    fn cancel_expiry(&mut self) {
        if let Some(handle) = self.expiry.take() {
            handle.abort();
        }
    }

    fn destroy_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.destroy();
        }
    }
}

pub struct PeerConnectionManager {
    run: u64,
    factory: Arc<dyn PeerFactory>,
    events: EventSender,
    error_grace: Duration,
    entries: HashMap<String, PeerEntry>,
    snapshot: PeerSnapshot,
    next_generation: u64,
    user_stream: Option<MediaStream>,
    cast_stream: Option<MediaStream>,
    audio_active: bool,
}

impl PeerConnectionManager {
    pub fn new(
        run: u64,
        factory: Arc<dyn PeerFactory>,
        events: EventSender,
        error_grace: Duration,
    ) -> Self {
        Self {
            run,
            factory,
            events,
            error_grace,
            entries: HashMap::new(),
            snapshot: PeerSnapshot::new(),
            next_generation: 0,
            user_stream: None,
            cast_stream: None,
            audio_active: false,
        }
    }

    /// Seed local media known before the manager started.
    pub fn with_local_media(
        mut self,
        user_stream: Option<MediaStream>,
        cast_stream: Option<MediaStream>,
        audio_active: bool,
    ) -> Self {
        self.user_stream = user_stream;
        self.cast_stream = cast_stream;
        self.audio_active = audio_active;
        self
    }

    pub fn run(&self) -> u64 {
        self.run
    }

    pub fn snapshot(&self) -> &PeerSnapshot {
        &self.snapshot
    }

    pub fn peer_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether `generation` is the live link for `peer_id`.
    pub fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.entries.get(peer_id).map(|e| e.generation) == Some(generation)
    }

    fn state_of(&self, peer_id: &str) -> Option<PeerState> {
        self.snapshot.get(peer_id).map(|p| p.state)
    }

    fn publish(&self) {
        let event = Event::PeersChanged {
            run: self.run,
            peers: self.snapshot.clone(),
        };
        if self.events.send(event).is_err() {
            tracing::debug!("Event queue closed, dropping peer snapshot");
        }
    }

    /// Open a link to `peer_id` unless one is already connected.
    pub fn start_peer(&mut self, peer_id: &str, initiator: bool) -> Result<(), PeerError> {
        if self.state_of(peer_id) == Some(PeerState::Connected) {
            tracing::debug!(peer_id = %peer_id, "Peer already connected, keeping link");
            return Ok(());
        }

        if let Some(mut old) = self.entries.remove(peer_id) {
            tracing::debug!(peer_id = %peer_id, "Replacing unconnected peer link");
            old.cancel_expiry();
            old.destroy_link();
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        let options = PeerOptions {
            initiator,
            streams: self
                .user_stream
                .iter()
                .chain(self.cast_stream.iter())
                .cloned()
                .collect(),
            sdp_transform: sdp::force_stereo_opus,
        };
        let sink = PeerEventSink::new(self.run, peer_id.to_string(), generation, self.events.clone());

        tracing::info!(peer_id = %peer_id, initiator, generation, "Starting peer");

        match self.factory.open(peer_id, options, sink) {
            Ok(link) => {
                self.entries.insert(
                    peer_id.to_string(),
                    PeerEntry {
                        generation,
                        link: Some(link),
                        expiry: None,
                    },
                );
                self.snapshot
                    .insert(peer_id.to_string(), PeerInfo::with_state(PeerState::Connecting));
                self.publish();
                Ok(())
            }
            Err(e) => {
                tracing::error!(peer_id = %peer_id, error = %e, "Failed to open peer link");
                let expiry = self.schedule_expiry(peer_id, generation);
                self.entries.insert(
                    peer_id.to_string(),
                    PeerEntry {
                        generation,
                        link: None,
                        expiry: Some(expiry),
                    },
                );
                self.snapshot
                    .insert(peer_id.to_string(), PeerInfo::with_state(PeerState::Error));
                self.publish();
                Err(e)
            }
        }
    }

    /// Forward a remote negotiation payload to its link.
    pub fn relay_remote_signal(&mut self, peer_id: &str, data: Value) {
        let Some(link) = self.entries.get_mut(peer_id).and_then(|e| e.link.as_mut()) else {
            tracing::warn!(peer_id = %peer_id, "Signal for unknown peer, dropping");
            return;
        };

        if let Err(e) = link.signal(data) {
            tracing::warn!(peer_id = %peer_id, error = %e, "Failed to apply remote signal");
        }
    }

    /// Apply an event reported by a link. Events from replaced links are dropped.
    pub fn handle_event(
        &mut self,
        peer_id: &str,
        generation: u64,
        event: PeerEvent,
    ) -> Option<PeerNotice> {
        let current = self.entries.get(peer_id).map(|e| e.generation);
        if current != Some(generation) {
            tracing::debug!(peer_id = %peer_id, generation, "Dropping event from stale peer link");
            return None;
        }

        match event {
            PeerEvent::Signal(_) => None,
            PeerEvent::Connect => {
                tracing::info!(peer_id = %peer_id, "Peer connected");
                if let Some(info) = self.snapshot.get_mut(peer_id) {
                    info.state = PeerState::Connected;
                }
                self.announce_local_streams(peer_id);
                self.publish();
                None
            }
            PeerEvent::Data(text) => self.handle_control(peer_id, &text),
            PeerEvent::Track { stream_id, track } => {
                let info = self.stream_info_mut(peer_id, &stream_id);
                let stream = info
                    .stream
                    .get_or_insert_with(|| MediaStream::new(stream_id.clone()));
                stream.add_track(track);
                info.audio_only = stream.is_audio_only();
                self.publish();
                None
            }
            PeerEvent::TrackMuted {
                stream_id,
                track_id,
                muted,
            } => {
                let mut changed = false;
                if let Some(info) = self
                    .snapshot
                    .get_mut(peer_id)
                    .and_then(|p| p.streams.get_mut(&stream_id))
                {
                    if let Some(stream) = info.stream.as_mut() {
                        if stream.set_muted(&track_id, muted) {
                            info.audio_only = stream.is_audio_only();
                            changed = true;
                        }
                    }
                }
                if changed {
                    self.publish();
                }
                None
            }
            PeerEvent::TrackEnded {
                stream_id,
                track_id,
            } => {
                let Some(peer) = self.snapshot.get_mut(peer_id) else {
                    return None;
                };
                let Some(info) = peer.streams.get_mut(&stream_id) else {
                    return None;
                };
                let Some(stream) = info.stream.as_mut() else {
                    return None;
                };
                stream.remove_track(&track_id);
                if stream.is_empty() {
                    peer.streams.remove(&stream_id);
                } else {
                    info.audio_only = stream.is_audio_only();
                }
                self.publish();
                None
            }
            PeerEvent::Close => {
                self.handle_close(peer_id, generation);
                None
            }
            PeerEvent::Error(error) => {
                tracing::debug!(peer_id = %peer_id, error = %error, "Peer link reported error");
                if let Some(info) = self.snapshot.get_mut(peer_id) {
                    if info.state == PeerState::Connecting {
                        info.state = PeerState::Error;
                        self.publish();
                    }
                }
                Some(PeerNotice::Error {
                    peer_id: peer_id.to_string(),
                    error,
                })
            }
            PeerEvent::Expired => {
                let closed = self
                    .entries
                    .get(peer_id)
                    .is_some_and(|e| e.link.is_none());
                if closed {
                    tracing::debug!(peer_id = %peer_id, "Removing errored peer");
                    self.entries.remove(peer_id);
                    self.snapshot.remove(peer_id);
                    self.publish();
                }
                None
            }
        }
    }

    fn handle_close(&mut self, peer_id: &str, generation: u64) {
        let errored = self.state_of(peer_id) == Some(PeerState::Error);
        let expiry = errored.then(|| self.schedule_expiry(peer_id, generation));

        let Some(entry) = self.entries.get_mut(peer_id) else {
            return;
        };
        entry.destroy_link();

        if let Some(expiry) = expiry {
            // Errored peers stay visible for a grace period.
            tracing::info!(peer_id = %peer_id, "Errored peer closed");
            entry.cancel_expiry();
            entry.expiry = Some(expiry);
        } else {
            tracing::info!(peer_id = %peer_id, "Peer closed");
            self.entries.remove(peer_id);
            self.snapshot.remove(peer_id);
        }
        self.publish();
    }

    fn schedule_expiry(&self, peer_id: &str, generation: u64) -> AbortHandle {
        let sink = PeerEventSink::new(self.run, peer_id.to_string(), generation, self.events.clone());
        let grace = self.error_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            sink.emit(PeerEvent::Expired);
        })
        .abort_handle()
    }

    fn stream_info_mut(&mut self, peer_id: &str, stream_id: &str) -> &mut StreamInfo {
        self.snapshot
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerInfo::with_state(PeerState::New))
            .streams
            .entry(stream_id.to_string())
            .or_default()
    }

    fn handle_control(&mut self, peer_id: &str, text: &str) -> Option<PeerNotice> {
        let msg = match ControlMessage::decode(text) {
            Ok(Some(msg)) => msg,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(peer_id = %peer_id, error = %e, "Bad control message");
                return Some(PeerNotice::DataError {
                    peer_id: peer_id.to_string(),
                    error: e.to_string(),
                });
            }
        };

        match msg {
            ControlMessage::Stream { id, kind } => {
                self.stream_info_mut(peer_id, &id).kind = Some(kind);
                self.publish();
                (kind == StreamKind::Cast).then(|| PeerNotice::RemoteCast {
                    peer_id: peer_id.to_string(),
                    stream_id: id,
                })
            }
            ControlMessage::Activity { id, audio_active } => {
                self.stream_info_mut(peer_id, &id).audio_active = audio_active;
                self.publish();
                None
            }
        }
    }

    fn announce_local_streams(&mut self, peer_id: &str) {
        let mut messages = Vec::new();
        if let Some(stream) = &self.user_stream {
            messages.push(ControlMessage::Stream {
                id: stream.id.clone(),
                kind: StreamKind::User,
            });
            messages.push(ControlMessage::Activity {
                id: stream.id.clone(),
                audio_active: self.audio_active,
            });
        }
        if let Some(stream) = &self.cast_stream {
            messages.push(ControlMessage::Stream {
                id: stream.id.clone(),
                kind: StreamKind::Cast,
            });
        }

        let Some(link) = self.entries.get_mut(peer_id).and_then(|e| e.link.as_mut()) else {
            return;
        };
        for msg in messages {
            if let Err(e) = msg.encode().map_err(PeerError::from).and_then(|t| link.send(t)) {
                tracing::warn!(peer_id = %peer_id, error = %e, "Failed to announce stream");
            }
        }
    }

    /// Send a control message to every connected peer.
    fn broadcast(&mut self, msg: &ControlMessage) {
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode control message");
                return;
            }
        };

        for (peer_id, entry) in self.entries.iter_mut() {
            if self.snapshot.get(peer_id).map(|p| p.state) != Some(PeerState::Connected) {
                continue;
            }
            if let Some(link) = entry.link.as_mut() {
                if let Err(e) = link.send(text.clone()) {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Failed to send control message");
                }
            }
        }
    }

    /// Apply `op` to every live link, logging failures per peer.
    fn for_each_link<F>(&mut self, what: &str, mut op: F)
    where
        F: FnMut(&mut dyn PeerLink) -> Result<(), PeerError>,
    {
        for (peer_id, entry) in self.entries.iter_mut() {
            if let Some(link) = entry.link.as_mut() {
                if let Err(e) = op(&mut **link) {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Failed to {}", what);
                }
            }
        }
    }

    pub fn add_user_stream(&mut self, stream: MediaStream) {
        let msg = ControlMessage::Stream {
            id: stream.id.clone(),
            kind: StreamKind::User,
        };
        self.user_stream = Some(stream);
        self.broadcast(&msg);
    }

    pub fn add_user_track(&mut self, stream_id: &str, track: MediaTrack) {
        let stream = self
            .user_stream
            .get_or_insert_with(|| MediaStream::new(stream_id));
        stream.add_track(track.clone());
        let stream = stream.clone();
        self.for_each_link("add track", |link| link.add_track(&track, &stream));
    }

    pub fn remove_user_track(&mut self, stream_id: &str, track_id: &str) {
        let Some(stream) = self.user_stream.as_mut().filter(|s| s.id == stream_id) else {
            tracing::debug!(stream_id = %stream_id, "Removing track from unknown stream");
            return;
        };
        let Some(track) = stream.remove_track(track_id) else {
            return;
        };
        let stream = stream.clone();
        self.for_each_link("remove track", |link| link.remove_track(&track, &stream));
    }

    pub fn set_audio_active(&mut self, stream_id: &str, audio_active: bool) {
        self.audio_active = audio_active;
        self.broadcast(&ControlMessage::Activity {
            id: stream_id.to_string(),
            audio_active,
        });
    }

    pub fn add_cast_stream(&mut self, stream: MediaStream) {
        self.broadcast(&ControlMessage::Stream {
            id: stream.id.clone(),
            kind: StreamKind::Cast,
        });
        self.for_each_link("add cast stream", |link| link.add_stream(&stream));
        self.cast_stream = Some(stream);
    }

    pub fn remove_cast_stream(&mut self, stream_id: &str) {
        let Some(stream) = self.cast_stream.take() else {
            return;
        };
        if stream.id != stream_id {
            tracing::debug!(stream_id = %stream_id, "Ignoring removal of stale cast stream");
            self.cast_stream = Some(stream);
            return;
        }
        self.for_each_link("remove cast stream", |link| link.remove_stream(&stream));
    }

    /// Tear down every link and pending expiry.
    pub fn stop(mut self) {
        tracing::info!(peers = self.entries.len(), "Stopping peer connections");
        for (_, mut entry) in self.entries.drain() {
            entry.cancel_expiry();
            entry.destroy_link();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeFactory, LinkCall};
    use pretty_assertions::assert_eq;
    use super::*;
    use crate::client::events::{self, EventReceiver};
    use crate::client::media::TrackKind;

    fn manager() -> (PeerConnectionManager, FakeFactory, EventReceiver) {
        let factory = FakeFactory::default();
        let (tx, rx) = events::channel();
        let manager = PeerConnectionManager::new(
            1,
            Arc::new(factory.clone()),
            tx,
            Duration::from_millis(3000),
        );
        (manager, factory, rx)
    }

    fn last_snapshot(rx: &mut EventReceiver) -> Option<PeerSnapshot> {
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let Event::PeersChanged { peers, .. } = event {
                last = Some(peers);
            }
        }
        last
    }

    fn connect(manager: &mut PeerConnectionManager, peer_id: &str) -> u64 {
        manager.start_peer(peer_id, true).unwrap();
        let generation = manager.entries[peer_id].generation;
        manager.handle_event(peer_id, generation, PeerEvent::Connect);
        generation
    }

    #[tokio::test]
    async fn test_start_peer_publishes_connecting() {
        let (mut manager, factory, mut rx) = manager();
        manager.start_peer("B1", false).unwrap();

        let snapshot = last_snapshot(&mut rx).unwrap();
        assert_eq!(snapshot["B1"].state, PeerState::Connecting);
        assert_eq!(factory.opened_count(), 1);
        assert!(!factory.recorded.lock().unwrap().opened[0].1);
    }

    #[tokio::test]
    async fn test_start_peer_keeps_connected_link() {
        let (mut manager, factory, _rx) = manager();
        connect(&mut manager, "B1");

        manager.start_peer("B1", true).unwrap();
        assert_eq!(factory.opened_count(), 1);
        assert!(!factory.calls_for("B1").contains(&LinkCall::Destroy));
    }

    #[tokio::test]
    async fn test_start_peer_replaces_unconnected_link() {
        let (mut manager, factory, _rx) = manager();
        manager.start_peer("B1", true).unwrap();
        let first = manager.entries["B1"].generation;

        manager.start_peer("B1", false).unwrap();
        let second = manager.entries["B1"].generation;

        assert_ne!(first, second);
        assert_eq!(factory.opened_count(), 2);
        assert!(factory.calls_for("B1").contains(&LinkCall::Destroy));

        // The replaced link can no longer move the peer forward.
        manager.handle_event("B1", first, PeerEvent::Connect);
        assert_eq!(manager.snapshot()["B1"].state, PeerState::Connecting);
    }

    #[tokio::test]
    async fn test_connect_announces_local_streams() {
        let (manager, factory, _rx) = manager();
        let mut manager = manager.with_local_media(
            Some(MediaStream::new("u1")),
            Some(MediaStream::new("c1")),
            true,
        );
        connect(&mut manager, "B1");

        assert_eq!(
            factory.sent_to("B1"),
            vec![
                ControlMessage::Stream {
                    id: "u1".into(),
                    kind: StreamKind::User
                },
                ControlMessage::Activity {
                    id: "u1".into(),
                    audio_active: true
                },
                ControlMessage::Stream {
                    id: "c1".into(),
                    kind: StreamKind::Cast
                },
            ]
        );
        let recorded = factory.recorded.lock().unwrap();
        assert_eq!(recorded.opened[0].3, vec!["u1".to_string(), "c1".to_string()]);
    }

    #[tokio::test]
    async fn test_control_messages_update_stream_info() {
        let (mut manager, _factory, _rx) = manager();
        let generation = connect(&mut manager, "B1");

        let notice = manager.handle_event(
            "B1",
            generation,
            PeerEvent::Data(r#"{"type":"activity","id":"s1","audioActive":true}"#.into()),
        );
        assert_eq!(notice, None);
        assert!(manager.snapshot()["B1"].streams["s1"].audio_active);
        assert!(manager.snapshot()["B1"].streams["s1"].audio_only);

        let notice = manager.handle_event(
            "B1",
            generation,
            PeerEvent::Data(r#"{"type":"stream","id":"s2","kind":"cast"}"#.into()),
        );
        assert_eq!(
            notice,
            Some(PeerNotice::RemoteCast {
                peer_id: "B1".into(),
                stream_id: "s2".into()
            })
        );
        assert_eq!(manager.snapshot()["B1"].streams["s2"].kind, Some(StreamKind::Cast));
    }

    #[tokio::test]
    async fn test_malformed_control_reports_data_error() {
        let (mut manager, _factory, _rx) = manager();
        let generation = connect(&mut manager, "B1");

        let notice = manager.handle_event("B1", generation, PeerEvent::Data("{oops".into()));
        assert!(matches!(notice, Some(PeerNotice::DataError { .. })));

        let notice = manager.handle_event(
            "B1",
            generation,
            PeerEvent::Data(r#"{"type":"wave"}"#.into()),
        );
        assert_eq!(notice, None);
    }

    #[tokio::test]
    async fn test_tracks_drive_audio_only_and_stream_removal() {
        let (mut manager, _factory, _rx) = manager();
        let generation = connect(&mut manager, "B1");

        manager.handle_event(
            "B1",
            generation,
            PeerEvent::Track {
                stream_id: "s1".into(),
                track: MediaTrack::new("a1", TrackKind::Audio),
            },
        );
        manager.handle_event(
            "B1",
            generation,
            PeerEvent::Track {
                stream_id: "s1".into(),
                track: MediaTrack::new("v1", TrackKind::Video),
            },
        );
        assert!(!manager.snapshot()["B1"].streams["s1"].audio_only);

        manager.handle_event(
            "B1",
            generation,
            PeerEvent::TrackMuted {
                stream_id: "s1".into(),
                track_id: "v1".into(),
                muted: true,
            },
        );
        assert!(manager.snapshot()["B1"].streams["s1"].audio_only);

        for track_id in ["v1", "a1"] {
            manager.handle_event(
                "B1",
                generation,
                PeerEvent::TrackEnded {
                    stream_id: "s1".into(),
                    track_id: track_id.into(),
                },
            );
        }
        assert!(!manager.snapshot()["B1"].streams.contains_key("s1"));
    }

    #[tokio::test]
    async fn test_close_removes_healthy_peer() {
        let (mut manager, factory, mut rx) = manager();
        let generation = connect(&mut manager, "B1");

        manager.handle_event("B1", generation, PeerEvent::Close);

        assert!(manager.snapshot().is_empty());
        assert_eq!(manager.peer_count(), 0);
        assert!(factory.calls_for("B1").contains(&LinkCall::Destroy));
        assert!(last_snapshot(&mut rx).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errored_peer_lingers_then_expires() {
        let (mut manager, _factory, mut rx) = manager();
        manager.start_peer("B1", true).unwrap();
        let generation = manager.entries["B1"].generation;

        let notice = manager.handle_event("B1", generation, PeerEvent::Error("ice failed".into()));
        assert!(matches!(notice, Some(PeerNotice::Error { .. })));
        manager.handle_event("B1", generation, PeerEvent::Close);
        assert_eq!(manager.snapshot()["B1"].state, PeerState::Error);

        tokio::time::sleep(Duration::from_millis(3100)).await;

        let mut expired = None;
        while let Ok(event) = rx.try_recv() {
            if let Event::Peer {
                peer_id,
                generation,
                event: PeerEvent::Expired,
                ..
            } = event
            {
                expired = Some((peer_id, generation));
            }
        }
        let (peer_id, expired_generation) = expired.expect("expiry event");
        manager.handle_event(&peer_id, expired_generation, PeerEvent::Expired);
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_cancels_error_grace() {
        let (mut manager, _factory, mut rx) = manager();
        manager.start_peer("B1", true).unwrap();
        let first = manager.entries["B1"].generation;
        manager.handle_event("B1", first, PeerEvent::Error("boom".into()));
        manager.handle_event("B1", first, PeerEvent::Close);

        manager.start_peer("B1", true).unwrap();
        tokio::time::sleep(Duration::from_millis(3100)).await;

        let expired = std::iter::from_fn(|| rx.try_recv().ok()).any(|e| {
            matches!(
                e,
                Event::Peer {
                    event: PeerEvent::Expired,
                    ..
                }
            )
        });
        assert!(!expired);
        assert_eq!(manager.snapshot()["B1"].state, PeerState::Connecting);
    }

    #[tokio::test]
    async fn test_error_after_connect_keeps_state() {
        let (mut manager, _factory, _rx) = manager();
        let generation = connect(&mut manager, "B1");

        manager.handle_event("B1", generation, PeerEvent::Error("glitch".into()));
        assert_eq!(manager.snapshot()["B1"].state, PeerState::Connected);
    }

    #[tokio::test]
    async fn test_signal_for_unknown_peer_is_dropped() {
        let (mut manager, factory, _rx) = manager();
        manager.relay_remote_signal("ghost", serde_json::json!({"type": "offer"}));
        assert!(factory.calls_for("ghost").is_empty());

        manager.start_peer("B1", false).unwrap();
        manager.relay_remote_signal("B1", serde_json::json!({"type": "offer", "sdp": "v=0"}));
        assert_eq!(
            factory.calls_for("B1"),
            vec![LinkCall::Signal(serde_json::json!({"type": "offer", "sdp": "v=0"}))]
        );
    }

    #[tokio::test]
    async fn test_fan_out_reaches_peers_by_state() {
        let (mut manager, factory, _rx) = manager();
        connect(&mut manager, "B1");
        manager.start_peer("C1", true).unwrap();

        manager.add_user_stream(MediaStream::new("u1"));
        manager.add_user_track("u1", MediaTrack::new("a1", TrackKind::Audio));
        manager.set_audio_active("u1", true);
        manager.add_cast_stream(MediaStream::new("c1"));

        // Control messages only reach connected peers, media reaches every link.
        assert_eq!(factory.sent_to("C1"), vec![]);
        assert_eq!(factory.sent_to("B1").len(), 3);
        for peer in ["B1", "C1"] {
            let calls = factory.calls_for(peer);
            assert!(calls.contains(&LinkCall::AddTrack("a1".into())));
            assert!(calls.contains(&LinkCall::AddStream("c1".into())));
        }

        manager.remove_user_track("u1", "a1");
        manager.remove_cast_stream("c1");
        for peer in ["B1", "C1"] {
            let calls = factory.calls_for(peer);
            assert!(calls.contains(&LinkCall::RemoveTrack("a1".into())));
            assert!(calls.contains(&LinkCall::RemoveStream("c1".into())));
        }
    }

    #[tokio::test]
    async fn test_send_failures_do_not_stop_fan_out() {
        let (mut manager, factory, _rx) = manager();
        connect(&mut manager, "B1");
        connect(&mut manager, "C1");
        factory.recorded.lock().unwrap().closed_channels = true;

        manager.set_audio_active("u1", true);
        manager.add_cast_stream(MediaStream::new("c1"));

        for peer in ["B1", "C1"] {
            assert!(factory.calls_for(peer).contains(&LinkCall::AddStream("c1".into())));
        }
    }

    #[tokio::test]
    async fn test_failed_open_marks_error() {
        let (mut manager, factory, _rx) = manager();
        factory.recorded.lock().unwrap().fail_open = true;

        assert!(manager.start_peer("B1", true).is_err());
        assert_eq!(manager.snapshot()["B1"].state, PeerState::Error);
    }

    #[tokio::test]
    async fn test_stop_destroys_every_link() {
        let (mut manager, factory, _rx) = manager();
        connect(&mut manager, "B1");
        manager.start_peer("C1", false).unwrap();

        manager.stop();
        for peer in ["B1", "C1"] {
            assert!(factory.calls_for(peer).contains(&LinkCall::Destroy));
        }
    }
}
