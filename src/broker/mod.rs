//! Session broker: in-memory session and room registries.
//!
//! Membership changes and their notification fan-out happen while holding the
//! room registry lock, so a joiner's `joined` always follows every `new_peer`
//! notice produced by the same join.

pub mod room;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::error::ProtocolError;
use crate::security::{new_identifier, SessionKeys, ROOM_ID_BYTES, SESSION_ID_BYTES};
use crate::ws::{ClientHandle, ClientMessage, Credentials, ServerMessage, WsSessionState};

pub use room::{valid_room_id, Room, MIN_ROOM_ID_LEN};

/// Where a create/join request should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    /// A freshly generated room.
    Create,
    /// A named room, created implicitly when absent.
    Room(String),
}

/// A resumable participant identity
#[derive(Debug)]
struct SessionEntry {
    /// Live transport, `None` while waiting to expire.
    conn: Option<ClientHandle>,
    room_id: Option<String>,
    expiry: Option<AbortHandle>,
    expiry_epoch: u64,
}

impl SessionEntry {
    fn is_owned_by(&self, conn_id: &str) -> bool {
        self.conn.as_ref().is_some_and(|c| c.conn_id == conn_id)
    }

    fn cancel_expiry(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
        self.expiry_epoch += 1;
    }
}

pub struct Broker {
    keys: SessionKeys,
    session_expiry: Duration,
    sessions: DashMap<String, SessionEntry>,
    rooms: Mutex<HashMap<String, Room>>,
}

impl Broker {
    pub fn new(keys: SessionKeys, session_expiry: Duration) -> Self {
        Self {
            keys,
            session_expiry,
            sessions: DashMap::new(),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Route one decoded client request.
    pub async fn handle(
        self: &Arc<Self>,
        conn: &mut WsSessionState,
        msg: ClientMessage,
    ) -> Result<(), ProtocolError> {
        let credentials = msg.credentials();
        match msg {
            ClientMessage::Create { .. } => self.join(conn, JoinTarget::Create, credentials).await,
            ClientMessage::Join { room_id, .. } => {
                self.join(conn, JoinTarget::Room(room_id), credentials).await
            }
            ClientMessage::Signal { peer_id, data } => self.signal(conn, &peer_id, data).await,
        }
    }

    /// Handle `create` and `join`.
    pub async fn join(
        &self,
        conn: &mut WsSessionState,
        target: JoinTarget,
        credentials: Option<Credentials>,
    ) -> Result<(), ProtocolError> {
        if conn.is_in_room() {
            return Err(ProtocolError::AlreadyInRoom);
        }
        if let JoinTarget::Room(room_id) = &target {
            if !valid_room_id(room_id) {
                return Err(ProtocolError::InvalidRoomId);
            }
        }

        let mut rooms = self.rooms.lock().await;
        let identity = self.claim_identity(conn, credentials, &mut rooms);
        let session_id = identity.session_id.clone();

        let room_id = match target {
            JoinTarget::Create => loop {
                let candidate = new_identifier(ROOM_ID_BYTES);
                if !rooms.contains_key(&candidate) {
                    break candidate;
                }
            },
            JoinTarget::Room(room_id) => room_id,
        };

        let room = rooms
            .entry(room_id.clone())
            .or_insert_with(|| Room::new(room_id.clone()));
        room.add_member(session_id.clone());
        let member_count = room.member_count();

        let others: Vec<String> = room
            .members()
            .filter(|member| **member != session_id)
            .cloned()
            .collect();

        // The joiner initiates toward every existing member.
        for other in others {
            let Some(other_handle) = self.live_handle(&other) else {
                tracing::warn!(room_id = %room_id, peer_id = %other, "Room member has no transport");
                continue;
            };
            other_handle.deliver(ServerMessage::NewPeer {
                peer_id: session_id.clone(),
                initiator: false,
            });
            conn.handle.deliver(ServerMessage::NewPeer {
                peer_id: other,
                initiator: true,
            });
        }

        if let Some(mut entry) = self.sessions.get_mut(&session_id) {
            entry.room_id = Some(room_id.clone());
        }
        conn.set_joined(session_id.clone(), room_id.clone());

        conn.handle.deliver(ServerMessage::Joined {
            room_id: room_id.clone(),
            session_id: session_id.clone(),
            session_secret: identity.session_secret,
        });

        tracing::info!(
            conn_id = %conn.conn_id,
            room_id = %room_id,
            session_id = %session_id,
            members = member_count,
            "Session joined room"
        );

        Ok(())
    }

    /// Resume the presented identity if it verifies and has not expired, else
    /// mint a fresh one. Both failure modes look identical to the caller.
    fn claim_identity(
        &self,
        conn: &WsSessionState,
        credentials: Option<Credentials>,
        rooms: &mut HashMap<String, Room>,
    ) -> Credentials {
        let valid = credentials
            .filter(|c| self.keys.verify_secret(&c.session_id, &c.session_secret));

        if let Some(credentials) = valid {
            let previous_room = match self.sessions.get_mut(&credentials.session_id) {
                Some(mut entry) => {
                    entry.cancel_expiry();
                    if let Some(previous) = entry.conn.replace(conn.handle.clone()) {
                        tracing::info!(
                            session_id = %credentials.session_id,
                            old_conn_id = %previous.conn_id,
                            conn_id = %conn.conn_id,
                            "Session taken over by new connection"
                        );
                    }
                    Some(entry.room_id.take())
                }
                None => None,
            };

            if let Some(previous_room) = previous_room {
                // A session belongs to at most one room.
                if let Some(room_id) = previous_room {
                    remove_member(rooms, &room_id, &credentials.session_id);
                }
                tracing::debug!(session_id = %credentials.session_id, "Session resumed");
                return credentials;
            }

            tracing::debug!(
                session_id = %credentials.session_id,
                "Session already expired, issuing a fresh identity"
            );
        }

        loop {
            let session_id = new_identifier(SESSION_ID_BYTES);
            if self.sessions.contains_key(&session_id) {
                continue;
            }
            let session_secret = self.keys.derive_secret(&session_id);
            self.sessions.insert(
                session_id.clone(),
                SessionEntry {
                    conn: Some(conn.handle.clone()),
                    room_id: None,
                    expiry: None,
                    expiry_epoch: 0,
                },
            );
            return Credentials {
                session_id,
                session_secret,
            };
        }
    }

    /// Relay an opaque payload to another member of the caller's room.
    pub async fn signal(
        &self,
        conn: &WsSessionState,
        peer_id: &str,
        data: serde_json::Value,
    ) -> Result<(), ProtocolError> {
        let (Some(session_id), Some(room_id)) = (conn.session_id.as_deref(), conn.room_id.as_deref())
        else {
            return Err(ProtocolError::SelfNotInRoom);
        };

        let rooms = self.rooms.lock().await;
        let owned = self
            .sessions
            .get(session_id)
            .is_some_and(|entry| entry.is_owned_by(&conn.conn_id));
        let room = rooms
            .get(room_id)
            .filter(|room| owned && room.contains(session_id))
            .ok_or(ProtocolError::SelfNotInRoom)?;

        if !room.contains(peer_id) {
            return Err(ProtocolError::TargetNotInRoom);
        }
        let target = self
            .live_handle(peer_id)
            .ok_or(ProtocolError::TargetNotInRoom)?;

        target.deliver(ServerMessage::Signal {
            peer_id: session_id.to_string(),
            data,
        });

        Ok(())
    }

    /// Transport closed: leave the room and start the expiry clock.
    pub async fn disconnect(self: &Arc<Self>, conn: &WsSessionState) {
        let Some(session_id) = conn.session_id.as_deref() else {
            return;
        };

        let mut rooms = self.rooms.lock().await;
        let room_id = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return;
            };
            if !entry.is_owned_by(&conn.conn_id) {
                tracing::debug!(
                    conn_id = %conn.conn_id,
                    session_id = %session_id,
                    "Closed connection no longer owns its session"
                );
                return;
            }

            entry.conn = None;
            entry.cancel_expiry();
            let epoch = entry.expiry_epoch;
            entry.expiry = Some(self.schedule_expiry(session_id.to_string(), epoch));
            entry.room_id.take()
        };

        if let Some(room_id) = room_id {
            remove_member(&mut rooms, &room_id, session_id);
        }

        tracing::info!(
            conn_id = %conn.conn_id,
            session_id = %session_id,
            expiry_secs = self.session_expiry.as_secs(),
            "Session detached, awaiting resume"
        );
    }

    fn schedule_expiry(self: &Arc<Self>, session_id: String, epoch: u64) -> AbortHandle {
        let broker: Weak<Self> = Arc::downgrade(self);
        let delay = self.session_expiry;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(broker) = broker.upgrade() {
                broker.expire(&session_id, epoch);
            }
        })
        .abort_handle()
    }

    fn expire(&self, session_id: &str, epoch: u64) {
        let removed = self
            .sessions
            .remove_if(session_id, |_, entry| {
                entry.conn.is_none() && entry.expiry_epoch == epoch
            })
            .is_some();

        if removed {
            tracing::info!(session_id = %session_id, "Session expired");
        }
    }

    fn live_handle(&self, session_id: &str) -> Option<ClientHandle> {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.conn.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Current members of a room, empty when the room does not exist.
    pub async fn room_members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .map(|room| room.members().cloned().collect())
            .unwrap_or_default()
    }
}

fn remove_member(rooms: &mut HashMap<String, Room>, room_id: &str, session_id: &str) {
    let now_empty = match rooms.get_mut(room_id) {
        Some(room) => {
            room.remove_member(session_id);
            room.is_empty()
        }
        None => false,
    };

    if now_empty {
        if let Some(room) = rooms.remove(room_id) {
            tracing::debug!(
                room_id = %room.room_id,
                lifetime_secs = room.created_at.elapsed().as_secs(),
                "Room emptied and removed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn broker(expiry: Duration) -> Arc<Broker> {
        let keys = SessionKeys::new(b"test-server-key").expect("Should build keys");
        Arc::new(Broker::new(keys, expiry))
    }

    fn connect() -> (WsSessionState, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = uuid::Uuid::new_v4().to_string();
        let handle = ClientHandle::new(conn_id.clone(), tx);
        (WsSessionState::new(conn_id, handle), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn joined_identity(messages: &[ServerMessage]) -> (String, String, String) {
        match messages.last() {
            Some(ServerMessage::Joined {
                room_id,
                session_id,
                session_secret,
            }) => (room_id.clone(), session_id.clone(), session_secret.clone()),
            other => panic!("expected joined last, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_issues_identity_and_room() {
        let broker = broker(Duration::from_secs(300));
        let (mut a, mut a_rx) = connect();

        broker.join(&mut a, JoinTarget::Create, None).await.unwrap();

        let messages = drain(&mut a_rx);
        assert_eq!(messages.len(), 1);
        let (room_id, session_id, secret) = joined_identity(&messages);
        assert_eq!(room_id.len(), 11);
        assert_eq!(session_id.len(), 22);
        assert!(broker.keys.verify_secret(&session_id, &secret));
        assert_eq!(broker.room_members(&room_id).await, vec![session_id]);
    }

    #[tokio::test]
    async fn test_join_fans_out_new_peer_before_joined() {
        let broker = broker(Duration::from_secs(300));
        let (mut a, mut a_rx) = connect();
        let (mut b, mut b_rx) = connect();
        let (mut c, mut c_rx) = connect();

        broker.join(&mut a, JoinTarget::Room("room-1".into()), None).await.unwrap();
        let (_, a_id, _) = joined_identity(&drain(&mut a_rx));
        broker.join(&mut b, JoinTarget::Room("room-1".into()), None).await.unwrap();
        let (_, b_id, _) = joined_identity(&drain(&mut b_rx));
        drain(&mut a_rx);

        broker.join(&mut c, JoinTarget::Room("room-1".into()), None).await.unwrap();

        let c_messages = drain(&mut c_rx);
        assert_eq!(c_messages.len(), 3);
        let (_, c_id, _) = joined_identity(&c_messages);
        let mut initiated: Vec<String> = c_messages[..2]
            .iter()
            .map(|m| match m {
                ServerMessage::NewPeer {
                    peer_id,
                    initiator: true,
                } => peer_id.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        initiated.sort();
        let mut expected = vec![a_id, b_id];
        expected.sort();
        assert_eq!(initiated, expected);

        for rx in [&mut a_rx, &mut b_rx] {
            assert_eq!(
                drain(rx),
                vec![ServerMessage::NewPeer {
                    peer_id: c_id.clone(),
                    initiator: false
                }]
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_pair_every_member_once() {
        const MEMBERS: usize = 16;
        let broker = broker(Duration::from_secs(300));

        let tasks: Vec<_> = (0..MEMBERS)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move {
                    let (mut conn, rx) = connect();
                    broker
                        .join(&mut conn, JoinTarget::Room("room-1".into()), None)
                        .await
                        .unwrap();
                    (conn, rx)
                })
            })
            .collect();

        let mut members = Vec::new();
        for task in tasks {
            members.push(task.await.unwrap());
        }

        // (observer, peer) -> observer's role toward peer
        let mut roles: HashMap<(String, String), bool> = HashMap::new();
        for (conn, rx) in members.iter_mut() {
            let messages = drain(rx);
            let me = conn.session_id.clone().unwrap();
            let joined_at = messages
                .iter()
                .position(|m| matches!(m, ServerMessage::Joined { .. }))
                .unwrap();
            let joined_count = messages
                .iter()
                .filter(|m| matches!(m, ServerMessage::Joined { .. }))
                .count();
            assert_eq!(joined_count, 1);

            for (i, msg) in messages.iter().enumerate() {
                let ServerMessage::NewPeer { peer_id, initiator } = msg else {
                    continue;
                };
                // Existing members are initiated toward before `joined`,
                // later arrivals announce themselves after it.
                assert_eq!(*initiator, i < joined_at, "{} saw {:?} at {}", me, msg, i);
                let previous = roles.insert((me.clone(), peer_id.clone()), *initiator);
                assert!(previous.is_none(), "{} saw {} twice", me, peer_id);
            }
        }

        assert_eq!(roles.len(), MEMBERS * (MEMBERS - 1));
        for ((observer, peer), initiator) in &roles {
            let mirrored = roles
                .get(&(peer.clone(), observer.clone()))
                .unwrap_or_else(|| panic!("{} never saw {}", peer, observer));
            assert_ne!(initiator, mirrored);
        }
        assert_eq!(broker.room_members("room-1").await.len(), MEMBERS);
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let broker = broker(Duration::from_secs(300));
        let (mut a, _a_rx) = connect();

        assert_eq!(
            broker.join(&mut a, JoinTarget::Room("abc".into()), None).await,
            Err(ProtocolError::InvalidRoomId)
        );
        assert_eq!(broker.session_count(), 0);

        assert_eq!(
            broker.signal(&a, "someone", json!({})).await,
            Err(ProtocolError::SelfNotInRoom)
        );

        broker.join(&mut a, JoinTarget::Create, None).await.unwrap();
        assert_eq!(
            broker.join(&mut a, JoinTarget::Create, None).await,
            Err(ProtocolError::AlreadyInRoom)
        );
        assert_eq!(
            broker.signal(&a, "not-a-member", json!({"x": 1})).await,
            Err(ProtocolError::TargetNotInRoom)
        );
    }

    #[tokio::test]
    async fn test_signal_relayed_verbatim() {
        let broker = broker(Duration::from_secs(300));
        let (mut a, mut a_rx) = connect();
        let (mut b, mut b_rx) = connect();

        broker.join(&mut a, JoinTarget::Create, None).await.unwrap();
        let (room_id, a_id, _) = joined_identity(&drain(&mut a_rx));
        broker.join(&mut b, JoinTarget::Room(room_id), None).await.unwrap();
        let (_, b_id, _) = joined_identity(&drain(&mut b_rx));
        drain(&mut a_rx);

        broker.signal(&b, &a_id, json!({"x": 1})).await.unwrap();

        assert_eq!(
            drain(&mut a_rx),
            vec![ServerMessage::Signal {
                peer_id: b_id,
                data: json!({"x": 1})
            }]
        );
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_empty_room_removed_and_recreated() {
        let broker = broker(Duration::from_secs(300));
        let (mut a, _a_rx) = connect();

        broker.join(&mut a, JoinTarget::Room("room-1".into()), None).await.unwrap();
        assert_eq!(broker.room_count().await, 1);

        broker.disconnect(&a).await;
        assert_eq!(broker.room_count().await, 0);
        assert!(broker.room_members("room-1").await.is_empty());

        let (mut b, mut b_rx) = connect();
        broker.join(&mut b, JoinTarget::Room("room-1".into()), None).await.unwrap();
        let messages = drain(&mut b_rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(broker.room_members("room-1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_within_window_keeps_identity() {
        let broker = broker(Duration::from_secs(300));
        let (mut a, mut a_rx) = connect();
        let (mut b, mut b_rx) = connect();

        broker.join(&mut a, JoinTarget::Room("room-1".into()), None).await.unwrap();
        let (_, a_id, a_secret) = joined_identity(&drain(&mut a_rx));
        broker.join(&mut b, JoinTarget::Room("room-1".into()), None).await.unwrap();
        let (_, b_id, _) = joined_identity(&drain(&mut b_rx));

        broker.disconnect(&a).await;
        assert_eq!(broker.room_members("room-1").await, vec![b_id.clone()]);

        let (mut a2, mut a2_rx) = connect();
        let credentials = Credentials {
            session_id: a_id.clone(),
            session_secret: a_secret.clone(),
        };
        broker
            .join(&mut a2, JoinTarget::Room("room-1".into()), Some(credentials))
            .await
            .unwrap();

        let messages = drain(&mut a2_rx);
        assert_eq!(
            messages[0],
            ServerMessage::NewPeer {
                peer_id: b_id.clone(),
                initiator: true
            }
        );
        assert_eq!(
            joined_identity(&messages),
            ("room-1".to_string(), a_id.clone(), a_secret)
        );
        assert_eq!(broker.room_members("room-1").await.len(), 2);
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::NewPeer {
                peer_id: a_id,
                initiator: false
            }]
        );
    }

    #[tokio::test]
    async fn test_resume_after_expiry_issues_new_identity() {
        let broker = broker(Duration::from_millis(20));
        let (mut a, mut a_rx) = connect();

        broker.join(&mut a, JoinTarget::Create, None).await.unwrap();
        let (room_id, a_id, a_secret) = joined_identity(&drain(&mut a_rx));
        broker.disconnect(&a).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.session_count(), 0);

        let (mut a2, mut a2_rx) = connect();
        let credentials = Credentials {
            session_id: a_id.clone(),
            session_secret: a_secret,
        };
        broker
            .join(&mut a2, JoinTarget::Room(room_id), Some(credentials))
            .await
            .unwrap();
        let (_, new_id, _) = joined_identity(&drain(&mut a2_rx));
        assert_ne!(new_id, a_id);
    }

    #[tokio::test]
    async fn test_resume_cancels_pending_expiry() {
        let broker = broker(Duration::from_millis(50));
        let (mut a, mut a_rx) = connect();

        broker.join(&mut a, JoinTarget::Create, None).await.unwrap();
        let (room_id, a_id, a_secret) = joined_identity(&drain(&mut a_rx));
        broker.disconnect(&a).await;

        let (mut a2, mut a2_rx) = connect();
        let credentials = Credentials {
            session_id: a_id.clone(),
            session_secret: a_secret,
        };
        broker
            .join(&mut a2, JoinTarget::Room(room_id.clone()), Some(credentials))
            .await
            .unwrap();
        drain(&mut a2_rx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(broker.session_count(), 1);
        assert_eq!(broker.room_members(&room_id).await, vec![a_id]);
    }

    #[tokio::test]
    async fn test_invalid_secret_is_indistinguishable_from_none() {
        let broker = broker(Duration::from_secs(300));
        let (mut a, mut a_rx) = connect();
        broker.join(&mut a, JoinTarget::Create, None).await.unwrap();
        let (_, a_id, _) = joined_identity(&drain(&mut a_rx));

        let (mut b, mut b_rx) = connect();
        let forged = Credentials {
            session_id: a_id.clone(),
            session_secret: "forged".into(),
        };
        broker.join(&mut b, JoinTarget::Create, Some(forged)).await.unwrap();

        let messages = drain(&mut b_rx);
        assert_eq!(messages.len(), 1);
        let (_, b_id, _) = joined_identity(&messages);
        assert_ne!(b_id, a_id);
    }

    #[tokio::test]
    async fn test_stale_connection_close_does_not_evict_takeover() {
        let broker = broker(Duration::from_secs(300));
        let (mut old, mut old_rx) = connect();
        broker.join(&mut old, JoinTarget::Room("room-1".into()), None).await.unwrap();
        let (_, a_id, a_secret) = joined_identity(&drain(&mut old_rx));

        let (mut new, mut new_rx) = connect();
        let credentials = Credentials {
            session_id: a_id.clone(),
            session_secret: a_secret,
        };
        broker
            .join(&mut new, JoinTarget::Room("room-1".into()), Some(credentials))
            .await
            .unwrap();
        drain(&mut new_rx);

        assert_eq!(
            broker.signal(&old, &a_id, json!({})).await,
            Err(ProtocolError::SelfNotInRoom)
        );

        broker.disconnect(&old).await;
        assert_eq!(broker.room_members("room-1").await, vec![a_id.clone()]);
        assert!(broker.signal(&new, &a_id, json!({"loop": true})).await.is_ok());
        assert_eq!(drain(&mut new_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_resume_into_other_room_leaves_previous_room() {
        let broker = broker(Duration::from_secs(300));
        let (mut old, mut old_rx) = connect();
        broker.join(&mut old, JoinTarget::Room("room-1".into()), None).await.unwrap();
        let (_, a_id, a_secret) = joined_identity(&drain(&mut old_rx));

        let (mut new, _new_rx) = connect();
        let credentials = Credentials {
            session_id: a_id.clone(),
            session_secret: a_secret,
        };
        broker
            .join(&mut new, JoinTarget::Room("room-2".into()), Some(credentials))
            .await
            .unwrap();

        assert!(broker.room_members("room-1").await.is_empty());
        assert_eq!(broker.room_members("room-2").await, vec![a_id]);
    }
}
