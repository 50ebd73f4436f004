//! Signaling transport: a self-reconnecting WebSocket to the broker.
//!
//! Every transport instance is started under an epoch. Its events carry that
//! epoch so the orchestrator can drop anything a stopped instance still emits.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::client::events::{Event, EventSender, TransportEvent};
use crate::ws::{ClientMessage, ServerMessage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Signaling transport is stopped")]
    Stopped,
}

/// A running transport instance.
pub trait SignalingLink: Send {
    fn send(&self, msg: ClientMessage) -> Result<(), TransportError>;
    fn stop(&self);
}

/// Starts transport instances.
pub trait SignalingConnector: Send {
    fn connect(&self, epoch: u64, events: EventSender) -> Box<dyn SignalingLink>;
}

pub struct WsConnector {
    url: String,
    reconnect_delay: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
        }
    }
}

impl SignalingConnector for WsConnector {
    fn connect(&self, epoch: u64, events: EventSender) -> Box<dyn SignalingLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_transport(
            self.url.clone(),
            self.reconnect_delay,
            epoch,
            events,
            rx,
        ));

        Box::new(WsLink {
            outbound: tx,
            task: task.abort_handle(),
        })
    }
}

struct WsLink {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    task: AbortHandle,
}

impl SignalingLink for WsLink {
    fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        self.outbound.send(msg).map_err(|_| TransportError::Stopped)
    }

    fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn emit(events: &EventSender, epoch: u64, event: TransportEvent) -> bool {
    events.send(Event::Transport { epoch, event }).is_ok()
}

/// Connect, pump until the socket drops, wait, repeat.
async fn run_transport(
    url: String,
    reconnect_delay: Duration,
    epoch: u64,
    events: EventSender,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
) {
    loop {
        tracing::debug!(url = %url, epoch, "Connecting to broker");

        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                tracing::info!(url = %url, epoch, "Connected to broker");
                if !emit(&events, epoch, TransportEvent::Connected) {
                    return;
                }

                let code = pump(stream, &mut outbound, &events, epoch).await;
                tracing::info!(epoch, code = ?code, "Broker connection closed");
                if !emit(&events, epoch, TransportEvent::Disconnected { code }) {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(url = %url, epoch, error = %e, "Failed to connect to broker");
                if !emit(&events, epoch, TransportEvent::Error(e.to_string()))
                    || !emit(&events, epoch, TransportEvent::Disconnected { code: None })
                {
                    return;
                }
            }
        }

        // Nothing sent while disconnected survives a reconnect, including
        // anything queued during the backoff.
        if !discard_queued(&mut outbound) {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
        if !discard_queued(&mut outbound) {
            return;
        }
    }
}

/// Drop everything queued so far. Returns false once the link is gone.
fn discard_queued(outbound: &mut mpsc::UnboundedReceiver<ClientMessage>) -> bool {
    loop {
        match outbound.try_recv() {
            Ok(msg) => tracing::warn!(?msg, "Dropping message sent while disconnected"),
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

type BrokerStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Returns the close code, if the broker sent one.
async fn pump(
    stream: BrokerStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &EventSender,
    epoch: u64,
) -> Option<u16> {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(msg) => {
                            if !emit(events, epoch, TransportEvent::Received(msg)) {
                                return None;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Ignoring undecodable broker message");
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return frame.map(|f| u16::from(f.code));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(events, epoch, TransportEvent::Error(e.to_string()));
                    return None;
                }
                None => return None,
            },
            outgoing = outbound.recv() => match outgoing {
                Some(msg) => {
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode broker message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        emit(events, epoch, TransportEvent::Error(e.to_string()));
                        return None;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Some(1000);
                }
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;
    use crate::client::events::{self, EventReceiver};

    async fn next_transport(rx: &mut EventReceiver) -> TransportEvent {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Transport should report")
            .expect("Queue should stay open");
        match event {
            Event::Transport { event, .. } => event,
            other => panic!("expected transport event, got {:?}", other),
        }
    }

    #[test]
    fn test_discard_queued_empties_the_queue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ClientMessage::create(None)).unwrap();
        tx.send(ClientMessage::join("room-1", None)).unwrap();

        assert!(discard_queued(&mut rx));
        assert!(rx.try_recv().is_err());

        drop(tx);
        assert!(!discard_queued(&mut rx));
    }

    #[tokio::test]
    async fn test_messages_queued_during_backoff_are_not_replayed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // First connection is closed straight away.
            let (socket, _) = listener.accept().await.unwrap();
            let mut first = accept_async(socket).await.unwrap();
            first.close(None).await.unwrap();

            let (socket, _) = listener.accept().await.unwrap();
            let mut second = accept_async(socket).await.unwrap();
            while let Some(Ok(frame)) = second.next().await {
                if let Message::Text(text) = frame {
                    let _ = frames_tx.send(text.to_string());
                }
            }
        });

        let (tx, mut rx) = events::channel();
        let link = WsConnector::new(format!("ws://{}", addr), Duration::from_millis(200))
            .connect(3, tx);

        assert_eq!(next_transport(&mut rx).await, TransportEvent::Connected);
        assert!(matches!(
            next_transport(&mut rx).await,
            TransportEvent::Disconnected { .. }
        ));

        // Queued while backing off.
        tokio::time::sleep(Duration::from_millis(50)).await;
        link.send(ClientMessage::join("stale-room", None)).unwrap();

        assert_eq!(next_transport(&mut rx).await, TransportEvent::Connected);
        link.send(ClientMessage::join("fresh-room", None)).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let decoded: ClientMessage = serde_json::from_str(&first).unwrap();
        assert_eq!(decoded, ClientMessage::join("fresh-room", None));

        link.stop();
    }
}
