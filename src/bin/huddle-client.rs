use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use huddle::client::machine::{VoiceActivity, VoiceState};
use huddle::client::{
    events, CallMachine, CallStatus, Event, MediaCapability, ReceiveOnlyMedia, SilentMicrophone,
    TransmitMode, WebRtcPeerFactory, WsConnector,
};
use huddle::config::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let mut config = ClientConfig::from_env()?;
    if let Some(room_id) = std::env::args().nth(1) {
        config.room_id = Some(room_id);
    }
    tracing::info!(
        broker_url = %config.broker_url,
        room_id = ?config.room_id,
        stun_server = %config.stun_server,
        send_silence = config.send_silence,
        "Configuration loaded"
    );

    let (tx, rx) = events::channel();
    let connector = WsConnector::new(config.broker_url.clone(), config.reconnect_delay());
    let peer_factory = WebRtcPeerFactory::new(&config)?;
    let send_silence = config.send_silence;
    let media: Box<dyn MediaCapability> = if send_silence {
        Box::new(SilentMicrophone::new(tx.clone()))
    } else {
        Box::new(ReceiveOnlyMedia::new(tx.clone()))
    };

    let machine = CallMachine::new(
        config,
        tx.clone(),
        Box::new(connector),
        Arc::new(peer_factory),
        media,
    );
    let mut snapshots = machine.subscribe();
    let orchestrator = tokio::spawn(machine.run(rx));

    tx.send(Event::Start)
        .map_err(|_| anyhow::anyhow!("Call orchestrator exited before start"))?;

    let mut status = CallStatus::Idle;
    let mut peer_count = 0;
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                // Keep the silent microphone on the air once it is ready.
                if send_silence
                    && snapshot.regions.voice == VoiceState::HasMedia(VoiceActivity::Idle)
                    && snapshot.context.transmit_mode == TransmitMode::Ptt
                {
                    let _ = tx.send(Event::SetTransmitMode(TransmitMode::Continuous));
                }
                if snapshot.context.status != status {
                    status = snapshot.context.status;
                    tracing::info!(
                        status = ?status,
                        room_id = ?snapshot.context.room_id,
                        "Call status changed"
                    );
                }
                if snapshot.context.peers.len() != peer_count {
                    peer_count = snapshot.context.peers.len();
                    for (peer_id, info) in &snapshot.context.peers {
                        tracing::info!(peer_id = %peer_id, state = ?info.state, streams = info.streams.len(), "Peer");
                    }
                }
            }
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, leaving call...");
                break;
            }
        }
    }

    let _ = tx.send(Event::Shutdown);
    orchestrator.await?;

    tracing::info!("Client shutdown complete");

    Ok(())
}
