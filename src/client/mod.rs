//! Client side of a call: signaling, peer links and the orchestrator that
//! drives them.

pub mod control;
pub mod events;
pub mod machine;
pub mod media;
pub mod peers;
pub mod sdp;
pub mod transport;
pub mod webrtc_peer;

pub use events::{Event, EventReceiver, EventSender, TransmitMode};
pub use machine::{CallMachine, CallSnapshot, CallStatus};
pub use media::{MediaCapability, ReceiveOnlyMedia, SilentMicrophone};
pub use peers::{PeerConnectionManager, PeerFactory, PeerState};
pub use transport::{SignalingConnector, WsConnector};
pub use webrtc_peer::WebRtcPeerFactory;
