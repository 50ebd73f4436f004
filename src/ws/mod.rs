pub mod handler;
pub mod messages;
pub mod session;

pub use handler::ws_routes;
pub use messages::{msg_types, ClientMessage, Credentials, ServerMessage};
pub use session::{ClientHandle, WsSessionState};
