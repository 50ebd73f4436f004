pub mod api;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod security;
pub mod state;
pub mod ws;

pub use config::{ClientConfig, Config};
pub use error::{AppError, ProtocolError, Result};
pub use state::AppState;
