//! EdgeTalk: session and connection core for an embedded voice assistant.
//!
//! The crate keeps one persistent WebSocket session to a cloud assistant and
//! coordinates it with the device's audio hardware:
//! Wake word / button → listen → server TTS → back to standby
//!
//! # Architecture
//!
//! Independent pieces connected by async channels around one shared context:
//! - **Transport**: WebSocket framing via `tokio-tungstenite`, behind a trait
//! - **Connection**: serialized write path, handshake signal, reconnect policy
//! - **State**: atomic device state machine with consistency repair
//! - **Arbiter**: button and wake-word events, single FIFO consumer
//! - **Dispatcher**: typed inbound server messages via `serde`
//! - **Hardware**: narrow traits the board support layer implements

pub mod arbiter;
pub mod config;
pub mod connection;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod hardware;
pub mod identity;
pub mod provision;
pub mod state;
pub mod testing;
pub mod transport;
pub mod wire;

pub use arbiter::{InputArbiter, InputEvent};
pub use config::DeviceConfig;
pub use connection::ConnectionManager;
pub use context::AppContext;
pub use device::Device;
pub use error::{DeviceError, Result};
pub use state::DeviceState;
pub use wire::ListeningMode;
