//! Seam to the wrapped execution engine.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::Envelope;

/// Channel bundle for one wrapped-engine connection.
///
/// One sender/receiver per proxied protocol channel. Delivery order is
/// preserved within a channel; nothing is guaranteed across channels.
pub struct EngineChannels {
    /// Control-plane requests toward the engine.
    pub requests: mpsc::Sender<Envelope>,
    /// Control-plane replies from the engine.
    pub replies: mpsc::Receiver<Envelope>,
    /// Broadcast output: stream fragments, rich outputs, status signals.
    pub broadcasts: mpsc::Receiver<Envelope>,
    /// Interactive-input requests raised by the engine.
    pub inputs: mpsc::Receiver<Envelope>,
    /// Interactive-input answers toward the engine.
    pub input_replies: mpsc::Sender<Envelope>,
}

/// Engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine connection failed: {0}")]
    ConnectFailed(String),
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for wrapped execution engines.
///
/// The engine is opaque beyond this seam: how it is launched and which
/// language it runs are the integrator's concern. `connect` may be called
/// once; the channel bundle it returns is consumed by the relay.
#[async_trait]
pub trait Engine: Send {
    /// Open the protocol channels to the engine.
    async fn connect(&mut self) -> Result<EngineChannels, EngineError>;

    /// Deliver an out-of-band interrupt to the engine.
    async fn interrupt(&mut self) -> Result<(), EngineError>;

    /// Shut the engine down, optionally for a restart.
    async fn shutdown(&mut self, restart: bool) -> Result<(), EngineError>;
}
