//! The seam between client actors and the wire. A [`Connection`] moves
//! opaque messages; the actor never sees frames or sockets.

mod local;
mod websocket;

use async_trait::async_trait;
use bytes::Bytes;

pub use local::{LocalConnection, LocalPeer};
pub use websocket::WebSocketConnection;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: Bytes);
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Feeds inbound messages to `handler` one at a time until the peer goes
    /// away. Returns whether the closure was a clean shutdown.
    async fn start(&self, handler: &dyn MessageHandler) -> bool;

    /// Queues a message for the peer without waiting.
    fn send(&self, message: Bytes);
}
