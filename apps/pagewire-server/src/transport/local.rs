use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connection, MessageHandler};
use crate::protocol::Message;

enum Frame {
    Message(Bytes),
    Close { clean: bool },
}

/// In-process connection, driven from the other end by a [`LocalPeer`].
pub struct LocalConnection {
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

/// The remote side of a [`LocalConnection`]. Dropping it without calling
/// [`LocalPeer::close`] looks like a dropped network link.
pub struct LocalPeer {
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl LocalConnection {
    pub fn pair() -> (LocalConnection, LocalPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            LocalConnection {
                inbound: Mutex::new(Some(inbound_rx)),
                outbound: outbound_tx,
            },
            LocalPeer {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn start(&self, handler: &dyn MessageHandler) -> bool {
        let taken = self.inbound.lock().take();
        let Some(mut inbound) = taken else {
            return false;
        };
        while let Some(frame) = inbound.recv().await {
            match frame {
                Frame::Message(message) => handler.on_message(message).await,
                Frame::Close { clean } => return clean,
            }
        }
        false
    }

    fn send(&self, message: Bytes) {
        if self.outbound.send(message).is_err() {
            debug!("local peer gone; dropping message");
        }
    }
}

impl LocalPeer {
    pub fn send(&self, message: &Message) {
        if let Ok(bytes) = message.to_bytes() {
            let _ = self.inbound.send(Frame::Message(bytes));
        }
    }

    pub fn send_raw(&self, raw: &[u8]) {
        let _ = self
            .inbound
            .send(Frame::Message(Bytes::copy_from_slice(raw)));
    }

    pub fn request<P: Serialize>(&self, id: &str, action: &str, payload: &P) {
        if let Ok(message) = Message::new(id, action, payload) {
            self.send(&message);
        }
    }

    /// Next message the server sent, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        let bytes = self.outbound.recv().await?;
        Message::decode(&bytes).ok()
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        let bytes = self.outbound.try_recv().ok()?;
        Message::decode(&bytes).ok()
    }

    pub fn close(&self, clean: bool) {
        let _ = self.inbound.send(Frame::Close { clean });
    }
}
