use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Connection, MessageHandler};

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;

/// A browser or host socket. Outbound messages pass through a bounded queue
/// drained by a writer task; when the queue is full the message is dropped.
pub struct WebSocketConnection {
    stream: Mutex<Option<SplitStream<WebSocket>>>,
    outbound: mpsc::Sender<Bytes>,
    writer: JoinHandle<()>,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, queue_depth: usize) -> Self {
        let (sink, stream) = socket.split();
        let (outbound, queue) = mpsc::channel(queue_depth.max(1));
        let writer = tokio::spawn(write_loop(sink, queue));
        Self {
            stream: Mutex::new(Some(stream)),
            outbound,
            writer,
        }
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, WsMessage>, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = queue.recv().await {
        let frame = match String::from_utf8(bytes.to_vec()) {
            Ok(text) => WsMessage::Text(text),
            Err(err) => WsMessage::Binary(err.into_bytes()),
        };
        if let Err(err) = sink.send(frame).await {
            debug!(error = %err, "websocket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

fn is_clean(frame: Option<&CloseFrame<'static>>) -> bool {
    frame.map_or(true, |f| f.code == CLOSE_NORMAL || f.code == CLOSE_GOING_AWAY)
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn start(&self, handler: &dyn MessageHandler) -> bool {
        let taken = self.stream.lock().take();
        let Some(mut stream) = taken else {
            return false;
        };
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => handler.on_message(Bytes::from(text)).await,
                Ok(WsMessage::Binary(data)) => handler.on_message(Bytes::from(data)).await,
                Ok(WsMessage::Close(frame)) => return is_clean(frame.as_ref()),
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "websocket read failed");
                    return false;
                }
            }
        }
        false
    }

    fn send(&self, message: Bytes) {
        match self.outbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("outbound queue full; dropping message"),
            Err(TrySendError::Closed(_)) => debug!("websocket writer gone; dropping message"),
        }
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.writer.abort();
    }
}
