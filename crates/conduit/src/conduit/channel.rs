//! Inbound client transport.
//!
//! A session only needs a message-oriented, binary-safe duplex channel; the
//! WebSocket adapter below is the production one.

use std::io;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// One side of the relay closed cleanly.
    Finished,
    /// Handshake rejected, dial failed, or an I/O error ended the relay.
    Aborted,
}

#[async_trait]
pub trait MessageSource: Send {
    /// Next inbound message in arrival order; `None` once the peer has closed.
    async fn recv(&mut self) -> Option<io::Result<Bytes>>;
}

#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, data: Bytes) -> io::Result<()>;

    /// Closes the channel. Calling it more than once has no further effect.
    async fn close(&mut self, reason: CloseReason);
}

pub trait ClientChannel: Send + 'static {
    type Sink: MessageSink + 'static;
    type Source: MessageSource + 'static;

    fn split(self) -> (Self::Sink, Self::Source);
}

pub struct WsChannel {
    socket: WebSocket,
}

impl WsChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl ClientChannel for WsChannel {
    type Sink = WsSink;
    type Source = WsSource;

    fn split(self) -> (WsSink, WsSource) {
        let (tx, rx) = self.socket.split();
        (WsSink { tx, closed: false }, WsSource { rx })
    }
}

pub struct WsSource {
    rx: SplitStream<WebSocket>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn recv(&mut self) -> Option<io::Result<Bytes>> {
        loop {
            match self.rx.next().await? {
                Ok(Message::Binary(b)) => return Some(Ok(b)),
                Ok(Message::Text(t)) => {
                    return Some(Ok(Bytes::copy_from_slice(t.as_str().as_bytes())));
                }
                // Pongs are answered by axum itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(err) => return Some(Err(io::Error::other(err))),
            }
        }
    }
}

pub struct WsSink {
    tx: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, data: Bytes) -> io::Result<()> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.tx
            .send(Message::Binary(data))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;

        let code = match reason {
            CloseReason::Finished => close_code::NORMAL,
            CloseReason::Aborted => close_code::ERROR,
        };
        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        // The peer may already be gone; either way the socket is done.
        let _ = self.tx.send(Message::Close(Some(frame))).await;
        let _ = self.tx.close().await;
    }
}
