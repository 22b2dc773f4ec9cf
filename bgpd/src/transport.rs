//! The per-peer transport endpoint: a length-prefixed `Framed` socket plus
//! the read-side error translation spec Section 4.3 requires (a header
//! decode failure must still surface to the FSM as a NOTIFICATION send
//! followed by a `notification_received`-shaped teardown).

// SPDX-License-Identifier: AGPL-3.0-or-later

use bgpd_proto::codec::MessageCodec;
use bgpd_proto::{validate, Message, Notification};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// What a read from the transport produced.
pub enum Received {
    /// A decoded message, plus the total on-wire length (header + body) its
    /// header declared — the peer FSM's UPDATE length cross-check (spec
    /// Section 9) needs this value as it was actually read off the wire,
    /// not re-derived from the decoded message.
    Message(Message, usize),
    /// The codec couldn't even frame a header; `notification` is already
    /// built from the error per spec Section 4.3 ("the endpoint must still
    /// emit `notification_received`...after sending a NOTIFICATION").
    HeaderError(Notification),
    Closed,
    Fatal,
}

pub struct Transport {
    framed: Framed<TcpStream, MessageCodec>,
}

impl Transport {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self { framed: Framed::new(stream, MessageCodec) }
    }

    pub async fn recv(&mut self) -> Received {
        match self.framed.next().await {
            Some(Ok(decoded)) => Received::Message(decoded.message, decoded.wire_len),
            Some(Err(err)) => {
                if matches!(err, bgpd_proto::Error::Io(_)) {
                    Received::Fatal
                } else {
                    Received::HeaderError(Notification::new(validate::header_error(&err)))
                }
            }
            None => Received::Closed,
        }
    }

    /// Sends one message, flushing before returning (spec Section 4.3:
    /// "Writes must be flushed before the FSM considers a send complete").
    pub async fn send(&mut self, message: Message) -> std::io::Result<()> {
        self.framed.send(message).await
    }

    pub async fn close(&mut self) {
        let _ = self.framed.close().await;
    }
}
