//! Sending half of a live connection

use crate::error::{TransportError, TransportResult};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Frame queued for the socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Text frame carrying one OCPP-J message
    Text(String),
    /// Close the socket with the given code and reason, then stop writing
    Close { code: u16, reason: String },
}

/// Cloneable handle used to push frames to one WebSocket.
///
/// The socket task keeps the matching receiver and drains it into the sink,
/// so writes never wait on the network and ordering per connection follows
/// the order frames are queued in.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh connection id and its frame receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a text frame
    pub fn send_text(&self, text: impl Into<String>) -> TransportResult<()> {
        self.sender
            .send(Outbound::Text(text.into()))
            .map_err(|_| TransportError::ConnectionClosed {
                reason: format!("connection {} is no longer writable", self.id),
            })
    }

    /// Ask the writer to close the socket. Returns false if it is already gone.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.sender
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    /// True once the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
