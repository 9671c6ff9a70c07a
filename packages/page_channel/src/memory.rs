//! In-process transport: two ports joined back to back.
//!
//! Closing or dropping one side's transport reports `Disconnected` to the
//! other side, the way a browser runtime port does when its owner goes away.
//! Used for wiring peers inside one process and for tests.

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::message::Message;
use crate::transport::{Link, PortEvent, Transport};

/// Sending half of an in-memory port.
pub struct MemoryTransport {
    peer: mpsc::UnboundedSender<PortEvent>,
    closed: bool,
}

impl Transport for MemoryTransport {
    fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.peer
            .send(PortEvent::Message(message.clone()))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.peer.send(PortEvent::Disconnected);
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// One end of an in-memory pipe.
pub struct MemoryPort {
    pub transport: MemoryTransport,
    pub events: mpsc::UnboundedReceiver<PortEvent>,
}

/// Create two connected ports.
pub fn pair() -> (MemoryPort, MemoryPort) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = MemoryPort {
        transport: MemoryTransport {
            peer: b_tx,
            closed: false,
        },
        events: a_rx,
    };
    let b = MemoryPort {
        transport: MemoryTransport {
            peer: a_tx,
            closed: false,
        },
        events: b_rx,
    };
    (a, b)
}

impl MemoryPort {
    /// Use this port as a direct link (disconnects are reported).
    pub fn into_direct(self) -> Link {
        Link::direct(self.transport, self.events)
    }

    /// Use this port as an adapter link: inbound messages are pumped into the
    /// channel's dispatcher and disconnects are not reported.
    pub fn into_adapter(self) -> Link {
        let mut events = self.events;
        Link::adapter(self.transport, move |dispatcher| {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if let PortEvent::Message(message) = event {
                        if !dispatcher.dispatch(message) {
                            break;
                        }
                    }
                }
            });
        })
    }

    pub fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.transport.send(&message)
    }

    pub async fn recv(&mut self) -> Option<PortEvent> {
        self.events.recv().await
    }

    /// Next application or heartbeat message. `None` once the peer disconnected.
    pub async fn recv_message(&mut self) -> Option<Message> {
        match self.events.recv().await {
            Some(PortEvent::Message(message)) => Some(message),
            Some(PortEvent::Disconnected) | None => None,
        }
    }

    pub fn close(&mut self) {
        self.transport.close();
    }
}
