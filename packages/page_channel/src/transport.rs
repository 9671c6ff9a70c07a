//! Transport capability and connectors.
//!
//! A connector produces a `Link` each time the channel (re)connects. Links
//! come in two explicit shapes:
//!
//! - `Link::Direct`: the transport exposes its own inbound event stream,
//!   including a disconnect notification (a runtime port, a WebSocket).
//! - `Link::Adapter`: the transport can only send; the connector is handed a
//!   `Dispatcher` and pushes inbound frames into it itself (a raw
//!   `MessagePort`-like pipe). Adapter links never report a disconnect.

use std::future::Future;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::TransportError;
use crate::message::{self, Message};

/// Outbound half of a live connection.
pub trait Transport: Send + 'static {
    /// Hand one message to the transport. An error means the link is gone.
    fn send(&mut self, message: &Message) -> Result<(), TransportError>;

    /// Release the link. Must be idempotent.
    fn close(&mut self) {}
}

/// Inbound event reported by a direct transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Message(Message),
    Disconnected,
}

/// Callback receiving the dispatcher of an adapter link.
pub type BindFn = Box<dyn FnOnce(Dispatcher) + Send>;

/// A freshly established connection.
pub enum Link {
    Direct {
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedReceiver<PortEvent>,
    },
    Adapter {
        transport: Box<dyn Transport>,
        bind: BindFn,
    },
}

impl Link {
    pub fn direct(
        transport: impl Transport,
        events: mpsc::UnboundedReceiver<PortEvent>,
    ) -> Self {
        Link::Direct {
            transport: Box::new(transport),
            events,
        }
    }

    pub fn adapter(
        transport: impl Transport,
        bind: impl FnOnce(Dispatcher) + Send + 'static,
    ) -> Self {
        Link::Adapter {
            transport: Box::new(transport),
            bind: Box::new(bind),
        }
    }

    /// Close a link that is not going to be attached.
    pub(crate) fn discard(self) {
        match self {
            Link::Direct { mut transport, .. } | Link::Adapter { mut transport, .. } => {
                transport.close()
            }
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Link::Direct { .. } => f.write_str("Link::Direct"),
            Link::Adapter { .. } => f.write_str("Link::Adapter"),
        }
    }
}

/// Entry point for inbound frames of an adapter link.
///
/// Each dispatcher is tied to the connection attempt that created it;
/// frames pushed through a dispatcher from an earlier attempt are ignored.
#[derive(Clone)]
pub struct Dispatcher {
    inbound: mpsc::UnboundedSender<(u64, PortEvent)>,
    link_id: u64,
}

impl Dispatcher {
    pub(crate) fn new(inbound: mpsc::UnboundedSender<(u64, PortEvent)>, link_id: u64) -> Self {
        Self { inbound, link_id }
    }

    /// Deliver a decoded message. Returns `false` once the channel is gone.
    pub fn dispatch(&self, message: Message) -> bool {
        self.inbound
            .send((self.link_id, PortEvent::Message(message)))
            .is_ok()
    }

    /// Decode and deliver a text frame. Malformed frames are logged and skipped.
    pub fn dispatch_frame(&self, frame: &str) -> bool {
        match message::decode(frame) {
            Ok(message) => self.dispatch(message),
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                !self.inbound.is_closed()
            }
        }
    }
}

pub type ConnectFuture = BoxFuture<'static, Result<Link, TransportError>>;

/// Produces a new link for every connection attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> ConnectFuture;
}

impl<F, Fut> Connector for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Link, TransportError>> + Send + 'static,
{
    fn connect(&self) -> ConnectFuture {
        Box::pin(self())
    }
}

/// Connector wrapping a link that already exists, such as a port accepted by
/// a server. The first attempt receives the link; later attempts fail with
/// `TransportError::Exhausted`.
pub struct OnceConnector {
    link: Mutex<Option<Link>>,
}

pub fn once(link: Link) -> OnceConnector {
    OnceConnector {
        link: Mutex::new(Some(link)),
    }
}

impl Connector for OnceConnector {
    fn connect(&self) -> ConnectFuture {
        let link = self.link.lock().ok().and_then(|mut slot| slot.take());
        Box::pin(async move { link.ok_or(TransportError::Exhausted) })
    }
}
