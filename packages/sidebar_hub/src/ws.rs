//! WebSocket transport for page channels.
//!
//! One JSON message per text frame. `WsTransport` hands encoded frames to a
//! pump task that owns the socket; the pump reports inbound messages and the
//! end of the socket as `PortEvent`s, which makes every socket a direct link.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use page_channel::message::{self, Message};
use page_channel::{Link, PortEvent, Transport, TransportError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound half of a socket link.
pub struct WsTransport {
    outbound: Option<mpsc::UnboundedSender<String>>,
}

impl WsTransport {
    /// A transport and the frame queue its pump must drain.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { outbound: Some(tx) }, rx)
    }
}

impl Transport for WsTransport {
    fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let Some(outbound) = &self.outbound else {
            return Err(TransportError::Closed);
        };
        let frame = match message::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                // The message is bad, not the link
                warn!(error = %e, "dropping unencodable message");
                return Ok(());
            }
        };
        outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.outbound = None;
    }
}

/// Decode one inbound text frame and forward it. Returns `false` once the
/// channel side is gone.
pub(crate) fn forward_frame(events: &mpsc::UnboundedSender<PortEvent>, text: &str, label: &str) -> bool {
    match message::decode(text) {
        Ok(message) => events.send(PortEvent::Message(message)).is_ok(),
        Err(e) => {
            warn!(peer = label, error = %e, "dropping malformed frame");
            true
        }
    }
}

/// Wrap an upgraded server socket as a link.
pub fn server_link(socket: WebSocket, label: String) -> Link {
    let (transport, outbound) = WsTransport::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(pump_server_socket(socket, outbound, events_tx, label));
    Link::direct(transport, events_rx)
}

async fn pump_server_socket(
    socket: WebSocket,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<PortEvent>,
    label: String,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                        debug!(peer = %label, "socket write failed");
                        break;
                    }
                }
                None => {
                    // Transport closed by the channel
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if !forward_frame(&events, text.as_str(), &label) {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!(peer = %label, "socket closed by peer");
                    break;
                }
                Some(Err(e)) => {
                    debug!(peer = %label, error = %e, "socket read failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = events.send(PortEvent::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_encodes_frames() {
        let (mut transport, mut frames) = WsTransport::new();
        transport.send(&Message::notification("init", None)).unwrap();
        assert_eq!(frames.try_recv().unwrap(), r#"{"method":"init"}"#);
    }

    #[test]
    fn closed_transport_refuses_sends() {
        let (mut transport, mut frames) = WsTransport::new();
        transport.close();
        assert_eq!(transport.send(&Message::ping()), Err(TransportError::Closed));
        // Dropping the sender ends the pump's queue
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn oversized_message_is_dropped_not_fatal() {
        let (mut transport, mut frames) = WsTransport::new();
        let huge = "x".repeat(message::MAX_FRAME_BYTES + 1);
        let result = transport.send(&Message::notification("big", Some(serde_json::json!(huge))));
        assert!(result.is_ok());
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(forward_frame(&tx, "{nope", "test"));
        assert!(forward_frame(&tx, r#"{"heartbeat":"ping"}"#, "test"));
        assert_eq!(rx.try_recv().unwrap(), PortEvent::Message(Message::ping()));
        assert!(rx.try_recv().is_err());
    }
}
