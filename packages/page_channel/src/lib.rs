//! Page Channel - reconnecting request/notify message channel
//!
//! A `MessageChannel` is one end of a peer connection between two isolated
//! execution contexts that can only exchange JSON messages. It layers
//! notifications, correlated request/response, heartbeats and duplicate
//! suppression on top of a transport that may disappear at any time, and
//! re-establishes that transport on an exponential backoff schedule.
//!
//! The crate knows nothing about what the messages mean; callers register
//! handlers by method name and send notifications or requests.
//!
//! # Example
//!
//! ```no_run
//! use page_channel::{ChannelOptions, MessageChannel, memory};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (left, right) = memory::pair();
//!
//!     let server = MessageChannel::connect(
//!         "server",
//!         page_channel::once(right.into_direct()),
//!         ChannelOptions::default(),
//!     );
//!     server.on("add", |params: Option<serde_json::Value>| async move {
//!         let params = params.unwrap_or_default();
//!         let sum = params["a"].as_i64().unwrap_or(0) + params["b"].as_i64().unwrap_or(0);
//!         Ok::<_, page_channel::RpcError>(json!(sum))
//!     });
//!
//!     let client = MessageChannel::connect(
//!         "client",
//!         page_channel::once(left.into_direct()),
//!         ChannelOptions::default(),
//!     );
//!     let sum = client.request("add", Some(json!({"a": 1, "b": 2}))).await.unwrap();
//!     assert_eq!(sum, json!(3));
//! }
//! ```

pub mod backoff;
mod channel;
pub mod dedup;
mod error;
mod handler;
pub mod memory;
pub mod message;
mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use channel::{ChannelOptions, ChannelState, HeartbeatConfig, Hook, MessageChannel};
pub use error::{ChannelError, RpcError, TransportError};
pub use handler::{Handler, HandlerFuture, typed};
pub use message::{Heartbeat, Message, RequestId};
pub use transport::{
    ConnectFuture, Connector, Dispatcher, Link, OnceConnector, PortEvent, Transport, once,
};
