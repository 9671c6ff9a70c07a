//! Sidebar Hub - background coordinator for page sidebars
//!
//! Every browser tab runs two isolated peers: a content script and a
//! sidebar. Each holds a channel to the hub, which pairs them into page
//! sessions by tab, relays view changes between the two halves of a
//! session, stores the default sidebar view and pushes browser zoom changes
//! to the pages that need to counter-scale.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod preferences;
pub mod protocol;
pub mod server;
pub mod session;
pub mod view;
pub mod ws;
pub mod zoom;

pub use coordinator::{HubHandle, spawn};
pub use error::{HubError, PreferenceError, ProtocolError};
pub use protocol::{Method, PeerName, PeerSource, View};
