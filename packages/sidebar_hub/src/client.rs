//! Headless page peer.
//!
//! Plays the content-script or sidebar side of a page session against a
//! running hub: keeps a `PageView` in step with what the hub sends and
//! reports local view changes back. Used by `sidebar-hub connect` and by
//! the end-to-end tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use page_channel::{
    ChannelOptions, ChannelState, Connector, Link, MessageChannel, PortEvent, RpcError,
    TransportError, typed,
};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use tracing::{debug, info, warn};
use url::Url;

use crate::protocol::{InitParams, Method, PeerName, PeerSource, View, ViewParams, ZoomParams};
use crate::session::TabDescriptor;
use crate::view::{PageView, ViewOptions};
use crate::ws::{WsTransport, forward_frame};

/// Where and as whom a page peer connects.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Hub WebSocket endpoint, e.g. `ws://127.0.0.1:7878/ws`.
    pub hub_url: Url,
    pub name: PeerName,
    pub tab: TabDescriptor,
}

impl PeerConfig {
    /// Endpoint with the peer name and tab descriptor as query parameters.
    pub fn connect_url(&self) -> Url {
        let mut url = self.hub_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("name", &self.name.to_string())
                .append_pair("tab", &self.tab.id.to_string())
                .append_pair("window", &self.tab.window_id.to_string())
                .append_pair("url", &self.tab.url)
                .append_pair("title", &self.tab.title)
                .append_pair("active", &self.tab.active.to_string());
            if let Some(zoom) = self.tab.zoom_factor {
                query.append_pair("zoom", &zoom.to_string());
            }
        }
        url
    }
}

/// Connector opening a fresh WebSocket to `url` on every attempt.
pub fn ws_connector(url: Url) -> impl Connector {
    move || {
        let url = url.clone();
        async move { connect_link(&url).await }
    }
}

pub async fn connect_link(url: &Url) -> Result<Link, TransportError> {
    let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
    debug!(%url, "socket connected");

    let (transport, outbound) = WsTransport::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(pump_client_socket(socket, outbound, events_tx, url.to_string()));
    Ok(Link::direct(transport, events_rx))
}

async fn pump_client_socket(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<PortEvent>,
    label: String,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if sink.send(tungstenite::Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(tungstenite::Message::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    if !forward_frame(&events, text.as_str(), &label) {
                        break;
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = events.send(PortEvent::Disconnected);
}

/// A page peer and its view state.
pub struct PagePeer {
    source: PeerSource,
    channel: MessageChannel,
    view: Arc<Mutex<PageView>>,
}

impl PagePeer {
    pub fn spawn(source: PeerSource, connector: impl Connector, options: ChannelOptions) -> Self {
        let channel = MessageChannel::spawn(source.role(), options);
        let view = Arc::new(Mutex::new(PageView::default()));
        let role = source.role();

        // Handlers run concurrently, so each change is applied when the
        // handler is called, in arrival order.
        let state = view.clone();
        channel.on(
            Method::Init.as_str(),
            typed(move |params: InitParams| {
                let mut page = lock(&state);
                page.set_active(params.active);
                page.set_view(params.view, ViewOptions::quiet());
                info!(role, active = params.active, view = %params.view, "init");
                std::future::ready(Ok::<_, RpcError>(()))
            }),
        );

        let state = view.clone();
        channel.on(
            Method::SetView.as_str(),
            typed(move |params: ViewParams| {
                lock(&state).set_view(params.view, ViewOptions::quiet());
                info!(role, view = %params.view, "view changed by hub");
                std::future::ready(Ok::<_, RpcError>(()))
            }),
        );

        let state = view.clone();
        channel.on(
            Method::SetZoom.as_str(),
            typed(move |params: ZoomParams| {
                lock(&state).set_zoom(params.zoom);
                info!(role, zoom = params.zoom, "zoom changed by hub");
                std::future::ready(Ok::<_, RpcError>(()))
            }),
        );

        channel.connect_with(connector);
        Self {
            source,
            channel,
            view,
        }
    }

    pub fn source(&self) -> PeerSource {
        self.source
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    pub fn view(&self) -> PageView {
        *lock(&self.view)
    }

    /// A local (user) view change: the counterpart and the hub default
    /// follow. Returns the number of notifications sent.
    pub fn set_view(&self, view: View) -> usize {
        let outgoing = lock(&self.view).set_view(view, ViewOptions::default());
        for (method, params) in &outgoing {
            self.channel.notify_with(method.as_str(), params);
        }
        outgoing.len()
    }
}

fn lock(view: &Mutex<PageView>) -> MutexGuard<'_, PageView> {
    view.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a page peer until Ctrl-C, `quit` on stdin, or the channel gives up.
/// Lines `expanded` / `hidden` on stdin change the view.
pub async fn run_peer(config: PeerConfig, options: ChannelOptions) -> Result<()> {
    let url = config.connect_url();
    info!(peer = %config.name, hub = %config.hub_url, "starting page peer");

    let options = options.auto_reconnect(true).on_connection_error(|| {
        warn!("connection to hub failed");
    });
    let peer = PagePeer::spawn(config.name.source, ws_connector(url), options);

    let mut state = peer.channel().watch_state();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ChannelState::Closed {
                    warn!("channel closed, giving up");
                    break;
                }
                debug!(state = ?*state.borrow(), "channel state");
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) => match line.trim() {
                        "" => {}
                        "quit" => break,
                        other => match other.parse::<View>() {
                            Ok(view) => {
                                let sent = peer.set_view(view);
                                info!(%view, sent, "view set locally");
                            }
                            Err(e) => warn!(error = %e, "expected `expanded`, `hidden` or `quit`"),
                        },
                    },
                    None => stdin_open = false,
                }
            }
        }
    }

    peer.channel().close();
    Ok(())
}
