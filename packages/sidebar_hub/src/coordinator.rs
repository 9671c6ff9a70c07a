//! The hub coordinator actor.
//!
//! One task owns the session registry, the preference store and the zoom
//! cache. Everything else (HTTP handlers, peer channel handlers, disconnect
//! hooks) only sends it `HubEvent`s. Channel callbacks hold weak senders so
//! the coordinator stops once the last `HubHandle` is dropped.

use page_channel::{ChannelOptions, Link, MessageChannel, RpcError, once, typed};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::preferences::{
    PreferenceKey, PreferenceStore, PreferenceValue, PreferenceWriter, PreferencesSnapshot,
};
use crate::protocol::{InitParams, Method, PeerName, PeerSource, View, ViewParams, ZoomParams};
use crate::session::{Exclusion, PeerChannel, SessionRegistry, SessionSummary, TabDescriptor};
use crate::zoom::{ZoomMap, ZoomScope, effective_zoom};

pub enum HubEvent {
    PeerConnected {
        name: PeerName,
        tab: TabDescriptor,
        link: Link,
    },
    PeerDisconnected {
        tab_id: u64,
        source: PeerSource,
        peer_id: u64,
    },
    SetView {
        tab_id: u64,
        source: PeerSource,
        peer_id: u64,
        view: View,
    },
    SetDefaultView {
        tab_id: u64,
        view: View,
    },
    ActiveTabs(Vec<u64>),
    ZoomChanged {
        tab_id: u64,
        native_factor: f64,
        scope: ZoomScope,
    },
    ActionClicked,
    Sessions {
        respond_to: oneshot::Sender<Vec<SessionSummary>>,
    },
    Preferences {
        respond_to: oneshot::Sender<PreferencesSnapshot>,
    },
}

/// Handle to the coordinator.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::UnboundedSender<HubEvent>,
}

impl HubHandle {
    /// Hand a freshly accepted peer connection to the hub.
    pub fn connect_peer(&self, name: PeerName, tab: TabDescriptor, link: Link) {
        self.send(HubEvent::PeerConnected { name, tab, link });
    }

    pub fn set_active_tabs(&self, tabs: Vec<u64>) {
        self.send(HubEvent::ActiveTabs(tabs));
    }

    pub fn zoom_changed(&self, tab_id: u64, native_factor: f64, scope: ZoomScope) {
        self.send(HubEvent::ZoomChanged {
            tab_id,
            native_factor,
            scope,
        });
    }

    pub fn action_clicked(&self) {
        self.send(HubEvent::ActionClicked);
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(HubEvent::Sessions { respond_to: tx })
            .map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    pub async fn preferences(&self) -> Result<PreferencesSnapshot, HubError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(HubEvent::Preferences { respond_to: tx })
            .map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    fn send(&self, event: HubEvent) {
        if self.events.send(event).is_err() {
            warn!("hub coordinator is gone, dropping event");
        }
    }
}

/// Start the coordinator. `channel_options` is the template for the
/// hub side of every peer channel.
pub fn spawn(preferences: PreferenceStore, channel_options: ChannelOptions) -> HubHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = preferences
        .file()
        .map(|path| PreferenceWriter::spawn(path.to_path_buf()));
    let coordinator = Coordinator {
        registry: SessionRegistry::new(),
        preferences,
        writer,
        zoom: ZoomMap::default(),
        channel_options,
        next_peer_id: 1,
        events: tx.downgrade(),
    };
    tokio::spawn(coordinator.run(rx));
    HubHandle { events: tx }
}

struct Coordinator {
    registry: SessionRegistry,
    preferences: PreferenceStore,
    writer: Option<PreferenceWriter>,
    zoom: ZoomMap,
    channel_options: ChannelOptions,
    next_peer_id: u64,
    events: mpsc::WeakUnboundedSender<HubEvent>,
}

fn send_event(events: &mpsc::WeakUnboundedSender<HubEvent>, event: HubEvent) -> bool {
    match events.upgrade() {
        Some(events) => events.send(event).is_ok(),
        None => false,
    }
}

impl Coordinator {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<HubEvent>) {
        info!("hub coordinator started");
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        for summary in self.registry.snapshot() {
            if let Some(session) = self.registry.remove(summary.tab_id) {
                session.close_channels();
            }
        }
        info!("hub coordinator stopped");
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::PeerConnected { name, tab, link } => self.peer_connected(name, tab, link),
            HubEvent::PeerDisconnected {
                tab_id,
                source,
                peer_id,
            } => self.peer_disconnected(tab_id, source, peer_id),
            HubEvent::SetView {
                tab_id,
                source,
                peer_id,
                view,
            } => self.relay_view(tab_id, source, peer_id, view),
            HubEvent::SetDefaultView { tab_id, view } => self.set_default_view(tab_id, view),
            HubEvent::ActiveTabs(tabs) => self.registry.set_active_tabs(tabs),
            HubEvent::ZoomChanged {
                tab_id,
                native_factor,
                scope,
            } => self.zoom_changed(tab_id, native_factor, scope),
            HubEvent::ActionClicked => self.action_clicked(),
            HubEvent::Sessions { respond_to } => {
                let _ = respond_to.send(self.registry.snapshot());
            }
            HubEvent::Preferences { respond_to } => {
                let _ = respond_to.send(self.preferences.snapshot());
            }
        }
    }

    fn peer_connected(&mut self, name: PeerName, tab: TabDescriptor, link: Link) {
        let source = name.source;
        let tab_id = tab.id;
        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;

        let events = self.events.clone();
        let options = self
            .channel_options
            .clone()
            .auto_reconnect(false)
            .on_disconnect(move || {
                send_event(
                    &events,
                    HubEvent::PeerDisconnected {
                        tab_id,
                        source,
                        peer_id,
                    },
                );
            });
        let channel = MessageChannel::spawn(format!("{}:{}", tab_id, source.role()), options);
        self.register_handlers(&channel, tab_id, source, peer_id);
        channel.connect_with(once(link));

        let attached = self.registry.attach(
            source,
            &tab,
            &name.page_session_id,
            PeerChannel {
                id: peer_id,
                channel: channel.clone(),
            },
        );
        if let Some(evicted) = attached.evicted {
            evicted.close_channels();
        }
        if let Some(replaced) = attached.replaced {
            debug!(tab_id, role = source.role(), "closing replaced channel");
            replaced.channel.close();
        }
        info!(tab_id, peer = %name, peer_id, "peer connected");

        channel.notify_with(
            Method::Init.as_str(),
            &InitParams {
                active: self.registry.is_active(tab_id),
                view: self.preferences.default_view(),
            },
        );

        if source == PeerSource::ContentScript {
            if let Some(zoom) = tab.zoom_factor.and_then(effective_zoom) {
                if let Some(session) = self.registry.find_mut(tab_id) {
                    self.zoom.prime(&session.origin, zoom);
                    session.last_zoom = Some(zoom);
                }
                channel.notify_with(Method::SetZoom.as_str(), &ZoomParams { zoom });
            }
        }
    }

    fn register_handlers(&self, channel: &MessageChannel, tab_id: u64, source: PeerSource, peer_id: u64) {
        let events = self.events.clone();
        channel.on(
            Method::SetView.as_str(),
            typed(move |params: ViewParams| {
                let queued = send_event(
                    &events,
                    HubEvent::SetView {
                        tab_id,
                        source,
                        peer_id,
                        view: params.view,
                    },
                );
                async move { hub_ack(queued) }
            }),
        );

        let events = self.events.clone();
        channel.on(
            Method::SetDefaultView.as_str(),
            typed(move |params: ViewParams| {
                let queued = send_event(
                    &events,
                    HubEvent::SetDefaultView {
                        tab_id,
                        view: params.view,
                    },
                );
                async move { hub_ack(queued) }
            }),
        );
    }

    fn peer_disconnected(&mut self, tab_id: u64, source: PeerSource, peer_id: u64) {
        let Some(detached) = self.registry.detach(tab_id, source, peer_id) else {
            debug!(tab_id, peer_id, "ignoring disconnect of a replaced channel");
            return;
        };
        detached.peer.channel.close();
        if detached.removed.is_some() {
            info!(tab_id, "session removed");
        } else {
            debug!(tab_id, role = source.role(), "peer left, session kept");
        }
    }

    /// Forward a view change to the other party of the sender's session.
    fn relay_view(&mut self, tab_id: u64, source: PeerSource, peer_id: u64, view: View) {
        let Some(session) = self.registry.find(tab_id) else {
            debug!(tab_id, "set-view for unknown tab");
            return;
        };
        if session.peer(source).map(|p| p.id) != Some(peer_id) {
            debug!(tab_id, peer_id, "set-view from a replaced channel");
            return;
        }
        match session.peer(source.counterpart()) {
            Some(other) => {
                debug!(tab_id, %view, to = source.counterpart().role(), "relaying set-view");
                other
                    .channel
                    .notify_with(Method::SetView.as_str(), &ViewParams { view });
            }
            None => debug!(tab_id, "no counterpart to relay set-view to"),
        }
    }

    fn set_default_view(&mut self, tab_id: u64, view: View) {
        self.store_default_view(view);
        let params = serde_json::to_value(ViewParams { view }).ok();
        let sent = self.registry.notify_all(
            Method::SetView.as_str(),
            params,
            Exclusion {
                tab: Some(tab_id),
                seen: true,
            },
        );
        info!(tab_id, %view, sent, "default view changed");
    }

    /// Update the in-memory default and queue it for the preference file.
    fn store_default_view(&mut self, view: View) {
        if let Err(e) = self
            .preferences
            .set(PreferenceKey::DefaultSidebarView, PreferenceValue::View(view))
        {
            warn!(error = %e, code = e.error_code(), "default view rejected");
            return;
        }
        if let Some(writer) = &self.writer {
            writer.submit(self.preferences.snapshot());
        }
    }

    fn zoom_changed(&mut self, tab_id: u64, native_factor: f64, scope: ZoomScope) {
        let Some(zoom) = effective_zoom(native_factor) else {
            warn!(tab_id, native_factor, "ignoring invalid zoom factor");
            return;
        };
        let Some(session) = self.registry.find_mut(tab_id) else {
            debug!(tab_id, "zoom change for unknown tab");
            return;
        };

        match scope {
            ZoomScope::PerOrigin => {
                let origin = session.origin.clone();
                if !self.zoom.update(&origin, zoom) {
                    debug!(%origin, zoom, "zoom unchanged for origin");
                    return;
                }
                let mut sent = 0;
                for session in self.registry.sharing_origin_mut(&origin) {
                    session.last_zoom = Some(zoom);
                    if let Some(cs) = &session.content_script {
                        cs.channel
                            .notify_with(Method::SetZoom.as_str(), &ZoomParams { zoom });
                        sent += 1;
                    }
                }
                info!(%origin, zoom, sent, "origin zoom changed");
            }
            ZoomScope::PerTab => {
                if session.last_zoom == Some(zoom) {
                    debug!(tab_id, zoom, "zoom unchanged for tab");
                    return;
                }
                session.last_zoom = Some(zoom);
                if let Some(cs) = &session.content_script {
                    cs.channel
                        .notify_with(Method::SetZoom.as_str(), &ZoomParams { zoom });
                }
                info!(tab_id, zoom, "tab zoom changed");
            }
        }
    }

    /// Toolbar action: the sidebar opens everywhere and becomes the default.
    fn action_clicked(&mut self) {
        let view = View::Expanded;
        self.store_default_view(view);
        let params = serde_json::to_value(ViewParams { view }).ok();
        let sent = self
            .registry
            .notify_content_scripts(Method::SetView.as_str(), params);
        info!(sent, "action clicked, sidebar expanded");
    }
}

fn hub_ack(queued: bool) -> Result<(), RpcError> {
    if queued {
        Ok(())
    } else {
        Err(RpcError::internal("hub is shutting down"))
    }
}
