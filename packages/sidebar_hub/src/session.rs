//! Per-tab session bookkeeping.
//!
//! A session pairs the content-script channel and the sidebar channel of one
//! page load, keyed by browser tab id. A new page session id for a known tab
//! replaces the old session outright; the session disappears once both of
//! its channels have gone.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use page_channel::MessageChannel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::protocol::PeerSource;

/// What the browser knows about a tab when a peer connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabDescriptor {
    pub id: u64,
    #[serde(default)]
    pub window_id: u64,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub active: bool,
    /// Current native zoom factor, when the connector knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom_factor: Option<f64>,
}

/// Serialized origin of `url`, or `"null"` for URLs without one.
pub fn origin_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(url) => url.origin().ascii_serialization(),
        Err(_) => "null".to_string(),
    }
}

/// A connected page peer. `id` is unique per connection and lets late
/// disconnect notices be matched against the channel they were issued for.
#[derive(Debug, Clone)]
pub struct PeerChannel {
    pub id: u64,
    pub channel: MessageChannel,
}

#[derive(Debug)]
pub struct Session {
    pub tab_id: u64,
    pub window_id: u64,
    pub page_session_id: String,
    pub url: String,
    pub origin: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    /// Sticky: set once the tab has been active.
    pub seen_by_user: bool,
    pub last_zoom: Option<f64>,
    pub content_script: Option<PeerChannel>,
    pub sidebar: Option<PeerChannel>,
}

impl Session {
    fn new(tab: &TabDescriptor, page_session_id: &str) -> Self {
        Self {
            tab_id: tab.id,
            window_id: tab.window_id,
            page_session_id: page_session_id.to_string(),
            url: tab.url.clone(),
            origin: origin_of(&tab.url),
            title: tab.title.clone(),
            updated_at: Utc::now(),
            seen_by_user: tab.active,
            last_zoom: None,
            content_script: None,
            sidebar: None,
        }
    }

    pub fn peer(&self, source: PeerSource) -> Option<&PeerChannel> {
        match source {
            PeerSource::ContentScript => self.content_script.as_ref(),
            PeerSource::Sidebar => self.sidebar.as_ref(),
        }
    }

    fn slot_mut(&mut self, source: PeerSource) -> &mut Option<PeerChannel> {
        match source {
            PeerSource::ContentScript => &mut self.content_script,
            PeerSource::Sidebar => &mut self.sidebar,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content_script.is_none() && self.sidebar.is_none()
    }

    /// Channel used for fan-out: the sidebar, or the content script while
    /// the sidebar has not connected.
    pub fn broadcast_channel(&self) -> Option<&MessageChannel> {
        self.sidebar
            .as_ref()
            .or(self.content_script.as_ref())
            .map(|p| &p.channel)
    }

    /// Close both channels. The session itself is left as is.
    pub fn close_channels(&self) {
        for peer in [&self.content_script, &self.sidebar].into_iter().flatten() {
            peer.channel.close();
        }
    }

    fn touch(&mut self, tab: &TabDescriptor) {
        self.window_id = tab.window_id;
        self.url = tab.url.clone();
        self.origin = origin_of(&tab.url);
        self.title = tab.title.clone();
        self.updated_at = Utc::now();
        self.seen_by_user |= tab.active;
    }
}

/// Filter for `SessionRegistry::notify_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exclusion {
    /// Skip this tab.
    pub tab: Option<u64>,
    /// Skip every session the user has already seen.
    pub seen: bool,
}

/// Result of `SessionRegistry::attach`. The caller owns whatever was
/// displaced and is expected to close it.
#[derive(Debug, Default)]
pub struct Attached {
    /// Previous session of the tab, evicted by a new page session id.
    pub evicted: Option<Session>,
    /// Previous channel in the same slot of the same session.
    pub replaced: Option<PeerChannel>,
}

#[derive(Debug)]
pub struct Detached {
    pub peer: PeerChannel,
    /// Set when the session lost its last channel and was removed.
    pub removed: Option<Session>,
}

/// JSON view of a session for the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub tab_id: u64,
    pub window_id: u64,
    pub page_session_id: String,
    pub url: String,
    pub origin: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub seen_by_user: bool,
    pub active: bool,
    pub content_script: bool,
    pub sidebar: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<u64, Session>,
    active: HashSet<u64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session for `tab`, evicting any existing one for the same
    /// tab id. Returns the evicted session and the new one.
    pub fn store(&mut self, tab: &TabDescriptor, page_session_id: &str) -> (Option<Session>, &mut Session) {
        let evicted = self.sessions.remove(&tab.id);
        if let Some(old) = &evicted {
            info!(
                tab_id = tab.id,
                old = %old.page_session_id,
                new = %page_session_id,
                "replacing session"
            );
        }
        if tab.active {
            self.active.insert(tab.id);
        }
        let session = self
            .sessions
            .entry(tab.id)
            .or_insert_with(|| Session::new(tab, page_session_id));
        (evicted, session)
    }

    pub fn find(&self, tab_id: u64) -> Option<&Session> {
        self.sessions.get(&tab_id)
    }

    pub fn find_mut(&mut self, tab_id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&tab_id)
    }

    /// Drop the session from the registry. Its channels are not closed.
    pub fn remove(&mut self, tab_id: u64) -> Option<Session> {
        self.sessions.remove(&tab_id)
    }

    pub fn is_active(&self, tab_id: u64) -> bool {
        self.active.contains(&tab_id)
    }

    /// Replace the active set with `tabs`. Sessions of active tabs become seen.
    pub fn set_active_tabs(&mut self, tabs: impl IntoIterator<Item = u64>) {
        let next: HashSet<u64> = tabs.into_iter().collect();
        for tab_id in next.difference(&self.active) {
            debug!(tab_id, "tab became active");
        }
        for tab_id in self.active.difference(&next) {
            debug!(tab_id, "tab became inactive");
        }
        for tab_id in &next {
            if let Some(session) = self.sessions.get_mut(tab_id) {
                session.seen_by_user = true;
            }
        }
        self.active = next;
    }

    /// Send a notification to every session not matched by `exclude`.
    /// Returns how many sessions were notified.
    pub fn notify_all(&self, method: &str, params: Option<Value>, exclude: Exclusion) -> usize {
        let mut sent = 0;
        for session in self.sessions.values() {
            if exclude.tab == Some(session.tab_id) || (exclude.seen && session.seen_by_user) {
                continue;
            }
            if let Some(channel) = session.broadcast_channel() {
                channel.notify(method, params.clone());
                sent += 1;
            }
        }
        sent
    }

    /// Send a notification to every connected content script.
    pub fn notify_content_scripts(&self, method: &str, params: Option<Value>) -> usize {
        let mut sent = 0;
        for peer in self.sessions.values().filter_map(|s| s.content_script.as_ref()) {
            peer.channel.notify(method, params.clone());
            sent += 1;
        }
        sent
    }

    /// Put `peer` into the `source` slot of the tab's session. A session
    /// with another page session id is evicted first (last writer wins).
    pub fn attach(
        &mut self,
        source: PeerSource,
        tab: &TabDescriptor,
        page_session_id: &str,
        peer: PeerChannel,
    ) -> Attached {
        let mut attached = Attached::default();
        let same_page = self
            .sessions
            .get(&tab.id)
            .is_some_and(|s| s.page_session_id == page_session_id);
        let session = if same_page {
            if tab.active {
                self.active.insert(tab.id);
            }
            let session = self
                .sessions
                .entry(tab.id)
                .or_insert_with(|| Session::new(tab, page_session_id));
            session.touch(tab);
            session
        } else {
            let (evicted, session) = self.store(tab, page_session_id);
            attached.evicted = evicted;
            session
        };
        attached.replaced = session.slot_mut(source).replace(peer);
        attached
    }

    /// Clear the `source` slot if it still holds connection `peer_id`.
    /// Returns `None` for a stale notice about a channel that was already
    /// replaced or evicted.
    pub fn detach(&mut self, tab_id: u64, source: PeerSource, peer_id: u64) -> Option<Detached> {
        let session = self.sessions.get_mut(&tab_id)?;
        let slot = session.slot_mut(source);
        if slot.as_ref().map(|p| p.id) != Some(peer_id) {
            return None;
        }
        let peer = slot.take()?;
        let removed = if session.is_empty() {
            self.sessions.remove(&tab_id)
        } else {
            None
        };
        Some(Detached { peer, removed })
    }

    pub fn sharing_origin<'a>(&'a self, origin: &'a str) -> impl Iterator<Item = &'a Session> + 'a {
        self.sessions.values().filter(move |s| s.origin == origin)
    }

    pub fn sharing_origin_mut<'a>(
        &'a mut self,
        origin: &'a str,
    ) -> impl Iterator<Item = &'a mut Session> + 'a {
        self.sessions.values_mut().filter(move |s| s.origin == origin)
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .values()
            .map(|s| SessionSummary {
                tab_id: s.tab_id,
                window_id: s.window_id,
                page_session_id: s.page_session_id.clone(),
                url: s.url.clone(),
                origin: s.origin.clone(),
                title: s.title.clone(),
                updated_at: s.updated_at,
                seen_by_user: s.seen_by_user,
                active: self.active.contains(&s.tab_id),
                content_script: s.content_script.is_some(),
                sidebar: s.sidebar.is_some(),
            })
            .collect();
        summaries.sort_by_key(|s| s.tab_id);
        summaries
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
