//! Page-side view state of a content script or sidebar.
//!
//! A view change is applied only when it differs from the current one, and
//! the caller says which parties hear about it. Changes received from the
//! hub are applied with both flags off so they are never echoed back.

use crate::protocol::{Method, View, ViewParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewOptions {
    /// Tell the other party of the page session (`set-view`).
    pub notify_peer: bool,
    /// Tell the hub to adopt the view as the new default (`set-default-view`).
    pub notify_background: bool,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            notify_peer: true,
            notify_background: true,
        }
    }
}

impl ViewOptions {
    /// Apply silently.
    pub fn quiet() -> Self {
        Self {
            notify_peer: false,
            notify_background: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageView {
    view: View,
    zoom: f64,
    active: bool,
}

impl Default for PageView {
    fn default() -> Self {
        Self::new(View::Expanded)
    }
}

impl PageView {
    pub fn new(view: View) -> Self {
        Self {
            view,
            zoom: 1.0,
            active: false,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Apply `view` and return the notifications to send. Empty when the
    /// view is unchanged.
    pub fn set_view(&mut self, view: View, options: ViewOptions) -> Vec<(Method, ViewParams)> {
        if view == self.view {
            return Vec::new();
        }
        self.view = view;

        let mut outgoing = Vec::new();
        if options.notify_peer {
            outgoing.push((Method::SetView, ViewParams { view }));
        }
        if options.notify_background {
            outgoing.push((Method::SetDefaultView, ViewParams { view }));
        }
        outgoing
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        self.zoom = zoom;
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}
