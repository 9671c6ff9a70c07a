//! Zoom bookkeeping.
//!
//! The browser reports a native zoom factor; pages counter-scale the sidebar
//! with its reciprocal so the panel keeps its size on screen.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How the browser applies a zoom change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZoomScope {
    /// Every tab showing the origin follows the change.
    #[default]
    PerOrigin,
    /// Only the tab that changed.
    PerTab,
}

/// Sidebar zoom for a native browser zoom factor, or `None` for factors
/// that cannot be inverted.
pub fn effective_zoom(native_factor: f64) -> Option<f64> {
    if native_factor.is_finite() && native_factor > 0.0 {
        Some(1.0 / native_factor)
    } else {
        None
    }
}

/// Origin -> last zoom sent to that origin.
#[derive(Debug, Default)]
pub struct ZoomMap {
    origins: HashMap<String, f64>,
}

impl ZoomMap {
    pub fn get(&self, origin: &str) -> Option<f64> {
        self.origins.get(origin).copied()
    }

    /// Record `zoom` for `origin`. Returns `false` when it equals the cached
    /// value, which means the change must not be broadcast again.
    pub fn update(&mut self, origin: &str, zoom: f64) -> bool {
        if self.get(origin) == Some(zoom) {
            return false;
        }
        self.origins.insert(origin.to_string(), zoom);
        true
    }

    /// Overwrite unconditionally.
    pub fn prime(&mut self, origin: &str, zoom: f64) {
        self.origins.insert(origin.to_string(), zoom);
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}
