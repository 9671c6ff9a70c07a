//! Process-wide, versioned user preferences.
//!
//! Every key carries its own default, validation rule and string encoding.
//! The store can be backed by a JSON snapshot file:
//!
//! ```json
//! {"version": "0.1", "values": {"sidebar-view": "hidden", "zoom-factor": "1"}}
//! ```
//!
//! A missing or unreadable file yields the defaults, and a single entry
//! that fails to decode or validate falls back to that key's default.
//! The in-memory store is authoritative; `PreferenceWriter` writes its
//! snapshots to the file from a separate task.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::PreferenceError;
use crate::protocol::View;

pub const PREFERENCES_VERSION: &str = "0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PreferenceKey {
    DefaultSidebarView,
    ZoomFactor,
}

impl PreferenceKey {
    pub const ALL: [PreferenceKey; 2] = [PreferenceKey::DefaultSidebarView, PreferenceKey::ZoomFactor];

    pub fn wire_name(self) -> &'static str {
        match self {
            PreferenceKey::DefaultSidebarView => "sidebar-view",
            PreferenceKey::ZoomFactor => "zoom-factor",
        }
    }

    pub fn default_value(self) -> PreferenceValue {
        match self {
            PreferenceKey::DefaultSidebarView => PreferenceValue::View(View::Expanded),
            PreferenceKey::ZoomFactor => PreferenceValue::Zoom(1.0),
        }
    }

    /// True when `value` has this key's type and passes its rule.
    pub fn validate(self, value: &PreferenceValue) -> bool {
        match (self, value) {
            (PreferenceKey::DefaultSidebarView, PreferenceValue::View(_)) => true,
            (PreferenceKey::ZoomFactor, PreferenceValue::Zoom(z)) => {
                z.is_finite() && (0.0..=1.0).contains(z)
            }
            _ => false,
        }
    }

    pub fn encode(self, value: &PreferenceValue) -> String {
        match value {
            PreferenceValue::View(view) => view.as_str().to_string(),
            PreferenceValue::Zoom(z) => z.to_string(),
        }
    }

    pub fn decode(self, raw: &str) -> Result<PreferenceValue, PreferenceError> {
        let invalid = || PreferenceError::Invalid {
            key: self,
            value: raw.to_string(),
        };
        let value = match self {
            PreferenceKey::DefaultSidebarView => {
                PreferenceValue::View(raw.parse::<View>().map_err(|_| invalid())?)
            }
            PreferenceKey::ZoomFactor => {
                PreferenceValue::Zoom(raw.trim().parse::<f64>().map_err(|_| invalid())?)
            }
        };
        if self.validate(&value) {
            Ok(value)
        } else {
            Err(invalid())
        }
    }
}

impl fmt::Display for PreferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for PreferenceKey {
    type Err = PreferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PreferenceKey::ALL
            .into_iter()
            .find(|k| k.wire_name() == s)
            .ok_or_else(|| PreferenceError::UnknownKey(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreferenceValue {
    View(View),
    Zoom(f64),
}

/// On-disk (and `GET /preferences`) shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencesSnapshot {
    pub version: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct PreferenceStore {
    values: HashMap<PreferenceKey, PreferenceValue>,
    file: Option<PathBuf>,
}

impl Default for PreferenceStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PreferenceStore {
    /// Defaults only, nothing persisted.
    pub fn in_memory() -> Self {
        Self {
            values: PreferenceKey::ALL
                .into_iter()
                .map(|k| (k, k.default_value()))
                .collect(),
            file: None,
        }
    }

    /// Load from `path`, which is also where later changes are written.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut store = Self::in_memory();

        match read_snapshot(&path) {
            Ok(Some(snapshot)) => store.apply(&snapshot),
            Ok(None) => debug!(path = %path.display(), "no preference file, using defaults"),
            Err(e) => warn!(path = %path.display(), error = %e, "unreadable preference file, using defaults"),
        }

        store.file = Some(path);
        store
    }

    fn apply(&mut self, snapshot: &PreferencesSnapshot) {
        if snapshot.version != PREFERENCES_VERSION {
            info!(
                found = %snapshot.version,
                expected = PREFERENCES_VERSION,
                "preference file version differs, reading known keys"
            );
        }
        for (name, raw) in &snapshot.values {
            let key = match name.parse::<PreferenceKey>() {
                Ok(key) => key,
                Err(_) => {
                    debug!(key = %name, "ignoring unknown preference");
                    continue;
                }
            };
            match key.decode(raw) {
                Ok(value) => {
                    self.values.insert(key, value);
                }
                Err(e) => warn!(error = %e, "falling back to default"),
            }
        }
    }

    pub fn get(&self, key: PreferenceKey) -> PreferenceValue {
        self.values
            .get(&key)
            .copied()
            .unwrap_or_else(|| key.default_value())
    }

    pub fn default_view(&self) -> View {
        match self.get(PreferenceKey::DefaultSidebarView) {
            PreferenceValue::View(view) => view,
            PreferenceValue::Zoom(_) => View::Expanded,
        }
    }

    pub fn zoom_factor(&self) -> f64 {
        match self.get(PreferenceKey::ZoomFactor) {
            PreferenceValue::Zoom(z) => z,
            PreferenceValue::View(_) => 1.0,
        }
    }

    /// Validate and store `value`. An invalid value leaves the store
    /// untouched. Nothing is written here.
    pub fn set(&mut self, key: PreferenceKey, value: PreferenceValue) -> Result<(), PreferenceError> {
        if !key.validate(&value) {
            return Err(PreferenceError::Invalid {
                key,
                value: key.encode(&value),
            });
        }
        self.values.insert(key, value);
        Ok(())
    }

    pub fn snapshot(&self) -> PreferencesSnapshot {
        PreferencesSnapshot {
            version: PREFERENCES_VERSION.to_string(),
            values: PreferenceKey::ALL
                .into_iter()
                .map(|k| (k.wire_name().to_string(), k.encode(&self.get(k))))
                .collect(),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }
}

pub async fn write_snapshot(path: &Path, snapshot: &PreferencesSnapshot) -> Result<(), PreferenceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

/// Background writer for the preference file.
///
/// Snapshots submitted while a write is in progress collapse into the most
/// recent one, so the file always ends up holding the last submitted state.
/// A failed write is logged; the next submission tries again.
#[derive(Debug, Clone)]
pub struct PreferenceWriter {
    latest: watch::Sender<Option<PreferencesSnapshot>>,
}

impl PreferenceWriter {
    /// Start the writer task for `path`. It stops once every handle is
    /// dropped and the last snapshot is written.
    pub fn spawn(path: PathBuf) -> Self {
        let (latest, rx) = watch::channel(None);
        tokio::spawn(run_writer(path, rx));
        Self { latest }
    }

    pub fn submit(&self, snapshot: PreferencesSnapshot) {
        self.latest.send_replace(Some(snapshot));
    }
}

async fn run_writer(path: PathBuf, mut latest: watch::Receiver<Option<PreferencesSnapshot>>) {
    while latest.changed().await.is_ok() {
        let Some(snapshot) = latest.borrow_and_update().clone() else {
            continue;
        };
        match write_snapshot(&path, &snapshot).await {
            Ok(()) => debug!(path = %path.display(), "preferences saved"),
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                code = e.error_code(),
                "could not write preference file, values stay in memory only"
            ),
        }
    }
}

fn read_snapshot(path: &Path) -> Result<Option<PreferencesSnapshot>, PreferenceError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}
