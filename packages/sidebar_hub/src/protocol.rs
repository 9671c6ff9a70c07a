//! State sync vocabulary shared by the hub and page peers.
//!
//! | method | direction | params |
//! |---|---|---|
//! | `init` | hub -> content script / sidebar, on connect | `{active, view}` |
//! | `set-view` | both ways | `{view}` |
//! | `set-default-view` | page -> hub | `{view}` |
//! | `set-zoom` | hub -> page | `{zoom}` |

use std::fmt;
use std::str::FromStr;

use chrono::Datelike;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Init,
    SetView,
    SetDefaultView,
    SetZoom,
}

impl Method {
    pub const ALL: [Method; 4] = [
        Method::Init,
        Method::SetView,
        Method::SetDefaultView,
        Method::SetZoom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Init => "init",
            Method::SetView => "set-view",
            Method::SetDefaultView => "set-default-view",
            Method::SetZoom => "set-zoom",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMethod(s.to_string()))
    }
}

/// Visibility of the sidebar panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    Expanded,
    Hidden,
}

impl View {
    pub fn as_str(self) -> &'static str {
        match self {
            View::Expanded => "expanded",
            View::Hidden => "hidden",
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for View {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expanded" => Ok(View::Expanded),
            "hidden" => Ok(View::Hidden),
            other => Err(ProtocolError::UnknownView(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitParams {
    pub active: bool,
    pub view: View,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewParams {
    pub view: View,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomParams {
    pub zoom: f64,
}

/// Which kind of page peer opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerSource {
    ContentScript,
    Sidebar,
}

impl PeerSource {
    /// Connection name prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            PeerSource::ContentScript => "AF_CS",
            PeerSource::Sidebar => "AF_SB",
        }
    }

    /// The other party of the same page session.
    pub fn counterpart(self) -> PeerSource {
        match self {
            PeerSource::ContentScript => PeerSource::Sidebar,
            PeerSource::Sidebar => PeerSource::ContentScript,
        }
    }

    pub fn role(self) -> &'static str {
        match self {
            PeerSource::ContentScript => "content-script",
            PeerSource::Sidebar => "sidebar",
        }
    }
}

/// Connection name `<prefix>/<page session id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerName {
    pub source: PeerSource,
    pub page_session_id: String,
}

impl PeerName {
    pub fn new(source: PeerSource, page_session_id: impl Into<String>) -> Self {
        Self {
            source,
            page_session_id: page_session_id.into(),
        }
    }

    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        let (prefix, page_session_id) = name
            .split_once('/')
            .ok_or_else(|| ProtocolError::MalformedName(name.to_string()))?;
        if page_session_id.is_empty() || page_session_id.contains('/') {
            return Err(ProtocolError::MalformedName(name.to_string()));
        }
        let source = match prefix {
            "AF_CS" => PeerSource::ContentScript,
            "AF_SB" => PeerSource::Sidebar,
            other => return Err(ProtocolError::UnknownSource(other.to_string())),
        };
        Ok(Self::new(source, page_session_id))
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source.prefix(), self.page_session_id)
    }
}

/// Fresh page session id: `p_1<year - 2019><month><random>`, all hex.
/// The content script and its sidebar share it to pair up at the hub.
pub fn new_page_session_id() -> String {
    let now = chrono::Utc::now();
    let year = (now.year() - 2019).max(0);
    let mut rng = rand::rng();
    let random: String = (0..5)
        .map(|_| format!("{:x}", rng.random::<u16>()))
        .collect();
    format!("p_1{:x}{:x}{}", year, now.month0(), random)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_round_trip() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
        }
        assert!("set_view".parse::<Method>().is_err());
    }

    #[test]
    fn view_wire_format() {
        assert_eq!(
            serde_json::to_value(ViewParams { view: View::Hidden }).unwrap(),
            serde_json::json!({"view": "hidden"})
        );
        let init: InitParams =
            serde_json::from_value(serde_json::json!({"active": true, "view": "expanded"})).unwrap();
        assert_eq!(
            init,
            InitParams {
                active: true,
                view: View::Expanded
            }
        );
        assert!(serde_json::from_value::<ViewParams>(serde_json::json!({"view": "wide"})).is_err());
    }

    #[test]
    fn peer_names() {
        let name = PeerName::parse("AF_CS/p_17a1234").unwrap();
        assert_eq!(name.source, PeerSource::ContentScript);
        assert_eq!(name.page_session_id, "p_17a1234");
        assert_eq!(name.to_string(), "AF_CS/p_17a1234");

        assert_eq!(
            PeerName::parse("AF_SB/x").unwrap().source,
            PeerSource::Sidebar
        );
        assert!(matches!(
            PeerName::parse("AF_XX/x"),
            Err(ProtocolError::UnknownSource(_))
        ));
        assert!(matches!(
            PeerName::parse("AF_CS"),
            Err(ProtocolError::MalformedName(_))
        ));
        assert!(matches!(
            PeerName::parse("AF_CS/"),
            Err(ProtocolError::MalformedName(_))
        ));
    }

    #[test]
    fn counterpart_is_symmetric() {
        for source in [PeerSource::ContentScript, PeerSource::Sidebar] {
            assert_ne!(source.counterpart(), source);
            assert_eq!(source.counterpart().counterpart(), source);
        }
    }

    #[test]
    fn page_session_id_shape() {
        let id = new_page_session_id();
        assert!(id.starts_with("p_1"));
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_page_session_id());
    }
}
