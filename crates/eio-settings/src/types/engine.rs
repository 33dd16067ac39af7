//! Protocol timing and transport policy.

use std::time::Duration;

use eio_core::TransportKind;
use serde::{Deserialize, Serialize};

/// Engine behaviour shared by every session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Milliseconds between client pings, advertised in the `open` packet.
    #[serde(rename = "pingInterval")]
    pub ping_interval_ms: u64,
    /// Milliseconds past the interval before a silent session is closed.
    #[serde(rename = "pingTimeout")]
    pub ping_timeout_ms: u64,
    /// Milliseconds an upgrade candidate has to finish the probe.
    #[serde(rename = "upgradeTimeout")]
    pub upgrade_timeout_ms: u64,
    /// Milliseconds a polling transport waits for a poll to carry its close.
    #[serde(rename = "closeTimeout")]
    pub close_timeout_ms: u64,
    /// Milliseconds between `noop` nudges of the old transport during an upgrade.
    #[serde(rename = "upgradeProbeInterval")]
    pub upgrade_probe_interval_ms: u64,
    /// Enabled transports. A request naming any other is rejected.
    pub transports: Vec<TransportKind>,
    /// Whether sessions may upgrade away from their initial transport.
    pub allow_upgrades: bool,
    /// Cookie carrying the session id on handshake, or `None` for no cookie.
    pub cookie: Option<String>,
    /// Largest accepted request body in bytes.
    pub max_http_buffer_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 25_000,
            ping_timeout_ms: 60_000,
            upgrade_timeout_ms: 10_000,
            close_timeout_ms: 30_000,
            upgrade_probe_interval_ms: 100,
            transports: TransportKind::ALL.to_vec(),
            allow_upgrades: true,
            cookie: Some("io".to_string()),
            max_http_buffer_size: 1_000_000,
        }
    }
}

impl EngineSettings {
    /// Silence tolerated before a session is closed with "ping timeout".
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.saturating_add(self.ping_timeout_ms))
    }

    /// Upgrade probe deadline.
    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_millis(self.upgrade_timeout_ms)
    }

    /// Deferred polling close deadline.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Period of the upgrade nudge.
    pub fn upgrade_probe_interval(&self) -> Duration {
        Duration::from_millis(self.upgrade_probe_interval_ms)
    }

    /// Cookie name to set on handshake. An empty name disables the cookie.
    pub fn cookie_name(&self) -> Option<&str> {
        self.cookie.as_deref().filter(|c| !c.is_empty())
    }

    /// Whether `kind` is enabled.
    pub fn allows(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Upgrades to advertise for a session opened on `kind`.
    pub fn upgrades_for(&self, kind: TransportKind) -> Vec<TransportKind> {
        if !self.allow_upgrades {
            return Vec::new();
        }
        kind.upgrades_to()
            .iter()
            .copied()
            .filter(|k| self.allows(*k))
            .collect()
    }
}
