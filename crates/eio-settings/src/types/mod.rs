//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]`. Each type implements
//! [`Default`] with production values, and `#[serde(default)]` lets a
//! settings file name only the fields it changes.

mod engine;
mod server;

pub use engine::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// Example file:
///
/// ```json
/// {
///   "server": { "port": 3000 },
///   "engine": { "pingInterval": 10000, "transports": ["websocket"] }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EioSettings {
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Protocol timing and transport policy.
    pub engine: EngineSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}
