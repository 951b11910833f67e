use std::env;
use std::path::PathBuf;

use tracing::warn;

/// Default port the relay listens on for app and inspector connections.
pub const DEFAULT_RELAY_PORT: u16 = 8143;

/// Runtime configuration, read from environment variables.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Port the relay WebSocket listener binds (`DARTLINK_RELAY_PORT`).
    pub relay_port: u16,
    /// Path clients connect on (`DARTLINK_RELAY_PATH`).
    pub relay_path: String,
    /// Persistence file for dynamic registrations (`DARTLINK_REGISTRY_FILE`).
    pub registry_file: Option<PathBuf>,
    /// JSON file of operator-configured static tools (`DARTLINK_STATIC_TOOLS`).
    pub static_tools_file: Option<PathBuf>,
    /// VM Service URI printed by `flutter run` (`DARTLINK_VM_SERVICE`),
    /// e.g. `ws://127.0.0.1:52311/AbCdEf12345=/ws`.
    pub vm_service_uri: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            relay_port: DEFAULT_RELAY_PORT,
            relay_path: "/ws".to_string(),
            registry_file: None,
            static_tools_file: None,
            vm_service_uri: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            relay_port: parse_port(env::var("DARTLINK_RELAY_PORT").ok(), defaults.relay_port),
            relay_path: env::var("DARTLINK_RELAY_PATH").unwrap_or(defaults.relay_path),
            registry_file: env::var("DARTLINK_REGISTRY_FILE").ok().map(PathBuf::from),
            static_tools_file: env::var("DARTLINK_STATIC_TOOLS").ok().map(PathBuf::from),
            vm_service_uri: env::var("DARTLINK_VM_SERVICE").ok(),
        }
    }
}

fn parse_port(value: Option<String>, default: u16) -> u16 {
    match value {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(port) => port,
            Err(_) => {
                warn!("invalid DARTLINK_RELAY_PORT {:?}, using {}", raw, default);
                default
            }
        },
    }
}
