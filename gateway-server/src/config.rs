//! TOML configuration model.
//!
//! Every field is defaulted so a missing config file (or a config file
//! missing whole sections) is never fatal — the gateway falls back to the
//! same defaults the printer-host companion process assumes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use gateway_core::host::transport::default_socket_path;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7125
}

fn default_program_name() -> String {
    "gateway".to_string()
}

/// `[server]` — listening address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
        }
    }
}

/// `[host_connection]` — the printer-host companion process' Unix socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConnectionConfig {
    pub socket_path: Option<PathBuf>,
    pub program_name: String,
}

impl Default for HostConnectionConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            program_name: default_program_name(),
        }
    }
}

impl HostConnectionConfig {
    /// Resolves the configured path, or the `/tmp/<program>_uds` default.
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| default_socket_path(&self.program_name))
    }
}

fn default_api_key_path() -> PathBuf {
    default_config_dir().join(".api_key")
}

fn default_config_dir() -> PathBuf {
    dirs_home()
        .map(|home| home.join(".config").join("gateway"))
        .unwrap_or_else(|| PathBuf::from("/etc/gateway"))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// `[authorization]` — API key / trusted-connection gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    pub enabled: bool,
    pub trusted_ips: Vec<IpAddr>,
    pub trusted_ranges: Vec<String>,
    pub api_key_path: PathBuf,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trusted_ips: Vec::new(),
            trusted_ranges: Vec::new(),
            api_key_path: default_api_key_path(),
        }
    }
}

/// `[file_manager]` — extra roots beyond the always-present `gcodes`/`config`.
///
/// `gcodes` is usually left unset here: it is auto-registered once the
/// printer host reports its `virtual_sdcard` path (see `state::wire_gcodes_root`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileManagerConfig {
    pub config_path: Option<PathBuf>,
    pub gcodes_path: Option<PathBuf>,
    pub extra_roots: HashMap<String, PathBuf>,
    /// External script invoked to parse gcode metadata (see `gateway_core::files::ExternalExtractor`).
    pub metadata_extractor_script: Option<PathBuf>,
}

impl Default for FileManagerConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            gcodes_path: None,
            extra_roots: HashMap::new(),
            metadata_extractor_script: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    default_config_dir().join("database")
}

fn default_logfile() -> PathBuf {
    PathBuf::from("/tmp/gateway.log")
}

/// `[misc]` — logging and storage paths not specific to any other section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiscConfig {
    pub database_path: PathBuf,
    pub log_path: PathBuf,
    pub nologfile: bool,
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            log_path: default_logfile(),
            nologfile: false,
        }
    }
}

/// Top-level config, parsed from TOML and then selectively overridden by CLI flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub host_connection: HostConnectionConfig,
    pub authorization: AuthorizationConfig,
    pub file_manager: FileManagerConfig,
    pub misc: MiscConfig,

    /// Every top-level TOML section this struct has no named field for,
    /// in file order. Fed to `gateway_core::registry::discover_optional_components`
    /// so `AppState::build` can attempt (and, lacking a matching built-in
    /// component, isolate the failure of) each one, the way `_load_plugins`
    /// walks the config file's remaining sections.
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl Config {
    /// Loads the config file at `path`. A missing file is not an error —
    /// every field simply takes its default.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config = toml::from_str(&contents)
                    .map_err(|err| anyhow::anyhow!("invalid config file {}: {err}", path.display()))?;
                Ok(config)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(err) => Err(anyhow::anyhow!("reading config file {}: {err}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/gateway.conf")).unwrap();
        assert_eq!(config.server.port, 7125);
        assert!(config.authorization.enabled);
    }

    #[test]
    fn parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.conf");
        std::fs::write(&path, "[server]\nport = 8080\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn unknown_sections_land_in_extra() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.conf");
        std::fs::write(&path, "[server]\nport = 8080\n\n[power]\ndevice = \"gpio17\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.extra.contains_key("power"));
        assert!(!config.extra.contains_key("server"));
    }

    #[test]
    fn resolved_socket_path_falls_back_to_default() {
        let config = HostConnectionConfig::default();
        assert!(config
            .resolved_socket_path()
            .to_string_lossy()
            .ends_with("gateway_uds"));
    }
}
