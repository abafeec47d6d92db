use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Resolved daemon endpoint: loopback TCP on a fixed port, or a filesystem
/// socket owned by the daemon principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// `"tcp"` (loopback) or `"unix"`.
    pub transport: String,
    pub port: u16,
    pub socket_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            transport: "tcp".to_string(),
            port: 48227,
            socket_path: "/tmp/forker.sock".to_string(),
        }
    }
}

impl EndpointConfig {
    pub fn endpoint(&self) -> Endpoint {
        if self.transport.eq_ignore_ascii_case("unix") {
            Endpoint::Unix(PathBuf::from(&self.socket_path))
        } else {
            Endpoint::Tcp(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.port,
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Grace between SIGTERM and SIGKILL when tearing down a session's
    /// surviving children.
    pub grace_ms: u64,
    /// Bound on the per-child stdin queue; a full queue stops the session
    /// reader and turns into transport backpressure on the client.
    pub stdin_queue: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            grace_ms: 5_000,
            stdin_queue: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a reachability probe waits for HELLO_OK.
    pub probe_timeout_ms: u64,
    /// How long a failed probe is remembered before the endpoint is tried
    /// again.
    pub probe_cache_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 1_000,
            probe_cache_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the cookie file.  Empty means: `FORKER_STATE_DIR`,
    /// else `$HOME/.forker`, else `/tmp/forker`.
    pub state_dir: String,
    pub endpoint: EndpointConfig,
    pub daemon: DaemonConfig,
    pub client: ClientConfig,
}

impl Settings {
    /// Loads settings from a TOML file, tolerating a missing file, then
    /// applies environment overrides (`FORKER_TRANSPORT`, `FORKER_PORT`,
    /// `FORKER_SOCKET`, `FORKER_STATE_DIR`).
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut settings = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            settings = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("FORKER_TRANSPORT") {
            if !value.is_empty() {
                settings.endpoint.transport = value;
            }
        }
        if let Ok(value) = env::var("FORKER_PORT") {
            if let Ok(port) = value.parse() {
                settings.endpoint.port = port;
            }
        }
        if let Ok(value) = env::var("FORKER_SOCKET") {
            if !value.is_empty() {
                settings.endpoint.transport = "unix".to_string();
                settings.endpoint.socket_path = value;
            }
        }
        if let Ok(value) = env::var("FORKER_STATE_DIR") {
            if !value.is_empty() {
                settings.state_dir = value;
            }
        }

        Ok(settings)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// The directory holding daemon state (only the cookie file today).
    pub fn state_dir(&self) -> PathBuf {
        if !self.state_dir.is_empty() {
            return PathBuf::from(&self.state_dir);
        }
        if let Ok(dir) = env::var("FORKER_STATE_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        match env::var("HOME") {
            Ok(home) if !home.is_empty() => Path::new(&home).join(".forker"),
            _ => PathBuf::from("/tmp/forker"),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.endpoint()
    }
}
