use crate::upstream::DEFAULT_FEED_URL;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "HASS_BRIDGE_";
const SUPERVISOR_TOKEN_VAR: &str = "SUPERVISOR_TOKEN";
const ADDON_OPTIONS_FILE: &str = "/data/options.json";
const LOCAL_OPTIONS_FILE: &str = "options.json";
const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
    pub session: SessionConfig,
}

/// Whether every peer gets its own feed connection or all peers share one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    #[default]
    PerPeer,
    Shared,
}

impl FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_peer" | "per-peer" => Ok(Self::PerPeer),
            "shared" => Ok(Self::Shared),
            other => Err(format!("unknown topology: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    pub access_token: Option<String>,
    pub topology: Topology,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            access_token: None,
            topology: Topology::PerPeer,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Comma-separated peer addresses; empty admits everyone.
    pub client_ip_whitelist: String,
    pub enable_generic_call_service: bool,
    pub use_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            client_ip_whitelist: String::new(),
            enable_generic_call_service: false,
            use_tls: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_line_bytes: usize,
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: 64 * 1024,
            outbound_queue: 1024,
        }
    }
}

/// Add-on options file. Only the keys present override the loaded config.
#[derive(Debug, Default, Deserialize)]
struct AddonOptions {
    client_ip_whitelist: Option<String>,
    enable_generic_call_service: Option<bool>,
    use_tls: Option<bool>,
}

/// Parsed peer allow-list. Empty means every peer is admitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList(Vec<IpAddr>);

impl AllowList {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut addrs = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let addr: IpAddr = entry
                .parse()
                .map_err(|_| format!("invalid address in client_ip_whitelist: {entry}"))?;
            addrs.push(addr.to_canonical());
        }
        Ok(Self(addrs))
    }

    pub fn permits(&self, addr: IpAddr) -> bool {
        self.0.is_empty() || self.0.contains(&addr.to_canonical())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = Self::default_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)
                .map_err(|e| format!("{}: {e}", config_path.display()))?;
            tracing::info!(path = %config_path.display(), "loaded config file");
        }

        match options_path() {
            Some(path) => {
                let raw = fs::read_to_string(&path)?;
                config
                    .apply_options(&raw)
                    .map_err(|e| format!("{}: {e}", path.display()))?;
                tracing::info!(path = %path.display(), "applied add-on options");
            }
            None => tracing::debug!("no options.json found; using defaults"),
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_options(&mut self, raw: &str) -> Result<(), serde_json::Error> {
        let options: AddonOptions = serde_json::from_str(raw)?;
        if let Some(val) = options.client_ip_whitelist {
            self.server.client_ip_whitelist = val;
        }
        if let Some(val) = options.enable_generic_call_service {
            self.server.enable_generic_call_service = val;
        }
        if let Some(val) = options.use_tls {
            self.server.use_tls = val;
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let prefixed = |name: &str| var(&format!("{ENV_PREFIX}{name}"));

        // Upstream settings
        if let Some(val) = var(SUPERVISOR_TOKEN_VAR).filter(|v| !v.is_empty()) {
            self.upstream.access_token = Some(val);
        }
        if let Some(val) = prefixed("ACCESS_TOKEN").filter(|v| !v.is_empty()) {
            self.upstream.access_token = Some(val);
        }
        if let Some(val) = prefixed("UPSTREAM_URL") {
            self.upstream.url = val;
        }
        if let Some(val) = prefixed("TOPOLOGY") {
            match val.parse() {
                Ok(topology) => self.upstream.topology = topology,
                Err(err) => tracing::warn!(error = %err, "ignoring {ENV_PREFIX}TOPOLOGY"),
            }
        }

        // Server settings
        if let Some(val) = prefixed("SERVER_HOST") {
            self.server.host = val;
        }
        if let Some(val) = prefixed("SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Some(val) = prefixed("CLIENT_IP_WHITELIST") {
            self.server.client_ip_whitelist = val;
        }
        if let Some(val) = prefixed("ENABLE_GENERIC_CALL_SERVICE") {
            self.server.enable_generic_call_service = val.parse().unwrap_or(false);
        }
        if let Some(val) = prefixed("USE_TLS") {
            self.server.use_tls = val.parse().unwrap_or(false);
        }

        // Session limits
        if let Some(val) = prefixed("MAX_LINE_BYTES") {
            if let Ok(limit) = val.parse() {
                self.session.max_line_bytes = limit;
            }
        }
        if let Some(val) = prefixed("OUTBOUND_QUEUE") {
            if let Ok(depth) = val.parse() {
                self.session.outbound_queue = depth;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.server.host.trim().is_empty() {
            return Err("server.host must be set".into());
        }
        let url = self.upstream.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err("upstream.url must start with ws:// or wss://".into());
        }
        if self.session.max_line_bytes == 0 {
            return Err("session.max_line_bytes must be non-zero".into());
        }
        if self.session.outbound_queue == 0 {
            return Err("session.outbound_queue must be non-zero".into());
        }
        AllowList::parse(&self.server.client_ip_whitelist)?;
        Ok(())
    }

    /// Upstream URL with the scheme upgraded to `wss://` when `server.use_tls` is set.
    pub fn feed_url(&self) -> String {
        let url = self.upstream.url.trim();
        match url.strip_prefix("ws://") {
            Some(rest) if self.server.use_tls => format!("wss://{rest}"),
            _ => url.to_string(),
        }
    }

    pub fn allow_list(&self) -> Result<AllowList, String> {
        AllowList::parse(&self.server.client_ip_whitelist)
    }

    pub fn has_access_token(&self) -> bool {
        self.upstream
            .access_token
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    /// Copy safe to print: the access token is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.upstream.access_token.is_some() {
            copy.upstream.access_token = Some(REDACTED.to_string());
        }
        copy
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
            return PathBuf::from(path);
        }
        PathBuf::from(CONFIG_FILE)
    }
}

fn options_path() -> Option<PathBuf> {
    [ADDON_OPTIONS_FILE, LOCAL_OPTIONS_FILE]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}
