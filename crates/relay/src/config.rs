use anyhow::{anyhow, Context, Result};
use rpc_core::LogOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Settings read from a TOML file. Every field is optional in the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Route the WebSocket endpoint is mounted on.
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            path: "/rpc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_to_events: bool,
    pub log_to_console: bool,
    /// Emit tracing output as JSON lines.
    pub json: bool,
}

/// Values given on the command line. `None` and `false` leave the file's
/// value in place.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub log_to_events: bool,
    pub log_to_console: bool,
    pub json: bool,
}

impl Config {
    /// Read `path` if given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.server.path.starts_with('/') {
            return Err(anyhow!(
                "server.path must start with '/', got '{}'",
                self.server.path
            ));
        }
        Ok(())
    }

    pub fn apply(&mut self, overrides: Overrides) -> Result<()> {
        if let Some(host) = overrides.host {
            self.server.host = host;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(path) = overrides.path {
            self.server.path = path;
        }
        self.logging.log_to_events |= overrides.log_to_events;
        self.logging.log_to_console |= overrides.log_to_console;
        self.logging.json |= overrides.json;
        self.validate()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// The URL clients use to reach the configured server.
    pub fn ws_url(&self) -> Result<Url> {
        let url = format!(
            "ws://{}:{}{}",
            self.server.host, self.server.port, self.server.path
        );
        Url::parse(&url).with_context(|| format!("Invalid server address {}", url))
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            log_to_events: self.logging.log_to_events,
            log_to_console: self.logging.log_to_console,
        }
    }
}

/// Accept only `ws://` and `wss://` URLs.
pub fn parse_ws_url(text: &str) -> Result<Url> {
    let url = Url::parse(text).with_context(|| format!("Invalid URL '{}'", text))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(anyhow!(
            "Invalid URL '{}': scheme must be ws or wss, got {}",
            text,
            scheme
        )),
    }
}
