use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use castbridge_engine::{BufferCapacity, CipherKind, Credentials, EngineConfig};
use serde::Deserialize;

use crate::cli::CliArgs;
use crate::error::AppError;

/// Account name the configured credentials are registered under
pub const ACCOUNT: &str = "default";

const DEFAULT_CONFIG_FILE: &str = "castbridge.toml";

/// Contents of the TOML configuration file. Every key is optional, unset
/// keys keep the engine defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    pub account: AccountSection,
    pub upstream: UpstreamSection,
    pub stream: StreamSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub bind_address: Option<String>,
    pub legacy_icy_status: Option<bool>,
    pub icy_bitrate: Option<u32>,
    pub icy_metaint: Option<usize>,
}

#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccountSection {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for AccountSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountSection")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamSection {
    pub player_url: Option<String>,
    pub variant: Option<String>,
    pub packet_key: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSection {
    pub cipher: Option<CipherKind>,
    pub audio_pid: Option<u16>,
    pub live_edge_segments: Option<usize>,
    pub listener_buffer_secs: Option<f64>,
    pub grace_period_secs: Option<u64>,
    pub start_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Load the configuration file. An explicit path must exist, without one
    /// `./castbridge.toml` is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))
    }
}

/// Configuration for the entire program
#[derive(Debug, Clone)]
pub struct ProgramConfig {
    pub engine: EngineConfig,
    pub credentials: Credentials,
}

impl ProgramConfig {
    /// Engine defaults, overridden by the file, overridden by arguments
    pub fn resolve(file: FileConfig, args: &CliArgs) -> Result<Self, AppError> {
        let mut engine = EngineConfig::default();

        let server = &mut engine.server;
        if let Some(hostname) = args.hostname.clone().or(file.server.hostname) {
            server.public_hostname = hostname;
        }
        if let Some(port) = args.port.or(file.server.port) {
            server.port = port;
        }
        if let Some(bind) = args.bind.clone().or(file.server.bind_address) {
            server.bind_address = bind;
        }
        if let Some(legacy) = file.server.legacy_icy_status {
            server.legacy_icy_status = legacy;
        }
        if let Some(bitrate) = file.server.icy_bitrate {
            server.icy_bitrate = bitrate;
        }
        if let Some(metaint) = file.server.icy_metaint {
            server.icy_metaint = metaint;
        }

        let upstream = &mut engine.upstream;
        if let Some(player_url) = file.upstream.player_url {
            upstream.player_url = player_url;
        }
        if let Some(variant) = file.upstream.variant {
            upstream.variant = variant;
        }
        if let Some(packet_key) = file.upstream.packet_key {
            upstream.packet_key = packet_key;
        }
        if let Some(user_agent) = file.upstream.user_agent {
            engine.http.user_agent = user_agent;
        }

        let stream = file.stream;
        if let Some(cipher) = stream.cipher {
            engine.pipeline.cipher = cipher;
        }
        if stream.audio_pid.is_some() {
            engine.pipeline.audio_pid = stream.audio_pid;
        }
        if let Some(live_edge) = stream.live_edge_segments {
            engine.fetcher.live_edge_segments = live_edge;
        }
        if let Some(seconds) = stream.listener_buffer_secs {
            engine.hub.listener_buffer = BufferCapacity::Seconds(seconds);
        }
        if let Some(seconds) = stream.grace_period_secs {
            engine.lifecycle.grace_period = Duration::from_secs(seconds);
        }
        if let Some(seconds) = stream.start_timeout_secs {
            engine.lifecycle.start_timeout = Duration::from_secs(seconds);
        }

        engine.validate()?;

        let username = args
            .username
            .clone()
            .or(file.account.username)
            .filter(|username| !username.is_empty())
            .ok_or_else(|| {
                AppError::InvalidInput(
                    "No upstream user name, use --username or CASTBRIDGE_USERNAME".to_string(),
                )
            })?;
        let password = args
            .password
            .clone()
            .or(file.account.password)
            .ok_or_else(|| {
                AppError::InvalidInput(
                    "No upstream password, use --password or CASTBRIDGE_PASSWORD".to_string(),
                )
            })?;

        Ok(Self {
            engine,
            credentials: Credentials::new(ACCOUNT, username, password),
        })
    }
}
