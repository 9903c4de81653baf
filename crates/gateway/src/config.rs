//! Gateway configuration: one YAML file naming the engines to register.
//!
//! ```yaml
//! bind: 127.0.0.1:8890
//! wsPath: /ws
//! authToken: null
//! engines:
//!   pilot:
//!     type: stdio
//!     command: pilot-agent
//!     args: ["--acp"]
//!   opencode:
//!     type: http
//!     command: opencode
//!     args: ["serve", "--port", "{port}", "--hostname", "127.0.0.1"]
//!     port: 4096
//!   mock:
//!     type: mock
//! ```

use agenthub_engines::http::{HttpEngineConfig, HttpStreamAdapter};
use agenthub_engines::mock::MockAdapter;
use agenthub_engines::model::EngineType;
use agenthub_engines::stdio::{StdioEngineConfig, StdioRpcAdapter};
use agenthub_engines::EngineAdapter;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn default_bind() -> String {
    "127.0.0.1:8890".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Clients must present this token when set.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Overrides the platform data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub engines: HashMap<String, EngineConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        rpc_timeout_secs: Option<u64>,
        #[serde(default)]
        watchdog_poll_secs: Option<u64>,
        #[serde(default)]
        watchdog_idle_secs: Option<u64>,
    },
    Http {
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        /// Attach to a running backend instead of spawning one.
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        message_timeout_secs: Option<u64>,
    },
    Mock,
}

pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let bytes = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(GatewayConfig::default());
        }
        Err(e) => return Err(e).with_context(|| format!("read config {}", path.display())),
    };
    let cfg: GatewayConfig =
        serde_yaml::from_str(&bytes).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let base = if let Ok(v) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(v)
    } else {
        let home = std::env::var("HOME").context("HOME is not set")?;
        PathBuf::from(home).join(".config")
    };
    Ok(base.join("agenthub").join("gateway.yaml"))
}

pub fn default_data_dir() -> anyhow::Result<PathBuf> {
    let base = if let Ok(v) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(v)
    } else {
        let home = std::env::var("HOME").context("HOME is not set")?;
        PathBuf::from(home).join(".local").join("share")
    };
    Ok(base.join("agenthub"))
}

/// Instantiate the adapter an engine entry describes.
#[must_use]
pub fn build_adapter(name: &str, config: &EngineConfig) -> Arc<dyn EngineAdapter> {
    let engine_type = EngineType::from(name);
    match config {
        EngineConfig::Stdio {
            command,
            args,
            env,
            rpc_timeout_secs,
            watchdog_poll_secs,
            watchdog_idle_secs,
        } => {
            let mut cfg = StdioEngineConfig::new(engine_type, command.clone());
            cfg.args = args.clone();
            cfg.env = env.clone();
            if let Some(secs) = rpc_timeout_secs {
                cfg.rpc_timeout = Duration::from_secs(*secs);
            }
            if let Some(secs) = watchdog_poll_secs {
                cfg.watchdog_poll = Duration::from_secs(*secs);
            }
            if let Some(secs) = watchdog_idle_secs {
                cfg.watchdog_idle = Duration::from_secs(*secs);
            }
            Arc::new(StdioRpcAdapter::new(cfg))
        }
        EngineConfig::Http {
            command,
            args,
            env,
            base_url,
            port,
            message_timeout_secs,
        } => {
            let mut cfg = HttpEngineConfig::new(engine_type);
            cfg.command = command.clone();
            cfg.args = args.clone();
            cfg.env = env.clone();
            cfg.base_url = base_url.clone();
            if let Some(port) = port {
                cfg.preferred_port = *port;
            }
            if let Some(secs) = message_timeout_secs {
                cfg.message_timeout = Duration::from_secs(*secs);
            }
            Arc::new(HttpStreamAdapter::new(cfg))
        }
        EngineConfig::Mock => Arc::new(MockAdapter::new(engine_type)),
    }
}
