//! Command line arguments and the optional YAML configuration file

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use simproxy_agent::{EngineConfig, SayPolicy};
use simproxy_server::RelayServerConfig;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const DEFAULT_PROXY_PORT: u16 = 3110;
const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: u16 = 3100;

/// Simulation proxy - relays agents to a Simspark server and keeps lockstep going
#[derive(Parser, Debug)]
#[command(name = "simproxy")]
#[command(about = "Simulation proxy - relays agents to a Simspark server and keeps lockstep going")]
#[command(version)]
#[command(long_about = r#"
simproxy sits between simulated agents and a Simspark server running in
sync mode. Each agent gets its own upstream connection; when an agent is
late with its action the proxy sends the sync on its behalf and counts a
missed cycle.

EXAMPLES:
  # Relay agents on the default ports (3110 -> 127.0.0.1:3100)
  simproxy

  # Relay to a remote server without the interactive console
  simproxy --server sim.example.com --server-port 3100 --daemon

  # Start from a config file and override the listening port
  simproxy --config simproxy.yaml --proxy-port 3200

ENVIRONMENT VARIABLES:
  SIMPROXY_PROXY_PORT    Port agents connect to
  SIMPROXY_SERVER        Simulation server host
  SIMPROXY_SERVER_PORT   Simulation server agent port
  SIMPROXY_MAX_AGENTS    Maximum number of live agents
  SIMPROXY_MAX_WAIT_MS   Wait before syncing for a late agent
"#)]
pub struct Args {
    /// Port agents connect to (default 3110)
    #[arg(long, env = "SIMPROXY_PROXY_PORT")]
    pub proxy_port: Option<u16>,

    /// Simulation server host (default 127.0.0.1)
    #[arg(long, env = "SIMPROXY_SERVER")]
    pub server: Option<String>,

    /// Simulation server agent port (default 3100)
    #[arg(long, env = "SIMPROXY_SERVER_PORT")]
    pub server_port: Option<u16>,

    /// Echo every relayed message
    #[arg(long)]
    pub verbose: bool,

    /// Run without the interactive console
    #[arg(long)]
    pub daemon: bool,

    /// Refuse agents beyond this many live connections
    #[arg(long, env = "SIMPROXY_MAX_AGENTS")]
    pub max_agents: Option<usize>,

    /// Milliseconds to wait for an agent before syncing on its behalf (default 20)
    #[arg(long, env = "SIMPROXY_MAX_WAIT_MS")]
    pub max_wait_ms: Option<u64>,

    /// Count say messages containing quotes as invalid
    #[arg(long)]
    pub reject_quotes: bool,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub proxy: ProxySection,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub agents: AgentSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_agents: Option<usize>,

    #[serde(default)]
    pub daemon: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,

    #[serde(default)]
    pub reject_quotes: bool,

    #[serde(default)]
    pub show_messages: bool,
}

/// Everything the binary needs once arguments and config file are merged
#[derive(Debug, Clone)]
pub struct Settings {
    pub relay: RelayServerConfig,
    pub daemon: bool,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
pub fn build_settings(args: &Args) -> Result<Settings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let proxy_port = args
        .proxy_port
        .or(file.proxy.port)
        .unwrap_or(DEFAULT_PROXY_PORT);
    let upstream_host = args
        .server
        .clone()
        .or(file.server.host)
        .unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string());
    let upstream_port = args
        .server_port
        .or(file.server.port)
        .unwrap_or(DEFAULT_SERVER_PORT);

    if upstream_host.trim().is_empty() {
        anyhow::bail!("Server host cannot be empty (use --server or config file)");
    }

    let max_agents = args.max_agents.or(file.proxy.max_agents);
    if max_agents == Some(0) {
        anyhow::bail!("--max-agents must be at least 1");
    }

    let mut engine = EngineConfig::default();
    if let Some(ms) = args.max_wait_ms.or(file.agents.max_wait_ms) {
        if ms == 0 {
            anyhow::bail!("--max-wait-ms must be at least 1");
        }
        engine.max_wait = Duration::from_millis(ms);
    }
    engine.say_policy = SayPolicy {
        reject_quotes: args.reject_quotes || file.agents.reject_quotes,
    };

    Ok(Settings {
        relay: RelayServerConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], proxy_port)),
            upstream_host,
            upstream_port,
            show_messages: args.verbose || file.agents.show_messages,
            max_agents,
            engine,
        },
        daemon: args.daemon || file.proxy.daemon,
    })
}
