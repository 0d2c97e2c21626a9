//! Relay Server Implementation
//!
//! Listens for agents and gives each accepted connection its own
//! AgentProxy. Finished proxies are pruned whenever a new agent arrives.

use simproxy_agent::{AgentProxy, DialTarget, EngineConfig, MessageHook, PassThrough};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent error does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different port with --proxy-port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Relay server is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub bind_addr: SocketAddr,
    pub upstream_host: String,
    pub upstream_port: u16,
    /// Echo messages of new agents from the start
    pub show_messages: bool,
    /// Refuse agents beyond this many live proxies
    pub max_agents: Option<usize>,
    pub engine: EngineConfig,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3110)),
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 3100,
            show_messages: false,
            max_agents: None,
            engine: EngineConfig::default(),
        }
    }
}

pub struct RelayServer {
    config: RelayServerConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    agents: Mutex<Vec<Arc<AgentProxy>>>,
    hook: Arc<dyn MessageHook>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl RelayServer {
    /// Bind the listening socket
    ///
    /// Failing to bind is fatal for the relay; nothing is accepted until this succeeds.
    pub async fn bind(config: RelayServerConfig) -> Result<Self, RelayServerError> {
        let listener = Self::bind_with_retry(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            agents: Mutex::new(Vec::new()),
            hook: Arc::new(PassThrough),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Install a hook shared by every agent proxy started afterwards
    pub fn with_hook(mut self, hook: Arc<dyn MessageHook>) -> Self {
        self.hook = hook;
        self
    }

    /// A restarted proxy may find its port still held by sockets in TIME_WAIT
    async fn bind_with_retry(bind_addr: SocketAddr) -> Result<TcpListener, RelayServerError> {
        let mut attempt = 1;
        let reason = loop {
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    if attempt == BIND_ATTEMPTS {
                        break format!("{} (gave up after {} attempts)", e, BIND_ATTEMPTS);
                    }
                    warn!(
                        "Proxy port {} busy, bind attempt {} of {}",
                        bind_addr.port(),
                        attempt,
                        BIND_ATTEMPTS
                    );
                    attempt += 1;
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(e) => break e.to_string(),
            }
        };

        Err(RelayServerError::BindError {
            address: bind_addr.ip().to_string(),
            port: bind_addr.port(),
            reason,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True while the accept loop is running
    pub fn is_alive(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// Snapshot of the live agent proxies, in acceptance order
    pub fn agents(&self) -> Vec<Arc<AgentProxy>> {
        self.live().clone()
    }

    /// Accept agents until `shutdown()` is called
    ///
    /// On exit the listener is closed and every remaining proxy is stopped.
    pub async fn run(&self) -> Result<(), RelayServerError> {
        let Some(listener) = self.take_listener() else {
            // Shut down before the loop ever ran
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            return Err(RelayServerError::AlreadyRunning);
        };

        self.running.store(true, Ordering::SeqCst);
        info!(
            "Proxy server listening on {} (upstream {}:{})",
            self.local_addr, self.config.upstream_host, self.config.upstream_port
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.admit(stream, peer_addr),
                Err(e) => {
                    error!("Failed to accept agent connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        drop(listener);
        self.running.store(false, Ordering::SeqCst);
        info!("Proxy server socket closed");

        self.stop_all().await;
        Ok(())
    }

    /// Close the listener and stop every agent proxy
    pub async fn shutdown(&self) {
        info!("Shutting down proxy server");
        self.shutdown.cancel();
        // Covers a listener that run() never took over
        drop(self.take_listener());
        self.stop_all().await;
    }

    fn take_listener(&self) -> Option<TcpListener> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn admit(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let mut agents = self.live();

        let before = agents.len();
        agents.retain(|agent| agent.is_active());
        if agents.len() < before {
            debug!("Pruned {} finished agent proxies", before - agents.len());
        }

        if let Some(max_agents) = self.config.max_agents {
            if agents.len() >= max_agents {
                warn!(
                    "Refusing agent {}: {} agent proxies already running",
                    peer_addr, max_agents
                );
                return;
            }
        }

        debug!("New agent connection from {}", peer_addr);

        let upstream = DialTarget::new(self.config.upstream_host.clone(), self.config.upstream_port);
        let proxy = AgentProxy::new(stream, upstream)
            .with_config(self.config.engine)
            .with_hook(self.hook.clone())
            .with_echo(self.config.show_messages)
            .start();

        agents.push(proxy);
    }

    async fn stop_all(&self) {
        let agents = std::mem::take(&mut *self.live());
        for agent in agents {
            agent.stop().await;
        }
    }

    fn live(&self) -> MutexGuard<'_, Vec<Arc<AgentProxy>>> {
        self.agents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
