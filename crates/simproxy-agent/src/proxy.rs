//! Agent Proxy Implementation
//!
//! Each agent proxy runs two tasks. The client task forwards agent actions to
//! the server. The server task forwards perceptions to the agent and, when
//! the agent does not answer with a sync in time, sends one itself so the
//! simulation keeps stepping.

use crate::config::EngineConfig;
use crate::hooks::{MessageHook, PassThrough};
use crate::say::check_say;
use crate::stats::CycleStats;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use simproxy_connection::{DialTarget, FramedChannel, SendOutcome};
use simproxy_proto::{contains_token, prepend_sync, SYNC_TOKEN};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a server-bound message is, for cycle accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outbound {
    Action,
    Sync,
}

/// State shared by the two forwarding tasks
#[derive(Debug)]
struct CycleState {
    sent: CycleStats,
    received: CycleStats,
    /// Sent count at the time the last server message was forwarded
    sent_when_received: u64,
    missed_cycles: u64,
    invalid_say_count: u64,
    /// The agent already sent its sync for the current cycle
    sync_seen: bool,
}

impl CycleState {
    fn new() -> Self {
        Self {
            sent: CycleStats::new(false),
            received: CycleStats::new(true),
            sent_when_received: 0,
            missed_cycles: 0,
            invalid_say_count: 0,
            sync_seen: false,
        }
    }
}

/// Forwarding engine for one agent connection
pub struct AgentProxy {
    id: Uuid,
    connected_at: DateTime<Utc>,
    client: FramedChannel,
    server: FramedChannel,
    config: EngineConfig,
    hook: Arc<dyn MessageHook>,
    cycle: Mutex<CycleState>,
    // Serializes server-bound writes together with their accounting
    server_send: tokio::sync::Mutex<()>,
    client_running: AtomicBool,
    server_started: AtomicBool,
    server_running: AtomicBool,
    stopped: AtomicBool,
    terminated: CancellationToken,
}

impl AgentProxy {
    /// Proxy an accepted agent connection to the server at `upstream`
    ///
    /// The server connection is dialed lazily, with the agent's first action.
    pub fn new(client_stream: TcpStream, upstream: DialTarget) -> Self {
        Self::from_channels(
            FramedChannel::from_stream(client_stream),
            FramedChannel::lazy(upstream),
        )
    }

    pub fn from_channels(client: FramedChannel, server: FramedChannel) -> Self {
        Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            client,
            server,
            config: EngineConfig::default(),
            hook: Arc::new(PassThrough),
            cycle: Mutex::new(CycleState::new()),
            server_send: tokio::sync::Mutex::new(()),
            client_running: AtomicBool::new(false),
            server_started: AtomicBool::new(false),
            server_running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            terminated: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn MessageHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Echo messages in both directions from the start
    pub fn with_echo(self, enabled: bool) -> Self {
        self.client.set_echo(enabled);
        self.server.set_echo(enabled);
        self
    }

    /// Start forwarding agent actions
    ///
    /// The server task follows once the first action has been forwarded.
    pub fn start(self) -> Arc<Self> {
        let proxy = Arc::new(self);
        info!(
            agent_id = %proxy.id,
            peer = %proxy.client.label(),
            "Starting agent proxy"
        );

        proxy.client_running.store(true, Ordering::SeqCst);
        let task_proxy = proxy.clone();
        tokio::spawn(async move {
            task_proxy.forward_client_actions().await;
            task_proxy.client_running.store(false, Ordering::SeqCst);
            task_proxy.stop().await;
        });

        proxy
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Address of the connected agent
    pub fn peer(&self) -> &str {
        self.client.label()
    }

    /// True while the engine is forwarding
    ///
    /// An engine still waiting for its agent's first action counts as
    /// active; its server task has not failed, it has not started yet.
    pub fn is_active(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) || !self.client_running.load(Ordering::SeqCst) {
            return false;
        }
        !self.server_started.load(Ordering::SeqCst) || self.server_running.load(Ordering::SeqCst)
    }

    /// True once the engine has stopped for good
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait until the engine has stopped
    pub async fn stopped(&self) {
        self.terminated.cancelled().await;
    }

    /// Stop forwarding and close both connections. Safe to call repeatedly.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.client.disconnect().await;
        self.server.disconnect().await;

        info!(agent_id = %self.id, "{}", self);
        info!(agent_id = %self.id, "Closed agent proxy for {}", self.client.label());
        self.terminated.cancel();
    }

    pub fn missed_cycles(&self) -> u64 {
        self.cycle().missed_cycles
    }

    pub fn invalid_say_count(&self) -> u64 {
        self.cycle().invalid_say_count
    }

    pub fn sent_stats(&self) -> CycleStats {
        self.cycle().sent.clone()
    }

    pub fn received_stats(&self) -> CycleStats {
        self.cycle().received.clone()
    }

    /// Switch echo of messages sent to the agent, returning the new setting
    pub fn toggle_client_echo(&self) -> bool {
        self.client.toggle_echo()
    }

    /// Switch echo of messages sent to the server, returning the new setting
    pub fn toggle_server_echo(&self) -> bool {
        self.server.toggle_echo()
    }

    /// One-line summary plus statistics for both directions
    pub fn verbose_summary(&self) -> String {
        let summary = self.to_string();
        let cycle = self.cycle();
        format!(
            "{}\nid: {} since: {}\nsent:{}\nreceived:{}",
            summary,
            self.id,
            self.connected_at.to_rfc3339(),
            cycle.sent,
            cycle.received
        )
    }

    fn cycle(&self) -> MutexGuard<'_, CycleState> {
        // Counters stay meaningful even if a holder panicked
        self.cycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sync_seen(&self) -> bool {
        self.cycle().sync_seen
    }

    fn spawn_server_forwarder(self: &Arc<Self>) {
        self.server_running.store(true, Ordering::SeqCst);
        let task_proxy = self.clone();
        tokio::spawn(async move {
            task_proxy.forward_server_messages().await;
            task_proxy.server_running.store(false, Ordering::SeqCst);
            task_proxy.stop().await;
        });
    }

    /// Send to the server and account for it in one step
    async fn send_to_server(&self, payload: &[u8], kind: Outbound) -> SendOutcome {
        let _serial = self.server_send.lock().await;
        let outcome = self.server.send(payload).await;

        if outcome.is_sent() {
            let mut cycle = self.cycle();
            match kind {
                Outbound::Action => {
                    let reference = cycle.received.last_message_at();
                    cycle.sent.record(payload.len(), reference);
                }
                Outbound::Sync => {
                    // No real action since the last perception: the agent missed this cycle
                    if cycle.sent.count() == cycle.sent_when_received {
                        cycle.missed_cycles += 1;
                    }
                }
            }
        }

        outcome
    }

    async fn forward_client_actions(self: &Arc<Self>) {
        while let Some(action) = self.client.receive().await {
            let action = if contains_token(&action, SYNC_TOKEN) {
                self.cycle().sync_seen = true;
                // A clean leading sync keeps the server in step even if a
                // malformed say follows
                Bytes::from(prepend_sync(&action))
            } else {
                action
            };

            if action.is_empty() {
                continue;
            }

            // A hook may drop or empty the action; neither counts as one
            let action = match self.hook.on_client_message(action) {
                Some(action) if !action.is_empty() => action,
                _ => continue,
            };

            if check_say(&action, self.config.say_policy).is_invalid() {
                self.cycle().invalid_say_count += 1;
                debug!(agent_id = %self.id, "Invalid say message from agent");
            }

            if let SendOutcome::Failed(e) = self.send_to_server(&action, Outbound::Action).await {
                warn!(agent_id = %self.id, "Failed to forward action to server: {}", e);
            }

            if self.server.is_closed() {
                debug!(agent_id = %self.id, "Server connection closed");
                break;
            }

            if !self.server_started.swap(true, Ordering::SeqCst) {
                self.spawn_server_forwarder();
            }
        }

        debug!(agent_id = %self.id, "Client action forwarding finished");
    }

    async fn forward_server_messages(self: &Arc<Self>) {
        // Some agents stall after their first action until the server answers
        self.send_to_server(SYNC_TOKEN, Outbound::Sync).await;

        let half_wait = self.config.max_wait / 2;

        while let Some(message) = self.server.receive().await {
            if let Some(message) = self.hook.on_server_message(message) {
                {
                    let mut cycle = self.cycle();
                    let reference = cycle.received.last_message_at();
                    cycle.received.record(message.len(), reference);
                    cycle.sent_when_received = cycle.sent.count();
                    cycle.sync_seen = false;
                }
                self.client.send(&message).await;
            }

            // Already behind: catch up before waiting on the agent again
            if self.server.input_available() {
                continue;
            }

            tokio::time::sleep(half_wait).await;
            if !self.sync_seen() {
                tokio::time::sleep(half_wait).await;
            }

            if !self.sync_seen() {
                self.send_to_server(SYNC_TOKEN, Outbound::Sync).await;
            }
        }

        debug!(agent_id = %self.id, "Server message forwarding finished");
    }
}

impl fmt::Display for AgentProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_active() { "active" } else { "inactive" };
        let cycle = self.cycle();
        write!(
            f,
            "Agent ({}): missed: {} invalid say: {} connection: {}",
            status,
            cycle.missed_cycles,
            cycle.invalid_say_count,
            self.client.label()
        )
    }
}

impl fmt::Debug for AgentProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentProxy")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("server", &self.server)
            .field("active", &self.is_active())
            .finish()
    }
}
