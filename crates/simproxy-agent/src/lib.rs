//! Per-agent forwarding engine
//!
//! One [`AgentProxy`] sits between one simulated agent and the simulation
//! server. It forwards frames in both directions and keeps the server's
//! lockstep going by sending sync messages when the agent is late.

pub mod config;
pub mod hooks;
pub mod proxy;
pub mod say;
pub mod stats;

pub use config::{EngineConfig, DEFAULT_MAX_WAIT};
pub use hooks::{MessageHook, PassThrough};
pub use proxy::AgentProxy;
pub use say::{check_say, SayPolicy, SayVerdict, SayViolation};
pub use stats::CycleStats;

pub use simproxy_connection::DialTarget;
