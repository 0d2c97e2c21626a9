//! Message interception points

use bytes::Bytes;

/// Inspect or rewrite messages as they pass through an agent proxy
///
/// Returning `None` drops the message instead of forwarding it.
pub trait MessageHook: Send + Sync {
    /// Called before a server message is forwarded to the client
    fn on_server_message(&self, message: Bytes) -> Option<Bytes> {
        Some(message)
    }

    /// Called before a client action is forwarded to the server
    fn on_client_message(&self, message: Bytes) -> Option<Bytes> {
        Some(message)
    }
}

/// Forwards everything unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl MessageHook for PassThrough {}
