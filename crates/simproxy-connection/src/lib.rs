//! Framed connections over TCP
//!
//! Provides the length-prefixed channel the relay uses on both its client
//! side and its upstream side, including lazily dialed upstream connections.

pub mod channel;

pub use channel::{ChannelError, ChannelState, DialTarget, FramedChannel, SendOutcome};
