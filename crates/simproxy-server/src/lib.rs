//! Relay Server
//!
//! Accepts agent connections and runs one agent proxy per connection, all
//! relaying to the same simulation server.

mod server;

pub use server::{RelayServer, RelayServerConfig, RelayServerError};
