//! The yawn server: per-connection protocol engine and reactor
//! orchestration on top of the `yawn` runtime core and the `yawn-http`
//! protocol crates.

pub mod connection;
pub mod server;

pub use connection::Connection;
pub use server::{Server, ServerError, ShutdownHandle};
