//! Zetian: an embeddable SMTP server with relay, anti-abuse filtering,
//! and cluster coordination.
//!
//! The heavy lifting lives in the member crates; this one assembles a
//! running server from a configuration and exposes the pieces for
//! embedders that want to wire their own.

pub mod config;
pub mod events;
pub mod handler;
pub mod server;

pub use config::{FilterOptions, ServerOptions, StorageOptions, ZetianConfig};
pub use events::{EventBus, ServerEvent};
pub use handler::ZetianHandler;
pub use server::Server;
