//! MCP Client — lifecycle management for a set of named MCP servers.
//!
//! This module handles:
//! - Resolving declarative server configs into launchable form
//! - Launching servers attached to this process or detached with log files
//! - A JSON registry of launched servers shared across invocations
//! - Checking whether a recorded pid is still the process we launched
//! - Picking a transport and deciding what happens at session end
//!
//! [`MultiServerClient`] is the entry point. Everything else is exposed for
//! callers that want to drive a single piece directly.

pub mod client;
pub mod config;
pub mod detach;
pub mod errors;
pub mod lifecycle;
pub mod liveness;
pub mod registry;
pub mod settings;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{MultiServerClient, RunStatus, ServerState, ServerStatus};
pub use errors::LifecycleError;
pub use registry::{LaunchRecord, RegistryStore};
pub use settings::ClientSettings;
pub use transport::{ConnectionHandle, ShutdownClass};
pub use types::{RawServerConfig, ServerConfig, ServersConfig, TransportKind};
