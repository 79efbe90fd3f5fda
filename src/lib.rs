//! PicoClaw: terminal client for an ownership-gated backend agent.
//!
//! The client authenticates with a delegated identity or an extension
//! wallet, verifies with the backend that the principal owns the agent, and
//! then feeds operator messages through an ordered, cancellable task queue.

pub mod auth;
pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod doctor;
pub mod error;
pub mod identity;
pub mod logging;
pub mod principal;
pub mod proxy;
pub mod queue;
pub mod repl;
pub mod resolver;
pub mod session;
pub mod settings;

pub use config::Config;
pub use context::AppContext;
pub use error::{Error, Result};
