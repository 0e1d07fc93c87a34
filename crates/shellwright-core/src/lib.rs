//! shellwright-core: resource lifecycle on top of the execution engine
//!
//! Exposes `run_local`, `run_remote` and `copy_to_remote` with preview
//! support, command resources with create/update/delete steps, and
//! hash-based copy updates.

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod transport;

pub use command::{CommandChange, CommandResource, CommandState};
pub use config::EngineConfig;
pub use engine::{CopyState, Engine};
pub use error::CoreError;
pub use transport::{DefaultTransport, RemoteSession, Transport};
