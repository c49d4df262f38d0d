//! container-watcher
//!
//! A multi-runtime container lifecycle worker. One adapter per runtime
//! socket (Docker, Podman, containerd, CRI) feeds a single multiplexer
//! task that drives a host callback with normalized create/delete records;
//! sockets that do not exist yet are picked up by a filesystem watcher.
//! The worker embeds into a host process either through the C ABI in
//! [`ffi`] or through the [`Worker`] API directly.

pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod watcher;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use container::{Container, EngineType, Event};
pub use error::WorkerError;
pub use worker::{EventSink, Worker};
