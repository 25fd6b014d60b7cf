//! hubsync - local-first task synchronization
//!
//! Keeps a file-backed task store eventually consistent with a remote Hub
//! under unreliable connectivity.
//!
//! # Core Concepts
//!
//! - **Local-first**: the local store answers every read and write
//! - **Mirror**: a best-effort copy of a local write sent to the Hub afterwards
//! - **Durable queue**: writes waiting for the Hub, persisted across restarts
//! - **Hub-authoritative**: execute and cancel only ever go to the Hub
//!
//! # Module Organization
//!
//! - `cli`: Command-line interface using clap
//! - `config`: Configuration loading from `config.toml`
//! - `connection`: Hub availability and client handle
//! - `error`: Error types and result aliases
//! - `hub`: Authenticated Hub HTTP client producing tagged results
//! - `lock`: File locking and atomic writes
//! - `output`: JSON envelope and human-readable command output
//! - `queue`: Durable mutation queue and per-entity handlers
//! - `repository`: Facade arbitrating local and Hub authority
//! - `status`: Local/Hub status vocabulary mapping
//! - `store`: File-backed task store
//! - `task`: Task data model

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod lock;
pub mod output;
pub mod queue;
pub mod repository;
pub mod status;
pub mod store;
pub mod task;

pub use error::{Error, Result};
