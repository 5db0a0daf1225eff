//! # nexq
//!
//! A priority message queue engine with topics, long polling, visibility
//! timeouts and dead lettering.
//!
//! Every operation goes through the [`storage::Store`] trait, implemented by an
//! in-memory backend and by a SQL backend running on SQLite or PostgreSQL.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
