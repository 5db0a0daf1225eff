//! Engine building blocks shared by the storage backends.

pub mod backoff;
pub mod lifecycle;
pub mod poller;
pub mod receipt;
pub mod time;
pub mod trigger;
