//! Remote counter store access.
//!
//! The subsystem never reads or iterates remote keys; the only operation is
//! the atomic increment-and-expire exposed by [`CounterClient`].

mod client;
mod endpoint;

pub use client::{CounterClient, CounterReply, StoreError, DEFAULT_TIMEOUT};
pub use endpoint::{StoreConfig, DEFAULT_PORT};
