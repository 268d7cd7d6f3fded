//! # SafeMap
//!
//! A string-keyed map that many tasks and threads can share without a lock.
//!
//! The entries are owned by a single actor task. Every operation is sent to
//! it as a command, and the actor applies commands one at a time in arrival
//! order. That gives a total order over all operations and makes
//! [`SafeMap::update`] a true read-modify-write.
//!
//! Queries come in three shapes:
//!
//! - `get`, `len`, `update`, `snapshot` and `close` await the reply;
//! - the `*_with` variants hand the result to a callback run on the actor;
//! - the `blocking_*` variants park a plain OS thread until the reply arrives.
//!
//! `put` and `remove` are fire-and-forget. After [`SafeMap::close`] every
//! call returns [`SafeMapError::Closed`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use safemap::SafeMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), safemap::SafeMapError> {
//!     let map = SafeMap::new();
//!
//!     map.put("a", 1).await?;
//!     map.put("b", 2).await?;
//!     let a = map.update("a", |v| v.copied().unwrap_or(0) + 10).await?;
//!     assert_eq!(a, 11);
//!
//!     let snapshot = map.snapshot().await?;
//!     assert_eq!(snapshot.len(), 2);
//!
//!     let store = map.close().await?;
//!     assert_eq!(store["a"], 11);
//!     assert!(map.get("a").await.is_err());
//!     Ok(())
//! }
//! ```

mod actor;
mod command;
mod config;
mod copy;
mod map;

pub use config::{SafeMapConfig, DEFAULT_CAPACITY};
pub use map::SafeMap;

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafeMapError {
    #[error("map has been closed")]
    Closed,
    #[error("snapshot could not copy a value: {0}")]
    Snapshot(#[from] bincode::Error),
    #[error("map called from inside its own callback or updater")]
    Reentrant,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("request dropped by the map actor")]
    Aborted,
}

impl SafeMapError {
    /// Returns `true` if the map no longer accepts commands.
    pub fn is_closed(&self) -> bool {
        matches!(self, SafeMapError::Closed)
    }
}

pub type Result<T, E = SafeMapError> = std::result::Result<T, E>;
