use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::actor::{self, Actor};
use crate::command::{Command, Reply, Store};
use crate::config::SafeMapConfig;
use crate::copy::deep_copy;
use crate::{Result, SafeMapError};

/// Handle to a map whose entries live inside a dedicated actor task.
///
/// Every operation is a message to that task, so all of them are applied in
/// a single total order without any lock. Handles are cheap to clone and
/// all clones talk to the same actor.
///
/// Callbacks and updaters run on the actor itself. They should be quick and
/// must not call back into the same map: such calls fail with
/// [`SafeMapError::Reentrant`] rather than deadlocking.
pub struct SafeMap<V> {
    id: u64,
    name: Option<Arc<str>>,
    // Set by the first close, before its Shutdown is queued.
    closing: Arc<AtomicBool>,
    sender: mpsc::Sender<Command<V>>,
}

impl<V> Clone for SafeMap<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            closing: Arc::clone(&self.closing),
            sender: self.sender.clone(),
        }
    }
}

impl<V> fmt::Debug for SafeMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeMap")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<V> SafeMap<V> {
    /// Whether the map has been closed (or its actor is otherwise gone).
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.sender.is_closed()
    }

    /// The name given through [`SafeMapConfig::with_name`], if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn check(&self) -> Result<()> {
        if actor::is_reentrant(self.id) {
            return Err(SafeMapError::Reentrant);
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(SafeMapError::Closed);
        }
        Ok(())
    }

    // Only one caller wins the right to queue the Shutdown.
    fn begin_close(&self) -> Result<()> {
        if actor::is_reentrant(self.id) {
            return Err(SafeMapError::Reentrant);
        }
        if self.closing.swap(true, Ordering::AcqRel) {
            return Err(SafeMapError::Closed);
        }
        Ok(())
    }

    // A reply sender dropped while we are still open means the actor gave up
    // on the request; otherwise the map was closed under us.
    fn lost_reply(&self) -> SafeMapError {
        if self.is_closed() {
            SafeMapError::Closed
        } else {
            SafeMapError::Aborted
        }
    }

    async fn send(&self, command: Command<V>) -> Result<()> {
        self.check()?;
        self.enqueue(command).await
    }

    fn blocking_send(&self, command: Command<V>) -> Result<()> {
        self.check()?;
        self.blocking_enqueue(command)
    }

    async fn enqueue(&self, command: Command<V>) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SafeMapError::Closed)
    }

    fn blocking_enqueue(&self, command: Command<V>) -> Result<()> {
        self.sender
            .blocking_send(command)
            .map_err(|_| SafeMapError::Closed)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command<V>) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| self.lost_reply())
    }

    fn blocking_request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command<V>,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.blocking_send(command(tx))?;
        rx.blocking_recv().map_err(|_| self.lost_reply())
    }
}

async fn within<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(SafeMapError::Timeout(limit)))
}

impl<V> Default for SafeMap<V>
where
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SafeMap<V>
where
    V: Clone + Send + 'static,
{
    /// Creates a map with default configuration and starts its actor.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context. Use
    /// [`SafeMap::with_config_on`] to start the actor from a plain thread.
    pub fn new() -> Self {
        Self::with_config(SafeMapConfig::default())
    }

    /// Creates a map with custom configuration on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    pub fn with_config(config: SafeMapConfig) -> Self {
        let Ok(runtime) = Handle::try_current() else {
            panic!(
                "safemap::SafeMap requires a Tokio runtime. \
                 Call SafeMap::new() or SafeMap::with_config() from within a \
                 #[tokio::main] or #[tokio::test] context, or use \
                 SafeMap::with_config_on() with an explicit runtime handle."
            );
        };
        Self::with_config_on(config, &runtime)
    }

    /// Creates a map whose actor is spawned on `runtime`.
    pub fn with_config_on(config: SafeMapConfig, runtime: &Handle) -> Self {
        let id = actor::next_id();
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let span = tracing::debug_span!(
            "safemap",
            id,
            name = config.name.as_deref().unwrap_or_default()
        );
        runtime.spawn(actor::run(Actor::new(id, rx)).instrument(span));

        Self {
            id,
            name: config.name.map(Arc::from),
            closing: Arc::new(AtomicBool::new(false)),
            sender: tx,
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// Nothing is reported back; follow with [`get`](Self::get) to observe it.
    pub async fn put(&self, key: impl Into<String>, value: V) -> Result<()> {
        self.send(Command::Put {
            key: key.into(),
            value,
        })
        .await
    }

    /// Removes `key` if present. Nothing is reported back.
    pub async fn remove(&self, key: impl Into<String>) -> Result<()> {
        self.send(Command::Remove { key: key.into() }).await
    }

    /// Returns a clone of the value under `key`, `None` if absent.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<V>> {
        let key = key.into();
        self.request(|tx| Command::Get {
            key,
            reply: Reply::Channel(tx),
        })
        .await
    }

    /// Queues a lookup whose result is handed to `callback` on the actor.
    ///
    /// Returns once the command is accepted, not once it has run.
    pub async fn get_with<F>(&self, key: impl Into<String>, callback: F) -> Result<()>
    where
        F: FnOnce(Option<V>) + Send + 'static,
    {
        self.send(Command::Get {
            key: key.into(),
            reply: Reply::callback(callback),
        })
        .await
    }

    /// Like [`get`](Self::get) but gives up after `limit`.
    pub async fn get_timeout(&self, key: impl Into<String>, limit: Duration) -> Result<Option<V>> {
        within(limit, self.get(key)).await
    }

    /// Number of entries currently stored.
    pub async fn len(&self) -> Result<usize> {
        self.request(|tx| Command::Length {
            reply: Reply::Channel(tx),
        })
        .await
    }

    /// Whether the map currently holds no entries.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Queues a length query whose result is handed to `callback` on the actor.
    pub async fn len_with<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(usize) + Send + 'static,
    {
        self.send(Command::Length {
            reply: Reply::callback(callback),
        })
        .await
    }

    /// Like [`len`](Self::len) but gives up after `limit`.
    pub async fn len_timeout(&self, limit: Duration) -> Result<usize> {
        within(limit, self.len()).await
    }

    /// Atomically replaces the value under `key` with `updater(current)`.
    ///
    /// `current` is `None` when the key is absent, in which case the result
    /// is inserted. Returns the stored value. No other command runs between
    /// reading `current` and storing the result.
    ///
    /// If `updater` panics the entry is left as it was and this returns
    /// [`SafeMapError::Aborted`].
    pub async fn update<F>(&self, key: impl Into<String>, updater: F) -> Result<V>
    where
        F: FnOnce(Option<&V>) -> V + Send + 'static,
    {
        let key = key.into();
        self.request(|tx| Command::Update {
            key,
            updater: Box::new(updater),
            reply: Reply::Channel(tx),
        })
        .await
    }

    /// Queues an atomic update; `callback` receives the stored value on the actor.
    ///
    /// If `updater` panics the entry is left as it was and `callback` is
    /// dropped without being called. Use [`update`](Self::update) when the
    /// outcome must be observed.
    pub async fn update_with<F, C>(&self, key: impl Into<String>, updater: F, callback: C) -> Result<()>
    where
        F: FnOnce(Option<&V>) -> V + Send + 'static,
        C: FnOnce(V) + Send + 'static,
    {
        self.send(Command::Update {
            key: key.into(),
            updater: Box::new(updater),
            reply: Reply::callback(callback),
        })
        .await
    }

    /// Like [`update`](Self::update) but stops waiting after `limit`.
    ///
    /// A command that was already accepted still runs; only the wait ends.
    pub async fn update_timeout<F>(&self, key: impl Into<String>, updater: F, limit: Duration) -> Result<V>
    where
        F: FnOnce(Option<&V>) -> V + Send + 'static,
    {
        within(limit, self.update(key, updater)).await
    }

    /// Shuts the actor down and returns the live store itself.
    ///
    /// Every call issued on any clone of this handle once `close` has
    /// started fails with [`SafeMapError::Closed`], as does a second close.
    pub async fn close(&self) -> Result<HashMap<String, V>> {
        self.begin_close()?;
        let (reply, rx) = oneshot::channel();
        self.enqueue(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| SafeMapError::Closed)
    }

    /// Blocking form of [`put`](Self::put).
    ///
    /// # Panics
    ///
    /// The `blocking_*` methods panic if called from within an asynchronous
    /// execution context; use them from plain threads.
    pub fn blocking_put(&self, key: impl Into<String>, value: V) -> Result<()> {
        self.blocking_send(Command::Put {
            key: key.into(),
            value,
        })
    }

    /// Blocking form of [`remove`](Self::remove).
    pub fn blocking_remove(&self, key: impl Into<String>) -> Result<()> {
        self.blocking_send(Command::Remove { key: key.into() })
    }

    /// Blocking form of [`get`](Self::get).
    pub fn blocking_get(&self, key: impl Into<String>) -> Result<Option<V>> {
        let key = key.into();
        self.blocking_request(|tx| Command::Get {
            key,
            reply: Reply::Channel(tx),
        })
    }

    /// Blocking form of [`len`](Self::len).
    pub fn blocking_len(&self) -> Result<usize> {
        self.blocking_request(|tx| Command::Length {
            reply: Reply::Channel(tx),
        })
    }

    /// Blocking form of [`update`](Self::update).
    pub fn blocking_update<F>(&self, key: impl Into<String>, updater: F) -> Result<V>
    where
        F: FnOnce(Option<&V>) -> V + Send + 'static,
    {
        let key = key.into();
        self.blocking_request(|tx| Command::Update {
            key,
            updater: Box::new(updater),
            reply: Reply::Channel(tx),
        })
    }

    /// Blocking form of [`close`](Self::close).
    pub fn blocking_close(&self) -> Result<HashMap<String, V>> {
        self.begin_close()?;
        let (reply, rx) = oneshot::channel();
        self.blocking_enqueue(Command::Shutdown { reply })?;
        rx.blocking_recv().map_err(|_| SafeMapError::Closed)
    }
}

/// Snapshots need values that survive a serde round trip.
impl<V> SafeMap<V>
where
    V: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    /// Returns a deep copy of every entry as of the moment it is processed.
    ///
    /// The copy shares nothing with the live values, so either side may be
    /// mutated freely. A value that fails to serialize or deserialize makes
    /// the whole call fail with [`SafeMapError::Snapshot`].
    pub async fn snapshot(&self) -> Result<HashMap<String, V>> {
        self.request(|reply| Command::Snapshot {
            copy: deep_copy::<Store<V>>,
            reply,
        })
        .await?
    }

    /// Like [`snapshot`](Self::snapshot) but gives up after `limit`.
    pub async fn snapshot_timeout(&self, limit: Duration) -> Result<HashMap<String, V>> {
        within(limit, self.snapshot()).await
    }

    /// Blocking form of [`snapshot`](Self::snapshot).
    pub fn blocking_snapshot(&self) -> Result<HashMap<String, V>> {
        self.blocking_request(|reply| Command::Snapshot {
            copy: deep_copy::<Store<V>>,
            reply,
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let map: SafeMap<i32> = SafeMap::new();
        map.put("a", 1).await.unwrap();
        assert_eq!(map.get("a").await.unwrap(), Some(1));
        assert_eq!(map.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_the_actor() {
        let map: SafeMap<String> = SafeMap::new();
        let other = map.clone();
        map.put("a", "x".to_string()).await.unwrap();
        assert_eq!(other.get("a").await.unwrap().as_deref(), Some("x"));
        assert!(other.close().await.is_ok());
        assert!(map.is_closed());
    }

    #[tokio::test]
    async fn test_name_and_debug() {
        let map: SafeMap<u8> = SafeMap::with_config(SafeMapConfig::new().with_name("users"));
        assert_eq!(map.name(), Some("users"));
        assert!(format!("{map:?}").contains("users"));
    }

    #[test]
    #[should_panic(expected = "requires a Tokio runtime")]
    fn test_new_outside_runtime_panics() {
        let _map: SafeMap<u8> = SafeMap::new();
    }

    #[test]
    fn test_blocking_api_from_plain_thread() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let map: SafeMap<u32> = SafeMap::with_config_on(SafeMapConfig::default(), runtime.handle());

        map.blocking_put("a", 1u32).unwrap();
        assert_eq!(map.blocking_update("a", |v| v.copied().unwrap_or(0) + 1).unwrap(), 2);
        assert_eq!(map.blocking_get("a").unwrap(), Some(2));
        map.blocking_remove("a").unwrap();
        assert_eq!(map.blocking_len().unwrap(), 0);
        assert!(map.blocking_close().unwrap().is_empty());
        assert!(matches!(map.blocking_len(), Err(SafeMapError::Closed)));
        assert!(matches!(map.blocking_close(), Err(SafeMapError::Closed)));
    }

    #[tokio::test]
    async fn test_closing_flag_rejects_before_shutdown_is_processed() {
        let map: SafeMap<u32> = SafeMap::new();
        map.put("a", 1).await.unwrap();

        // Claim the close without queueing the Shutdown yet.
        map.begin_close().unwrap();
        assert!(map.is_closed());
        assert!(map.put("late", 2).await.unwrap_err().is_closed());
        assert!(map.len_with(|_| {}).await.unwrap_err().is_closed());
        assert!(map.close().await.unwrap_err().is_closed());
    }
}
