use std::any::Any;
use std::cell::Cell;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::command::{Command, Reply, Store};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Map whose callback or updater is running on this thread right now.
    static ACTIVE: Cell<Option<u64>> = const { Cell::new(None) };
}

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Whether the current thread is inside user code run by map `id`.
pub(crate) fn is_reentrant(id: u64) -> bool {
    ACTIVE.with(|active| active.get() == Some(id))
}

struct ActiveGuard {
    previous: Option<u64>,
}

impl ActiveGuard {
    fn enter(id: u64) -> Self {
        let previous = ACTIVE.with(|active| active.replace(Some(id)));
        Self { previous }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.previous));
    }
}

/// Runs caller-supplied code on the actor. A panic is logged and turned into `None`.
fn guarded<R>(id: u64, what: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    let _active = ActiveGuard::enter(id);
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(payload) => {
            error!(what, panic = panic_message(&*payload), "panicked inside map actor");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

pub(crate) struct Actor<V> {
    id: u64,
    store: Store<V>,
    receiver: mpsc::Receiver<Command<V>>,
}

impl<V: Clone> Actor<V> {
    pub(crate) fn new(id: u64, receiver: mpsc::Receiver<Command<V>>) -> Self {
        let store = Store::new();
        Self { id, store, receiver }
    }

    fn respond<T>(&self, reply: Reply<T>, value: T) {
        match reply {
            // A caller that stopped waiting is not an error.
            Reply::Channel(tx) => {
                let _ = tx.send(value);
            }
            Reply::Callback(callback) => {
                guarded(self.id, "callback", move || callback(value));
            }
        }
    }

    fn handle(&mut self, command: Command<V>) -> ControlFlow<()> {
        match command {
            Command::Put { key, value } => {
                self.store.insert(key, value);
            }
            Command::Remove { key } => {
                self.store.remove(&key);
            }
            Command::Get { key, reply } => {
                let value = self.store.get(&key).cloned();
                self.respond(reply, value);
            }
            Command::Length { reply } => {
                let len = self.store.len();
                self.respond(reply, len);
            }
            Command::Update { key, updater, reply } => {
                let current = self.store.get(&key);
                // On panic the old value stays and the reply is dropped.
                if let Some(value) = guarded(self.id, "updater", || updater(current)) {
                    self.store.insert(key, value.clone());
                    self.respond(reply, value);
                }
            }
            Command::Snapshot { copy, reply } => {
                let store = &self.store;
                if let Some(result) = guarded(self.id, "snapshot", || copy(store)) {
                    if let Err(err) = &result {
                        warn!(%err, entries = store.len(), "snapshot failed");
                    }
                    let _ = reply.send(result);
                }
            }
            Command::Shutdown { reply } => {
                self.receiver.close();
                let store = std::mem::take(&mut self.store);
                debug!(entries = store.len(), "handing store to closer");
                let _ = reply.send(store);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Drops whatever was queued behind a shutdown, returning how many.
    fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(command) = self.receiver.try_recv() {
            warn!(
                action = command.action(),
                key = command.key(),
                "discarded command queued after shutdown"
            );
            dropped += 1;
        }
        dropped
    }
}

pub(crate) async fn run<V: Clone>(mut actor: Actor<V>) {
    debug!("map actor started");
    while let Some(command) = actor.receiver.recv().await {
        trace!(action = command.action(), key = command.key(), "processing command");
        if actor.handle(command).is_break() {
            let dropped = actor.discard_pending();
            debug!(dropped, "map actor closed");
            return;
        }
    }
    debug!(entries = actor.store.len(), "all handles dropped, map actor exiting");
}
