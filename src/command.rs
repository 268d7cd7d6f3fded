use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::Result;

pub(crate) type Store<V> = HashMap<String, V>;

/// Computes the new value for a key from its current one, `None` if absent.
pub(crate) type Updater<V> = Box<dyn FnOnce(Option<&V>) -> V + Send>;

/// Produces an independent copy of the whole store.
pub(crate) type DeepCopy<V> = fn(&Store<V>) -> Result<Store<V>>;

/// Where the actor delivers a result.
pub(crate) enum Reply<T> {
    /// A caller is waiting on the other end.
    Channel(oneshot::Sender<T>),
    /// Invoked from inside the actor when the command is processed.
    Callback(Box<dyn FnOnce(T) + Send>),
}

impl<T> Reply<T> {
    pub(crate) fn callback(f: impl FnOnce(T) + Send + 'static) -> Self {
        Reply::Callback(Box::new(f))
    }
}

/// One requested operation. Created per call and consumed exactly once.
pub(crate) enum Command<V> {
    Put {
        key: String,
        value: V,
    },
    Remove {
        key: String,
    },
    Get {
        key: String,
        reply: Reply<Option<V>>,
    },
    Length {
        reply: Reply<usize>,
    },
    Update {
        key: String,
        updater: Updater<V>,
        reply: Reply<V>,
    },
    Snapshot {
        copy: DeepCopy<V>,
        reply: oneshot::Sender<Result<Store<V>>>,
    },
    Shutdown {
        reply: oneshot::Sender<Store<V>>,
    },
}

impl<V> Command<V> {
    pub(crate) fn action(&self) -> &'static str {
        match self {
            Command::Put { .. } => "put",
            Command::Remove { .. } => "remove",
            Command::Get { .. } => "get",
            Command::Length { .. } => "length",
            Command::Update { .. } => "update",
            Command::Snapshot { .. } => "snapshot",
            Command::Shutdown { .. } => "shutdown",
        }
    }

    pub(crate) fn key(&self) -> Option<&str> {
        match self {
            Command::Put { key, .. }
            | Command::Remove { key }
            | Command::Get { key, .. }
            | Command::Update { key, .. } => Some(key.as_str()),
            Command::Length { .. } | Command::Snapshot { .. } | Command::Shutdown { .. } => None,
        }
    }
}
