//! Versioned key/value storage of JSON documents with optimistic concurrency.
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    errors::StorageError,
    utils::{metadata_str, resource_version, set_metadata_field},
};

/// Number of attempts of a guaranteed update without resource version precondition.
const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Number of past events kept to resume watches.
const WATCH_HISTORY: usize = 1000;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
}

impl WatchEvent {
    pub fn object(&self) -> &Value {
        match self {
            WatchEvent::Added(v) | WatchEvent::Modified(v) | WatchEvent::Deleted(v) => v,
        }
    }
}

pub(crate) type WatchStream = BoxStream<'static, Result<WatchEvent, StorageError>>;

/// Preconditions of writes, a mismatch is a [`StorageError::Conflict`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

impl Preconditions {
    pub fn check(&self, key: &str, existing: &Value) -> Result<(), StorageError> {
        if let Some(uid) = &self.uid {
            let actual = metadata_str(existing, "uid").unwrap_or_default();
            if uid != actual {
                return Err(StorageError::Conflict {
                    key: key.to_string(),
                    message: format!(
                        "Precondition failed: UID in precondition: {}, UID in object meta: {}",
                        uid, actual
                    ),
                });
            }
        }
        if let Some(rv) = &self.resource_version {
            let actual = metadata_str(existing, "resourceVersion").unwrap_or_default();
            if rv != actual {
                return Err(StorageError::Conflict {
                    key: key.to_string(),
                    message: "the object has been modified; please apply your changes to the latest version and try again".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Transform of a guaranteed update, gets the current object (`None` if it
/// does not exist and missing objects are tolerated) and returns the new one.
pub(crate) type UpdateFn<'a> =
    dyn FnMut(Option<Value>) -> Result<Value, StorageError> + Send + 'a;

#[async_trait]
pub(crate) trait Storage: Send + Sync {
    /// Stores a new object, fails with `AlreadyExists` if the key is taken.
    async fn create(&self, key: &str, obj: Value) -> Result<Value, StorageError>;

    async fn get(&self, key: &str) -> Result<Value, StorageError>;

    /// All objects with keys below `prefix` and the current resource version.
    async fn list(&self, prefix: &str) -> Result<(Vec<Value>, u64), StorageError>;

    /// Events for keys below `prefix` that happened after `resource_version`.
    async fn watch(&self, prefix: &str, resource_version: u64) -> Result<WatchStream, StorageError>;

    /// Writes `obj` only if the stored resource version equals `expected_version`,
    /// `0` meaning the key must not exist.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        obj: Value,
    ) -> Result<Value, StorageError>;

    async fn delete(&self, key: &str, preconditions: &Preconditions) -> Result<Value, StorageError>;

    /// Read-modify-write loop on top of [`Storage::compare_and_swap`]. Without a
    /// resource version precondition a concurrent modification re-runs `transform`
    /// against the fresh object.
    async fn guaranteed_update(
        &self,
        key: &str,
        preconditions: &Preconditions,
        ignore_not_found: bool,
        transform: &mut UpdateFn<'_>,
    ) -> Result<Value, StorageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let existing = match self.get(key).await {
                Ok(v) => Some(v),
                Err(StorageError::NotFound(_)) if ignore_not_found => None,
                Err(e) => return Err(e),
            };
            if let Some(existing) = &existing {
                preconditions.check(key, existing)?;
            }
            let expected = existing.as_ref().map_or(0, resource_version);
            let updated = transform(existing.clone())?;
            if let Some(existing) = existing {
                if same_content(&existing, &updated) {
                    return Ok(existing);
                }
            }
            match self.compare_and_swap(key, expected, updated).await {
                Err(StorageError::Conflict { .. }) | Err(StorageError::AlreadyExists(_))
                    if preconditions.resource_version.is_none()
                        && attempt < MAX_UPDATE_ATTEMPTS =>
                {
                    debug!("retrying update of {} after concurrent modification", key);
                    continue;
                }
                r => return r,
            }
        }
    }
}

/// Deep equality ignoring the resource version.
fn same_content(a: &Value, b: &Value) -> bool {
    let strip = |v: &Value| {
        let mut v = v.clone();
        if let Some(m) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            m.remove("resourceVersion");
        }
        v
    };
    strip(a) == strip(b)
}

struct Inner {
    revision: u64,
    objects: BTreeMap<String, Value>,
    history: VecDeque<(u64, String, WatchEvent)>,
}

impl Inner {
    fn record(
        &mut self,
        tx: &broadcast::Sender<(u64, String, WatchEvent)>,
        key: &str,
        event: WatchEvent,
    ) {
        let entry = (self.revision, key.to_string(), event);
        if self.history.len() >= WATCH_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(entry.clone());
        // No receivers is fine.
        let _ = tx.send(entry);
    }

    fn next_revision(&mut self, obj: &mut Value) -> u64 {
        self.revision += 1;
        set_metadata_field(obj, "resourceVersion", Value::String(self.revision.to_string()));
        self.revision
    }
}

/// In-memory [`Storage`].
pub(crate) struct MemoryStorage {
    inner: Mutex<Inner>,
    events: broadcast::Sender<(u64, String, WatchEvent)>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_HISTORY);
        Self {
            inner: Mutex::new(Inner {
                revision: 0,
                objects: Default::default(),
                history: Default::default(),
            }),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create(&self, key: &str, obj: Value) -> Result<Value, StorageError> {
        self.compare_and_swap(key, 0, obj).await
    }

    async fn get(&self, key: &str) -> Result<Value, StorageError> {
        self.lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<(Vec<Value>, u64), StorageError> {
        let inner = self.lock();
        let items = inner
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect();
        Ok((items, inner.revision))
    }

    async fn watch(&self, prefix: &str, resource_version: u64) -> Result<WatchStream, StorageError> {
        let inner = self.lock();
        let oldest = inner.history.front().map_or(inner.revision + 1, |(r, _, _)| *r);
        if resource_version + 1 < oldest && resource_version < inner.revision {
            return Err(StorageError::Expired(resource_version));
        }
        let backlog: Vec<Result<WatchEvent, StorageError>> = inner
            .history
            .iter()
            .filter(|(r, k, _)| *r > resource_version && k.starts_with(prefix))
            .map(|(_, _, e)| Ok(e.clone()))
            .collect();
        // Subscribe while holding the lock, so no event falls between backlog and live stream.
        let rx = self.events.subscribe();
        let after = inner.revision.max(resource_version);
        drop(inner);
        let prefix = prefix.to_string();
        let live = futures::stream::unfold(Some(rx), move |rx| {
            let prefix = prefix.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok((rev, key, event)) if rev > after && key.starts_with(&prefix) => {
                            return Some((Ok(event), Some(rx)));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => {
                            return Some((Err(StorageError::Expired(after)), None));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(futures::stream::iter(backlog).chain(live).boxed())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        mut obj: Value,
    ) -> Result<Value, StorageError> {
        let mut inner = self.lock();
        let event = match inner.objects.get(key) {
            None if expected_version == 0 => WatchEvent::Added as fn(Value) -> WatchEvent,
            None => return Err(StorageError::NotFound(key.to_string())),
            Some(_) if expected_version == 0 => {
                return Err(StorageError::AlreadyExists(key.to_string()));
            }
            Some(existing) if resource_version(existing) != expected_version => {
                return Err(StorageError::Conflict {
                    key: key.to_string(),
                    message: "the object has been modified; please apply your changes to the latest version and try again".to_string(),
                });
            }
            Some(_) => WatchEvent::Modified,
        };
        inner.next_revision(&mut obj);
        inner.objects.insert(key.to_string(), obj.clone());
        inner.record(&self.events, key, event(obj.clone()));
        Ok(obj)
    }

    async fn delete(&self, key: &str, preconditions: &Preconditions) -> Result<Value, StorageError> {
        let mut inner = self.lock();
        let existing = inner
            .objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        preconditions.check(key, existing)?;
        let mut obj = inner
            .objects
            .remove(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        inner.next_revision(&mut obj);
        inner.record(&self.events, key, WatchEvent::Deleted(obj.clone()));
        Ok(obj)
    }
}
