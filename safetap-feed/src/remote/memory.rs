/// In-process backend
use super::{RemoteChannel, SnapshotStream};
use crate::{
    model::{NewEntry, RemoteEntry, RemoteTimestamp},
    Error,
};
use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

const CHANGE_CAPACITY: usize = 64;

#[derive(Default)]
struct Failures {
    append: Option<String>,
    subscribe: Option<String>,
}

struct Inner {
    // Entries per collection, each with its normalized timestamp
    collections: Mutex<HashMap<String, Vec<(i64, RemoteEntry)>>>,
    // Carries the name of every collection that changed
    changes: Mutex<broadcast::Sender<String>>,
    failures: Mutex<Failures>,
}

/// Backend living in the current process
///
/// Clones share the same collections, which makes it usable both as an
/// offline backend and as a test double for several participants.
#[derive(Clone)]
pub struct MemoryChannel {
    inner: Arc<Inner>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                collections: Mutex::default(),
                changes: Mutex::new(broadcast::channel(CHANGE_CAPACITY).0),
                failures: Mutex::default(),
            }),
        }
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an entry as if another participant had written it
    pub fn insert(&self, collection: &str, entry: RemoteEntry) {
        let millis = entry
            .timestamp
            .as_ref()
            .and_then(|ts| ts.to_millis().ok())
            .unwrap_or_default();
        self.inner
            .collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push((millis, entry));
        // Nobody listening is fine
        let _ = self.inner.changes.lock().send(collection.to_string());
    }

    /// Latest `limit` entries of `collection`, oldest first
    pub fn snapshot(&self, collection: &str, limit: usize) -> Vec<RemoteEntry> {
        let collections = self.inner.collections.lock();
        let Some(entries) = collections.get(collection) else {
            return Vec::new();
        };
        let mut entries = entries.clone();
        entries.sort_by(|a, b| (a.0, &a.1.id).cmp(&(b.0, &b.1.id)));
        let skip = entries.len().saturating_sub(limit);
        entries.into_iter().skip(skip).map(|(_, entry)| entry).collect()
    }

    /// Makes every following append fail with `reason`, or succeed again
    pub fn fail_appends(&self, reason: Option<&str>) {
        self.inner.failures.lock().append = reason.map(String::from);
    }

    /// Makes every following subscribe fail with `reason`, or succeed again
    pub fn fail_subscribes(&self, reason: Option<&str>) {
        self.inner.failures.lock().subscribe = reason.map(String::from);
    }

    /// Ends every open subscription stream
    pub fn drop_subscriptions(&self) {
        *self.inner.changes.lock() = broadcast::channel(CHANGE_CAPACITY).0;
    }
}

#[async_trait]
impl RemoteChannel for MemoryChannel {
    async fn subscribe(&self, collection: &str, limit: usize) -> Result<SnapshotStream, Error> {
        let failure = self.inner.failures.lock().subscribe.clone();
        if let Some(reason) = failure {
            return Err(Error::RemoteSubscribe(reason));
        }
        let changes = self.inner.changes.lock().subscribe();
        let initial = self.snapshot(collection, limit);
        let this = self.clone();
        let collection = collection.to_string();
        let updates = stream::unfold(changes, move |mut changes| {
            let this = this.clone();
            let collection = collection.clone();
            async move {
                loop {
                    match changes.recv().await {
                        Ok(changed) if changed != collection => continue,
                        Ok(_) | Err(RecvError::Lagged(_)) => {
                            return Some((Ok(this.snapshot(&collection, limit)), changes))
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream::once(future::ready(Ok(initial))).chain(updates).boxed())
    }

    async fn append(&self, collection: &str, entry: NewEntry) -> Result<String, Error> {
        let failure = self.inner.failures.lock().append.clone();
        if let Some(reason) = failure {
            return Err(Error::RemoteWrite(reason));
        }
        let id = Uuid::new_v4().to_string();
        let NewEntry {
            sender_id,
            sender_name,
            text,
            timestamp,
        } = entry;
        self.insert(
            collection,
            RemoteEntry::new(
                id.clone(),
                sender_id,
                sender_name,
                text,
                RemoteTimestamp::Millis(timestamp),
            ),
        );
        Ok(id)
    }
}
