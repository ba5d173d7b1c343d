//! Write/stat coordination.
//!
//! A writer creating a node holds a resource lock on the node's keys (its
//! path and uid) until the node is committed, and publishes the entry as
//! soon as it exists. A concurrent `stat` for a locked key waits for
//! whichever comes first, the lock release or the published entry, and
//! detaches from the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, watch};

use cumulus_types::FsEntry;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keys currently held by a writer.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    held: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

/// Releases its key on drop and wakes every waiter.
#[derive(Debug)]
pub struct ResourceGuard {
    key: String,
    held: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Some(tx) = locked(&self.held).remove(&self.key) {
            tx.send_replace(true);
        }
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `key`, waiting for any current holder to release it.
    pub async fn lock(&self, key: &str) -> ResourceGuard {
        loop {
            let rx = {
                let mut held = locked(&self.held);
                match held.get(key) {
                    Some(tx) => tx.subscribe(),
                    None => {
                        let (tx, _) = watch::channel(false);
                        held.insert(key.to_string(), tx);
                        return ResourceGuard {
                            key: key.to_string(),
                            held: Arc::clone(&self.held),
                        };
                    }
                }
            };
            wait_released(rx).await;
        }
    }

    /// Take `key` only if nobody holds it.
    pub fn try_lock(&self, key: &str) -> Option<ResourceGuard> {
        let mut held = locked(&self.held);
        if held.contains_key(key) {
            return None;
        }
        let (tx, _) = watch::channel(false);
        held.insert(key.to_string(), tx);
        Some(ResourceGuard {
            key: key.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_locked(&self, key: &str) -> bool {
        locked(&self.held).contains_key(key)
    }

    /// Resolves once `key` is not held. Immediate if it is free now.
    pub async fn wait_free(&self, key: &str) {
        let rx = match locked(&self.held).get(key) {
            Some(tx) => tx.subscribe(),
            None => return,
        };
        wait_released(rx).await;
    }
}

async fn wait_released(mut rx: watch::Receiver<bool>) {
    // a closed channel means the guard is gone as well
    let _ = rx.wait_for(|released| *released).await;
}

#[derive(Debug, Default)]
struct EntryTable {
    in_flight: HashMap<String, FsEntry>,
    listeners: HashMap<String, HashMap<u64, oneshot::Sender<FsEntry>>>,
    next_listener: u64,
}

/// Entries that exist but whose writer has not released them yet.
#[derive(Debug, Clone, Default)]
pub struct EntryRegistry {
    table: Arc<Mutex<EntryTable>>,
}

/// A registration waiting for an entry to appear under one key.
///
/// Dropping the listener deregisters it, whether or not it fired.
#[derive(Debug)]
pub struct EntryListener {
    key: String,
    id: u64,
    rx: oneshot::Receiver<FsEntry>,
    table: Arc<Mutex<EntryTable>>,
}

impl EntryListener {
    /// The published entry, or `None` if the registry went away.
    pub async fn recv(&mut self) -> Option<FsEntry> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for EntryListener {
    fn drop(&mut self) {
        let mut table = locked(&self.table);
        if let Some(listeners) = table.listeners.get_mut(&self.key) {
            listeners.remove(&self.id);
            if listeners.is_empty() {
                table.listeners.remove(&self.key);
            }
        }
    }
}

impl EntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, key: &str) -> EntryListener {
        let (tx, rx) = oneshot::channel();
        let mut table = locked(&self.table);
        let id = table.next_listener;
        table.next_listener += 1;
        table
            .listeners
            .entry(key.to_string())
            .or_default()
            .insert(id, tx);
        EntryListener {
            key: key.to_string(),
            id,
            rx,
            table: Arc::clone(&self.table),
        }
    }

    /// Make `entry` visible under every key and wake their listeners.
    pub fn publish(&self, keys: &[String], entry: &FsEntry) {
        let mut table = locked(&self.table);
        for key in keys {
            table.in_flight.insert(key.clone(), entry.clone());
            if let Some(listeners) = table.listeners.remove(key) {
                for (_, tx) in listeners {
                    let _ = tx.send(entry.clone());
                }
            }
        }
    }

    pub fn in_flight(&self, key: &str) -> Option<FsEntry> {
        locked(&self.table).in_flight.get(key).cloned()
    }

    /// Forget the in-flight entries once the writer has committed.
    pub fn complete(&self, keys: &[String]) {
        let mut table = locked(&self.table);
        for key in keys {
            table.in_flight.remove(key);
        }
    }

    pub fn listener_count(&self, key: &str) -> usize {
        locked(&self.table)
            .listeners
            .get(key)
            .map_or(0, HashMap::len)
    }
}

/// Wait out a writer holding `key`.
///
/// Returns the freshest in-flight entry if one was published, `None` when
/// the caller should fall back to a cold lookup.
pub async fn wait_pending(
    resources: &ResourceRegistry,
    entries: &EntryRegistry,
    key: &str,
) -> Option<FsEntry> {
    if !resources.is_locked(key) {
        return entries.in_flight(key);
    }

    tracing::debug!(key, "node is being written, waiting");
    let mut listener = entries.listen(key);
    tokio::select! {
        _ = resources.wait_free(key) => {
            tracing::debug!(key, "writer released node");
        }
        entry = listener.recv() => {
            if let Some(entry) = entry {
                tracing::debug!(key, uid = %entry.uid, "in-flight entry published");
                return Some(entry);
            }
        }
    }
    drop(listener);
    entries.in_flight(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn entry(path: &str) -> FsEntry {
        FsEntry {
            uid: Uuid::new_v4(),
            id: None,
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            path: path.to_string(),
            parent_uid: Some(Uuid::new_v4()),
            size: 0,
            is_dir: false,
            immutable: false,
            owner_id: None,
            modified: 0,
            created: 0,
            thumbnail: None,
            versions: None,
            shares: None,
            subdomains: None,
        }
    }

    #[tokio::test]
    async fn lock_waits_for_release() {
        let resources = ResourceRegistry::new();
        let guard = resources.lock("/a").await;
        assert!(resources.try_lock("/a").is_none());

        let r = resources.clone();
        let waiter = tokio::spawn(async move {
            let _g = r.lock("/a").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(!resources.is_locked("/a"));
    }

    #[tokio::test]
    async fn wait_pending_prefers_published_entry() {
        let resources = ResourceRegistry::new();
        let entries = EntryRegistry::new();
        let guard = resources.lock("/a/b").await;

        let (r, e) = (resources.clone(), entries.clone());
        let stat = tokio::spawn(async move { wait_pending(&r, &e, "/a/b").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(entries.listener_count("/a/b"), 1);

        let published = entry("/a/b");
        entries.publish(&["/a/b".to_string()], &published);
        assert_eq!(stat.await.unwrap(), Some(published));
        assert_eq!(entries.listener_count("/a/b"), 0);
        drop(guard);
    }

    #[tokio::test]
    async fn losing_listener_is_detached() {
        let resources = ResourceRegistry::new();
        let entries = EntryRegistry::new();
        let guard = resources.lock("/x").await;

        let (r, e) = (resources.clone(), entries.clone());
        let stat = tokio::spawn(async move { wait_pending(&r, &e, "/x").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert_eq!(stat.await.unwrap(), None);
        assert_eq!(entries.listener_count("/x"), 0);
    }
}
