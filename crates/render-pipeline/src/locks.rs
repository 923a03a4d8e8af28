//! Per-source generation locks
//!
//! At most one transcode runs per key. Entries are reference counted: a key
//! stays in the table only while a holder or waiter refers to it, so the
//! table does not grow with the size of the library.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Default, Clone)]
pub struct GenerationLocks {
    table: Table,
}

/// Held while generating for one key; releases and cleans up on drop
pub struct GenerationGuard {
    key: String,
    entry: Arc<AsyncMutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
    table: Table,
}

impl GenerationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> GenerationGuard {
        let entry = {
            let mut table = self.table.lock();
            Arc::clone(table.entry(key.to_string()).or_default())
        };

        let mut guard = GenerationGuard {
            key: key.to_string(),
            entry,
            held: None,
            table: Arc::clone(&self.table),
        };
        guard.held = Some(Arc::clone(&guard.entry).lock_owned().await);
        guard
    }

    /// Keys currently held or waited on
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GenerationGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        // Release first so the owned guard's reference is gone
        self.held.take();

        let mut table = self.table.lock();
        // One reference in the table, one here: nobody else is waiting
        if Arc::strong_count(&self.entry) == 2 {
            table.remove(&self.key);
        }
    }
}
