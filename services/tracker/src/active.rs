//! Active tracking-cycle registry.
//!
//! A sharded map from broadcaster id to the cycle's end signal. Sits on
//! the hot path of every online/offline event, so instead of one global
//! lock the key space is split across independently-locked shards by FNV
//! hash. The only operations the planner needs are insert-if-absent, get,
//! pop, and identity-guarded removal.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use vf_core::util::fnv32;

const SHARD_COUNT: usize = 32;

/// Single-close broadcast used to terminate a running cycle.
///
/// One producer (the offline handler or planner stop) fires it; the
/// cycle task observes it through a subscribed receiver. Close is final;
/// a signal is never reused across cycles.
#[derive(Debug, Clone)]
pub struct EndSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl EndSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Idempotent.
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Whether both handles refer to the same underlying signal.
    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

impl Default for EndSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Sharded `broadcaster_id -> EndSignal` map. At most one entry per key
/// at any instant; insertion is atomic test-and-set, removal is atomic
/// take-and-delete.
pub struct ActiveCycles {
    shards: Vec<Mutex<HashMap<String, EndSignal>>>,
}

impl ActiveCycles {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::default()).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, EndSignal>> {
        &self.shards[fnv32(key) as usize % SHARD_COUNT]
    }

    /// Insert `signal` under `key` only if no cycle is registered there.
    /// Returns false when an entry already exists.
    pub fn insert_if_absent(&self, key: &str, signal: EndSignal) -> bool {
        let mut shard = self.shard(key).lock().unwrap();
        match shard.entry(key.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(signal);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<EndSignal> {
        self.shard(key).lock().unwrap().get(key).cloned()
    }

    /// Atomically take and delete the entry under `key`.
    pub fn pop(&self, key: &str) -> Option<EndSignal> {
        self.shard(key).lock().unwrap().remove(key)
    }

    /// Remove the entry under `key` only if it still holds `signal`.
    ///
    /// A finished cycle unregisters itself with this instead of a plain
    /// pop: if the offline handler already popped the entry and a new
    /// cycle registered in the meantime, the stale cleanup must not evict
    /// the successor.
    pub fn remove_entry(&self, key: &str, signal: &EndSignal) {
        let mut shard = self.shard(key).lock().unwrap();
        if shard.get(key).is_some_and(|held| held.same(signal)) {
            shard.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ActiveCycles {
    fn default() -> Self {
        Self::new()
    }
}
