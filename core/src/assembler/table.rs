//! The in-memory flow table, sharded by a hash of the 4-tuple to reduce lock
//! contention across concurrently-processed flows (spec.md §5).

use super::flow::{Flow, FlowKey};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

const SHARD_COUNT: usize = 16;

pub struct FlowTable {
    shards: Vec<RwLock<HashMap<FlowKey, Flow>>>,
}

impl FlowTable {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        FlowTable { shards }
    }

    fn shard_for(&self, key: &FlowKey) -> &RwLock<HashMap<FlowKey, Flow>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Runs `f` against the flow for `key`, inserting a fresh one via `make` if it
    /// doesn't exist yet. Operations on a given flow are serialized by the shard's
    /// lock; distinct flows in distinct shards proceed independently.
    pub fn with_flow<R>(&self, key: FlowKey, make: impl FnOnce() -> Flow, f: impl FnOnce(&mut Flow) -> R) -> R {
        let shard = self.shard_for(&key);
        let mut guard = shard.write().expect("flow table shard lock poisoned");
        let flow = guard.entry(key).or_insert_with(make);
        f(flow)
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Flow> {
        let shard = self.shard_for(key);
        let mut guard = shard.write().expect("flow table shard lock poisoned");
        guard.remove(key)
    }

    /// Removes and returns every flow currently tracked, across all shards. Used for
    /// forced-flush at session end or shutdown (spec.md §4.6, §5).
    pub fn drain_all(&self) -> Vec<(FlowKey, Flow)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.write().expect("flow table shard lock poisoned");
            out.extend(guard.drain());
        }
        out
    }

    /// Removes and returns every flow idle for longer than `idle_timeout`.
    pub fn drain_idle(&self, now: chrono::DateTime<chrono::Utc>, idle_timeout: chrono::Duration) -> Vec<(FlowKey, Flow)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.write().expect("flow table shard lock poisoned");
            let idle_keys: Vec<FlowKey> = guard
                .iter()
                .filter(|(_, flow)| flow.idle_since(now, idle_timeout))
                .map(|(k, _)| *k)
                .collect();
            for key in idle_keys {
                if let Some(flow) = guard.remove(&key) {
                    out.push((key, flow));
                }
            }
        }
        out
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}
