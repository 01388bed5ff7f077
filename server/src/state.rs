//! Shared application state handed to every route handler.

use caronte_core::assembler::AssemblerConfig;
use caronte_core::config::Config;
use caronte_core::model::{Connection, ConnectionStream, Settings};
use caronte_core::rescan::{self, RescanQueue, RescanWorker};
use caronte_core::rules::RuleRegistry;
use caronte_core::session::SessionManager;
use caronte_core::store::memory::MemoryStore;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

pub struct AppState {
    pub config: RwLock<Config>,
    pub rules: Arc<RuleRegistry>,
    pub connections: Arc<MemoryStore<Connection>>,
    pub streams: Arc<MemoryStore<ConnectionStream>>,
    pub sessions: Arc<SessionManager>,
    /// The `settings` collection `POST /setup` writes through; `config` above is an
    /// in-memory cache of its one row, kept for lock-free-ish fast access the way
    /// `RuleRegistry` caches its compiled database alongside its `rules` collection.
    pub settings: Arc<MemoryStore<Settings>>,
    pub rescan: RescanQueue,
    /// Raw capture bytes, keyed by `PcapSession` id, so `downloadSession` can return
    /// byte-identical content (spec.md §8 invariant 6). Held in memory alongside the
    /// document store's `MemoryStore` backend, which is itself a placeholder for a
    /// real persistent collection store.
    pub captures: RwLock<std::collections::HashMap<u64, Vec<u8>>>,
    /// Flipped by the `caronted` binary's Ctrl+C handler so in-flight scans abort
    /// cleanly instead of racing process exit (spec.md §7).
    pub shutdown: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: Config) -> (Arc<AppState>, RescanWorker) {
        let rules = Arc::new(RuleRegistry::new().expect("empty rule database always compiles"));
        let connections = Arc::new(MemoryStore::new());
        let streams = Arc::new(MemoryStore::new());
        let settings = Arc::new(MemoryStore::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let assembler_config = AssemblerConfig {
            block_gap: config.block_gap(),
            idle_flow: config.idle_flow(),
        };
        let sessions = Arc::new(SessionManager::new(
            connections.clone(),
            streams.clone(),
            rules.clone(),
            assembler_config,
            config.max_chunk_bytes,
            shutdown.clone(),
        ));
        let (rescan_queue, rescan_worker) = rescan::channel(connections.clone(), streams.clone());

        let state = Arc::new(AppState {
            config: RwLock::new(config),
            rules,
            connections,
            streams,
            sessions,
            settings,
            rescan: rescan_queue,
            captures: RwLock::new(std::collections::HashMap::new()),
            shutdown,
        });
        (state, rescan_worker)
    }
}
