//! A minimal collection-oriented document store.
//!
//! `spec.md` treats the persistent store as an opaque external collaborator: filtered
//! find/insert/update plus a monotonic row-id allocator. This module defines that
//! boundary as a trait so the rest of the core pipeline never depends on a concrete
//! storage engine, and ships one in-process implementation (`MemoryStore`) so the
//! pipeline is runnable end to end.

pub mod memory;

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// A globally ordered opaque identifier. Comparable; zero is the "unset" sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RowId(pub u64);

impl RowId {
    pub const ZERO: RowId = RowId(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strictly-after-or-before, ascending/descending row-id pagination, per spec.md §6.
#[derive(Debug, Clone, Copy, Default)]
pub struct Page {
    pub from: Option<RowId>,
    pub to: Option<RowId>,
    pub limit: Option<usize>,
}

/// A collection name within the store (`rules`, `connections`, `connection_streams`,
/// `pcap_sessions`, `settings`, per spec.md §6).
pub type Collection = &'static str;

/// The document-store contract the core pipeline relies on.
///
/// `T` is the document type for a given collection; callers pick the collection by
/// calling through a typed wrapper (see `store::memory::MemoryStore::collection`).
pub trait Store<T>: Send + Sync
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Allocates a new row id and inserts `doc`, returning the assigned id.
    fn insert(&self, doc: T) -> crate::error::Result<RowId>
    where
        T: HasRowId;

    /// Replaces the document at `id` if present, otherwise returns `NotFound`.
    fn update(&self, id: RowId, doc: T) -> crate::error::Result<()>
    where
        T: HasRowId;

    /// Fetches a single document by id.
    fn get(&self, id: RowId) -> crate::error::Result<T>;

    /// Returns all documents matching `predicate`, ordered by ascending row id and
    /// paginated per `page`.
    fn find(&self, page: Page, predicate: impl Fn(&T) -> bool) -> Vec<T>;
}

/// Implemented by documents that carry their own `RowId`, so `Store::insert` can stamp
/// the allocated id back into the document before persisting it.
pub trait HasRowId {
    fn row_id(&self) -> RowId;
    fn set_row_id(&mut self, id: RowId);
}
