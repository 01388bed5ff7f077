//! An in-process `Store` implementation backed by an insertion-ordered map.
//!
//! Row ids are allocated from a single `AtomicU64` counter shared by every collection
//! in the store, so ids are monotonic across the whole store rather than per
//! collection -- simpler to reason about, and cheap since collections are small
//! relative to a CTF's packet volume.

use super::{HasRowId, Page, RowId, Store};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore<T> {
    rows: RwLock<IndexMap<RowId, T>>,
    next_id: AtomicU64,
}

impl<T> MemoryStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    pub fn new() -> Self {
        MemoryStore {
            rows: RwLock::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> RowId {
        RowId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl<T> Store<T> for MemoryStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    fn insert(&self, mut doc: T) -> Result<RowId>
    where
        T: HasRowId,
    {
        let id = self.alloc_id();
        doc.set_row_id(id);
        let mut rows = self
            .rows
            .write()
            .map_err(|_| Error::internal("store lock poisoned"))?;
        rows.insert(id, doc);
        Ok(id)
    }

    fn update(&self, id: RowId, doc: T) -> Result<()>
    where
        T: HasRowId,
    {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| Error::internal("store lock poisoned"))?;
        if !rows.contains_key(&id) {
            return Err(Error::not_found(format!("row {} not found", id)));
        }
        rows.insert(id, doc);
        Ok(())
    }

    fn get(&self, id: RowId) -> Result<T> {
        let rows = self
            .rows
            .read()
            .map_err(|_| Error::internal("store lock poisoned"))?;
        rows.get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("row {} not found", id)))
    }

    fn find(&self, page: Page, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let rows = match self.rows.read() {
            Ok(r) => r,
            Err(_) => return vec![],
        };
        let limit = page.limit.unwrap_or(usize::MAX);

        if let Some(to) = page.to {
            // Descending by id, strictly-before `to`.
            rows.iter()
                .rev()
                .filter(|(id, doc)| **id < to && predicate(doc))
                .take(limit)
                .map(|(_, doc)| doc.clone())
                .collect()
        } else {
            let from = page.from.unwrap_or(RowId::ZERO);
            rows.iter()
                .filter(|(id, doc)| **id > from && predicate(doc))
                .take(limit)
                .map(|(_, doc)| doc.clone())
                .collect()
        }
    }
}
