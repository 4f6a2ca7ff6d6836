//! Document store contract used by the saga flows, plus an in-memory store.
//!
//! Persistence itself belongs to each business service; the flows only need
//! keyed insert/get/update/delete/list.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document {0} already exists")]
    Duplicate(String),
    #[error("document {0} not found")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed document storage.
#[async_trait]
pub trait DocumentStore<T>: Send + Sync {
    /// # Errors
    ///
    /// [`StoreError::Duplicate`] when `id` is taken.
    async fn insert(&self, id: &str, document: T) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<T>, StoreError>;

    /// # Errors
    ///
    /// [`StoreError::NotFound`] when `id` does not exist.
    async fn update(&self, id: &str, document: T) -> Result<(), StoreError>;

    /// Returns whether a document was removed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<T>, StoreError>;
}

/// In-memory [`DocumentStore`] with switchable write failures.
#[derive(Debug)]
pub struct MemoryStore<T> {
    documents: DashMap<String, T>,
    fail_deletes: AtomicBool,
    fail_updates: AtomicBool,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            documents: DashMap::new(),
            fail_deletes: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
        }
    }
}

impl<T> MemoryStore<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `delete` fail with [`StoreError::Unavailable`].
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `update` fail with [`StoreError::Unavailable`].
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }
}

#[async_trait]
impl<T> DocumentStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn insert(&self, id: &str, document: T) -> Result<(), StoreError> {
        match self.documents.entry(id.to_string()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(document);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.documents.get(id).map(|d| d.value().clone()))
    }

    async fn update(&self, id: &str, document: T) -> Result<(), StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("update rejected".to_string()));
        }
        match self.documents.get_mut(id) {
            Some(mut existing) => {
                *existing = document;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("delete rejected".to_string()));
        }
        Ok(self.documents.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.documents.iter().map(|d| d.value().clone()).collect())
    }
}
