//! Resolves provider and category names to ids, creating missing rows.
//!
//! Ids learned inside a batch are staged and only become cached once the batch
//! commits. A rolled-back batch drops its staged ids, so a later batch never
//! points at a row that was never committed.

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::normalize::normalize_category_label;
use crate::store::{ReferenceKind, StoreTx, VoucherStore};

#[derive(Debug, Default)]
struct NameCache {
    committed: HashMap<String, u64>,
    staged: HashMap<String, u64>,
    staged_created: usize,
    created: usize,
}

impl NameCache {
    fn get(&self, name: &str) -> Option<u64> {
        self.staged
            .get(name)
            .or_else(|| self.committed.get(name))
            .copied()
    }

    fn stage(&mut self, name: &str, id: u64, created: bool) {
        self.staged.insert(name.to_string(), id);
        if created {
            self.staged_created += 1;
        }
    }

    fn commit(&mut self) {
        self.committed.extend(self.staged.drain());
        self.created += self.staged_created;
        self.staged_created = 0;
    }

    fn discard(&mut self) {
        self.staged.clear();
        self.staged_created = 0;
    }
}

/// Name to id caches for both reference tables.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    providers: NameCache,
    categories: NameCache,
}

impl ReferenceCache {
    /// Cache every live reference row currently in the store.
    pub async fn preload<S: VoucherStore>(store: &S) -> Result<Self, StoreError> {
        let mut cache = Self::default();
        for kind in [ReferenceKind::Provider, ReferenceKind::Category] {
            let rows = store.load_references(kind).await?;
            debug!(%kind, count = rows.len(), "preloaded reference names");
            cache.names_mut(kind).committed.extend(rows);
        }
        Ok(cache)
    }

    /// Committed entries for one kind.
    pub fn len(&self, kind: ReferenceKind) -> usize {
        self.names(kind).committed.len()
    }

    fn names(&self, kind: ReferenceKind) -> &NameCache {
        match kind {
            ReferenceKind::Provider => &self.providers,
            ReferenceKind::Category => &self.categories,
        }
    }

    fn names_mut(&mut self, kind: ReferenceKind) -> &mut NameCache {
        match kind {
            ReferenceKind::Provider => &mut self.providers,
            ReferenceKind::Category => &mut self.categories,
        }
    }
}

pub struct ReferenceResolver {
    cache: ReferenceCache,
    unresolved: Vec<(ReferenceKind, String)>,
}

impl ReferenceResolver {
    pub fn new(cache: ReferenceCache) -> Self {
        Self {
            cache,
            unresolved: Vec::new(),
        }
    }

    /// Provider id for `name`, created if missing. Blank names resolve to `None`.
    pub async fn resolve_provider<T: StoreTx>(
        &mut self,
        tx: &mut T,
        name: &str,
    ) -> Result<Option<u64>, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        self.resolve(tx, ReferenceKind::Provider, name).await
    }

    /// Category id for the normalized form of `label`.
    pub async fn resolve_category<T: StoreTx>(
        &mut self,
        tx: &mut T,
        label: &str,
    ) -> Result<Option<u64>, StoreError> {
        let name = normalize_category_label(label);
        if name.is_empty() {
            return Ok(None);
        }
        self.resolve(tx, ReferenceKind::Category, &name).await
    }

    async fn resolve<T: StoreTx>(
        &mut self,
        tx: &mut T,
        kind: ReferenceKind,
        name: &str,
    ) -> Result<Option<u64>, StoreError> {
        if let Some(id) = self.cache.names(kind).get(name) {
            return Ok(Some(id));
        }

        if let Some(id) = tx.find_reference(kind, name).await? {
            self.cache.names_mut(kind).stage(name, id, false);
            return Ok(Some(id));
        }

        match tx.insert_reference(kind, name).await {
            Ok(id) => {
                debug!(%kind, name, id, "created reference");
                self.cache.names_mut(kind).stage(name, id, true);
                Ok(Some(id))
            }
            Err(StoreError::UniqueViolation(message)) => {
                // another writer got there first, or the name is soft-deleted
                match tx.find_reference(kind, name).await? {
                    Some(id) => {
                        debug!(%kind, name, id, "reference inserted concurrently, reusing");
                        self.cache.names_mut(kind).stage(name, id, false);
                        Ok(Some(id))
                    }
                    None => {
                        warn!(%kind, name, %message, "name taken by a deleted row, leaving it null");
                        self.unresolved.push((kind, name.to_string()));
                        Ok(None)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Promote ids staged by the current batch after it commits.
    pub fn commit_batch(&mut self) {
        self.cache.providers.commit();
        self.cache.categories.commit();
    }

    /// Forget ids staged by a batch that rolled back.
    pub fn discard_batch(&mut self) {
        self.cache.providers.discard();
        self.cache.categories.discard();
        self.unresolved.clear();
    }

    /// Names that could not be resolved since the last call.
    pub fn take_unresolved(&mut self) -> Vec<(ReferenceKind, String)> {
        std::mem::take(&mut self.unresolved)
    }

    /// Rows created by committed batches.
    pub fn created(&self, kind: ReferenceKind) -> usize {
        self.cache.names(kind).created
    }

    pub fn cache(&self) -> &ReferenceCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_preload_skips_deleted() {
        let store = MemoryStore::new();
        store.seed_reference(ReferenceKind::Provider, "ACME", false);
        store.seed_reference(ReferenceKind::Provider, "OLD", true);
        let cache = ReferenceCache::preload(&store).await.unwrap();
        assert_eq!(cache.len(ReferenceKind::Provider), 1);
        assert_eq!(cache.len(ReferenceKind::Category), 0);
    }

    #[tokio::test]
    async fn test_creates_once_and_caches() {
        let store = MemoryStore::new();
        let mut resolver = ReferenceResolver::new(ReferenceCache::default());
        let mut tx = store.begin().await.unwrap();

        let first = resolver.resolve_provider(&mut tx, " ACME ").await.unwrap();
        let second = resolver.resolve_provider(&mut tx, "ACME").await.unwrap();
        assert_eq!(first, second);
        tx.commit().await.unwrap();
        resolver.commit_batch();

        assert_eq!(store.references(ReferenceKind::Provider).len(), 1);
        assert_eq!(resolver.created(ReferenceKind::Provider), 1);
        assert_eq!(resolver.cache().len(ReferenceKind::Provider), 1);
    }

    #[tokio::test]
    async fn test_blank_names_are_null() {
        let store = MemoryStore::new();
        let mut resolver = ReferenceResolver::new(ReferenceCache::default());
        let mut tx = store.begin().await.unwrap();
        assert_eq!(resolver.resolve_provider(&mut tx, "   ").await.unwrap(), None);
        assert_eq!(resolver.resolve_category(&mut tx, " , ,").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_category_label_normalized() {
        let store = MemoryStore::new();
        let mut resolver = ReferenceResolver::new(ReferenceCache::default());
        let mut tx = store.begin().await.unwrap();
        let a = resolver
            .resolve_category(&mut tx, "Luz, AGUA ,luz")
            .await
            .unwrap();
        let b = resolver.resolve_category(&mut tx, "Luz, AGUA").await.unwrap();
        assert_eq!(a, b);
        tx.commit().await.unwrap();
        assert_eq!(store.references(ReferenceKind::Category)[0].name, "Luz, AGUA");
    }

    #[tokio::test]
    async fn test_rolled_back_ids_not_reused() {
        let store = MemoryStore::new();
        let mut resolver = ReferenceResolver::new(ReferenceCache::default());
        {
            let mut tx = store.begin().await.unwrap();
            resolver.resolve_provider(&mut tx, "ACME").await.unwrap();
        }
        resolver.discard_batch();
        assert_eq!(resolver.cache().len(ReferenceKind::Provider), 0);
        assert_eq!(resolver.created(ReferenceKind::Provider), 0);

        let mut tx = store.begin().await.unwrap();
        let id = resolver.resolve_provider(&mut tx, "ACME").await.unwrap();
        tx.commit().await.unwrap();
        resolver.commit_batch();
        assert_eq!(store.references(ReferenceKind::Provider)[0].id, id.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_insert_reuses_winner() {
        let store = MemoryStore::new();
        store.race_on_insert(ReferenceKind::Provider, "ACME");
        let mut resolver = ReferenceResolver::new(ReferenceCache::default());
        let mut tx = store.begin().await.unwrap();
        let id = resolver.resolve_provider(&mut tx, "ACME").await.unwrap();
        tx.commit().await.unwrap();
        resolver.commit_batch();

        let rows = store.references(ReferenceKind::Provider);
        assert_eq!(rows.len(), 1);
        assert_eq!(Some(rows[0].id), id);
        assert_eq!(resolver.created(ReferenceKind::Provider), 0);
    }

    #[tokio::test]
    async fn test_soft_deleted_collision_left_null() {
        let store = MemoryStore::new();
        store.seed_reference(ReferenceKind::Category, "OLD", true);
        let mut resolver = ReferenceResolver::new(ReferenceCache::default());
        let mut tx = store.begin().await.unwrap();
        assert_eq!(resolver.resolve_category(&mut tx, "OLD").await.unwrap(), None);
        assert_eq!(
            resolver.take_unresolved(),
            vec![(ReferenceKind::Category, "OLD".to_string())]
        );
        assert!(resolver.take_unresolved().is_empty());
    }
}
