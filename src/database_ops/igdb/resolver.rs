use itertools::Itertools;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::client::{remote_deadline, CatalogSource};
use super::document::ExternalId;
use super::kinds::EntityKind;
use crate::database_ops::store::{persist_bodies, EntityStore};
use crate::error::{batch_timeout, with_timeout, SyncResult};

/// Resolves external ids local-first, fetching and mirroring whatever is missing.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn EntityStore>,
    remote: Arc<dyn CatalogSource>,
}

impl Resolver {
    pub fn new(store: Arc<dyn EntityStore>, remote: Arc<dyn CatalogSource>) -> Self {
        Self { store, remote }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn CatalogSource> {
        &self.remote
    }

    /// One store lookup, then at most one remote fetch covering exactly the misses.
    /// The fetched batch is persisted once before it is merged with the local hits.
    /// Ids unknown upstream are left out.
    pub async fn resolve(&self, kind: EntityKind, ids: &[u64]) -> SyncResult<HashMap<u64, Value>> {
        let wanted: Vec<u64> = ids.iter().copied().filter(|id| *id != 0).unique().collect();
        if wanted.is_empty() {
            return Ok(HashMap::new());
        }

        let local = with_timeout(
            "resolve lookup",
            batch_timeout(wanted.len()),
            self.store.get_many_by_ids(kind, &wanted),
        )
        .await?;
        let mut resolved: HashMap<u64, Value> =
            local.into_iter().map(|(id, record)| (id, record.body)).collect();

        let missing: Vec<u64> = wanted
            .into_iter()
            .filter(|id| !resolved.contains_key(id))
            .collect();
        if missing.is_empty() {
            return Ok(resolved);
        }

        debug!(target = "igdb", kind = %kind, missing = missing.len(), "resolving from remote");
        let fetched = with_timeout(
            "resolve fetch",
            remote_deadline(self.remote.as_ref(), batch_timeout(missing.len())),
            self.remote.get_by_ids(kind, &missing),
        )
        .await?;

        let requested: HashSet<u64> = missing.iter().copied().collect();
        let fetched: Vec<Value> = fetched
            .into_iter()
            .filter(|body| body.external_id().is_some_and(|id| requested.contains(&id)))
            .collect();
        for record in persist_bodies(self.store.as_ref(), kind, fetched).await? {
            resolved.insert(record.external_id, record.body);
        }
        Ok(resolved)
    }

    /// Bodies in the order of `ids`; repeats and absentees are dropped.
    pub async fn resolve_ordered(&self, kind: EntityKind, ids: &[u64]) -> SyncResult<Vec<Value>> {
        let mut resolved = self.resolve(kind, ids).await?;
        Ok(ids.iter().filter_map(|id| resolved.remove(id)).collect())
    }

    pub async fn resolve_one(&self, kind: EntityKind, id: Option<u64>) -> SyncResult<Option<Value>> {
        let Some(id) = id else {
            return Ok(None);
        };
        Ok(self.resolve(kind, &[id]).await?.remove(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::igdb::testing::{Call, FakeCatalog, SlowStore};
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::store::EntityRecord;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, Arc<FakeCatalog>, Resolver) {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        let resolver = Resolver::new(store.clone(), remote.clone());
        (store, remote, resolver)
    }

    #[tokio::test]
    async fn fetches_only_the_missing_genre_and_mirrors_it() {
        let (store, remote, resolver) = setup();
        store
            .upsert_one(&EntityRecord::new(EntityKind::Genre, json!({"id": 10, "name": "Shooter"})).unwrap())
            .await
            .unwrap();
        remote.insert(EntityKind::Genre, json!({"id": 10, "name": "Shooter (remote)"}));
        remote.insert(EntityKind::Genre, json!({"id": 20, "name": "Puzzle"}));

        let resolved = resolver.resolve(EntityKind::Genre, &[10, 20]).await.unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[&10]["name"], "Shooter");
        assert_eq!(resolved[&20]["name"], "Puzzle");
        assert_eq!(remote.calls(), vec![Call::GetByIds(EntityKind::Genre, vec![20])]);
        assert!(store.get_by_id(EntityKind::Genre, 20).await.unwrap().is_some());
        assert_eq!(store.entity_writes(), 2);
    }

    #[tokio::test]
    async fn empty_id_set_touches_nothing() {
        let (store, remote, resolver) = setup();
        assert!(resolver.resolve(EntityKind::Theme, &[]).await.unwrap().is_empty());
        assert!(resolver.resolve(EntityKind::Theme, &[0]).await.unwrap().is_empty());
        assert!(remote.calls().is_empty());
        assert_eq!(store.entity_writes(), 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_omitted_and_nothing_is_written_for_them() {
        let (store, remote, resolver) = setup();
        remote.insert(EntityKind::Keyword, json!({"id": 3, "name": "space"}));

        let resolved = resolver.resolve(EntityKind::Keyword, &[3, 404, 3]).await.unwrap();

        assert_eq!(resolved.keys().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(remote.calls(), vec![Call::GetByIds(EntityKind::Keyword, vec![3, 404])]);
        assert_eq!(store.count(EntityKind::Keyword).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_resolve_is_served_locally() {
        let (_store, remote, resolver) = setup();
        remote.insert(EntityKind::Platform, json!({"id": 48, "name": "PlayStation 4"}));

        resolver.resolve(EntityKind::Platform, &[48]).await.unwrap();
        remote.clear_calls();
        let again = resolver.resolve(EntityKind::Platform, &[48]).await.unwrap();

        assert_eq!(again[&48]["name"], "PlayStation 4");
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn ordered_follows_request_order() {
        let (_store, remote, resolver) = setup();
        for id in [1, 2, 3] {
            remote.insert(EntityKind::Screenshot, json!({"id": id, "image_id": format!("sc{id}")}));
        }

        let ordered = resolver
            .resolve_ordered(EntityKind::Screenshot, &[3, 1, 9, 3, 2])
            .await
            .unwrap();
        let ids: Vec<u64> = ordered.iter().filter_map(|b| b.external_id()).collect();
        assert_eq!(ids, vec![3, 1, 2]);

        assert!(resolver.resolve_one(EntityKind::Cover, None).await.unwrap().is_none());
        assert!(resolver.resolve_one(EntityKind::Screenshot, Some(2)).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn racing_resolves_of_one_missing_id_store_it_once() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(SlowStore {
            inner: inner.clone(),
            lookup_delay: Duration::from_millis(10),
        });
        let remote = Arc::new(FakeCatalog::new());
        remote.insert(EntityKind::Genre, json!({"id": 20, "name": "Puzzle"}));
        remote.delay_lookups(EntityKind::Genre, Duration::from_millis(20));
        let resolver = Resolver::new(store, remote.clone());

        let (a, b) = tokio::join!(
            resolver.resolve(EntityKind::Genre, &[20]),
            resolver.resolve(EntityKind::Genre, &[20]),
        );

        assert_eq!(a.unwrap()[&20]["name"], "Puzzle");
        assert_eq!(b.unwrap()[&20]["name"], "Puzzle");
        assert_eq!(remote.calls().len(), 2);
        let records = inner.snapshot(EntityKind::Genre).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_retries_get_their_allowance_before_timing_out() {
        let (_store, remote, resolver) = setup();
        remote.insert(EntityKind::Theme, json!({"id": 1, "name": "Horror"}));
        // Longer than the plain batch deadline, shorter than deadline plus allowance.
        remote.delay_lookups(EntityKind::Theme, Duration::from_secs(12));
        remote.set_retry_allowance(Duration::from_secs(20));

        let resolved = resolver.resolve(EntityKind::Theme, &[1]).await.unwrap();
        assert_eq!(resolved[&1]["name"], "Horror");

        remote.set_retry_allowance(Duration::ZERO);
        remote.insert(EntityKind::Theme, json!({"id": 2, "name": "Comedy"}));
        let err = resolver.resolve(EntityKind::Theme, &[2]).await.unwrap_err();
        assert!(matches!(err, crate::error::SyncError::Timeout { op: "resolve fetch", .. }));
    }
}
