//! In-process store used for dry runs and the test suite.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::database_ops::igdb::kinds::EntityKind;
use crate::database_ops::store::{AggregateStore, EntityRecord, EntityStore, StoredAggregate};
use crate::error::SyncResult;

#[derive(Default)]
pub struct MemoryStore {
    /// One record per `(kind, external_id)`, like the unique key in Postgres.
    entities: RwLock<HashMap<EntityKind, BTreeMap<u64, EntityRecord>>>,
    games: RwLock<HashMap<u64, StoredAggregate>>,
    entity_writes: AtomicU64,
    aggregate_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entity documents written so far.
    pub fn entity_writes(&self) -> u64 {
        self.entity_writes.load(Ordering::Relaxed)
    }

    /// Number of aggregate documents written so far.
    pub fn aggregate_writes(&self) -> u64 {
        self.aggregate_writes.load(Ordering::Relaxed)
    }

    /// Every record of `kind`, ordered by external id.
    pub async fn snapshot(&self, kind: EntityKind) -> Vec<EntityRecord> {
        let guard = self.entities.read().await;
        guard
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_by_id(&self, kind: EntityKind, id: u64) -> SyncResult<Option<EntityRecord>> {
        let guard = self.entities.read().await;
        Ok(guard.get(&kind).and_then(|m| m.get(&id)).cloned())
    }

    async fn get_many_by_ids(
        &self,
        kind: EntityKind,
        ids: &[u64],
    ) -> SyncResult<HashMap<u64, EntityRecord>> {
        let guard = self.entities.read().await;
        let Some(coll) = guard.get(&kind) else {
            return Ok(HashMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| coll.get(id).map(|r| (*id, r.clone())))
            .collect())
    }

    async fn upsert_one(&self, record: &EntityRecord) -> SyncResult<()> {
        self.upsert_many(record.kind, std::slice::from_ref(record)).await
    }

    async fn upsert_many(&self, kind: EntityKind, records: &[EntityRecord]) -> SyncResult<()> {
        let mut guard = self.entities.write().await;
        let coll = guard.entry(kind).or_default();
        for record in records {
            match coll.get_mut(&record.external_id) {
                Some(existing) => existing.body = record.body.clone(),
                None => {
                    coll.insert(record.external_id, record.clone());
                }
            }
        }
        self.entity_writes
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn paginate(
        &self,
        kind: EntityKind,
        offset: u64,
        limit: u64,
    ) -> SyncResult<Vec<EntityRecord>> {
        Ok(self
            .snapshot(kind)
            .await
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count(&self, kind: EntityKind) -> SyncResult<u64> {
        let guard = self.entities.read().await;
        Ok(guard.get(&kind).map(|m| m.len() as u64).unwrap_or(0))
    }

    /// The keyed map cannot hold repeats, so there is never anything to remove.
    async fn remove_duplicates(&self, _kind: EntityKind) -> SyncResult<u64> {
        Ok(0)
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn get(&self, game_id: u64) -> SyncResult<Option<StoredAggregate>> {
        Ok(self.games.read().await.get(&game_id).cloned())
    }

    async fn aggregated_ids(&self, game_ids: &[u64]) -> SyncResult<HashSet<u64>> {
        let guard = self.games.read().await;
        Ok(game_ids
            .iter()
            .copied()
            .filter(|id| guard.contains_key(id))
            .collect())
    }

    async fn upsert(&self, aggregate: &StoredAggregate) -> SyncResult<()> {
        self.games
            .write()
            .await
            .insert(aggregate.game.id, aggregate.clone());
        self.aggregate_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn count_games(&self) -> SyncResult<u64> {
        Ok(self.games.read().await.len() as u64)
    }
}
