//! Storage contracts for mirrored entities and denormalized games.
//!
//! Both stores are shared by every worker without application-level locking; an
//! upsert of one document is atomic, nothing spans documents.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::database_ops::igdb::aggregate::GameAggregate;
use crate::database_ops::igdb::document::ExternalId;
use crate::database_ops::igdb::kinds::EntityKind;
use crate::error::{batch_timeout, with_timeout, SyncError, SyncResult};

pub(crate) const SINGLE_OP_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const COUNT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEDUPE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Stable internal key; survives every later upsert of the same external id.
    pub storage_id: Uuid,
    pub kind: EntityKind,
    pub external_id: u64,
    pub body: Value,
}

impl EntityRecord {
    /// Wraps a freshly fetched body under a new storage id.
    pub fn new(kind: EntityKind, body: Value) -> SyncResult<Self> {
        let external_id = body
            .external_id()
            .ok_or_else(|| SyncError::validation(format!("{kind} body without an id")))?;
        Ok(Self {
            storage_id: Uuid::new_v4(),
            kind,
            external_id,
            body,
        })
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_by_id(&self, kind: EntityKind, id: u64) -> SyncResult<Option<EntityRecord>>;

    /// One record per requested id that exists locally.
    async fn get_many_by_ids(
        &self,
        kind: EntityKind,
        ids: &[u64],
    ) -> SyncResult<HashMap<u64, EntityRecord>>;

    /// Upserts keyed by `(kind, external_id)`. A record that already exists keeps its
    /// storage id and takes the new body, so concurrent writers never duplicate it.
    async fn upsert_one(&self, record: &EntityRecord) -> SyncResult<()>;

    async fn upsert_many(&self, kind: EntityKind, records: &[EntityRecord]) -> SyncResult<()>;

    /// Ordered by external id ascending.
    async fn paginate(&self, kind: EntityKind, offset: u64, limit: u64)
        -> SyncResult<Vec<EntityRecord>>;

    async fn count(&self, kind: EntityKind) -> SyncResult<u64>;

    /// Keeps one record per external id; returns how many were removed. Only rows
    /// written before the unique key existed can repeat.
    async fn remove_duplicates(&self, kind: EntityKind) -> SyncResult<u64>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredAggregate {
    pub storage_id: Uuid,
    pub game: GameAggregate,
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn get(&self, game_id: u64) -> SyncResult<Option<StoredAggregate>>;

    /// Subset of `game_ids` that already have an aggregate.
    async fn aggregated_ids(&self, game_ids: &[u64]) -> SyncResult<HashSet<u64>>;

    /// Replaces the whole document keyed by the game id.
    async fn upsert(&self, aggregate: &StoredAggregate) -> SyncResult<()>;

    async fn count_games(&self) -> SyncResult<u64>;
}

/// Persists fetched bodies, reusing the storage id of any record already mirrored
/// for the same external id. Bodies repeated within the batch collapse to the last
/// occurrence; bodies without an id are skipped.
pub async fn persist_bodies(
    store: &dyn EntityStore,
    kind: EntityKind,
    bodies: Vec<Value>,
) -> SyncResult<Vec<EntityRecord>> {
    let mut order: Vec<u64> = Vec::with_capacity(bodies.len());
    let mut latest: HashMap<u64, Value> = HashMap::with_capacity(bodies.len());
    for body in bodies {
        let Some(id) = body.external_id() else {
            warn!(target = "igdb", kind = %kind, "skipping body without id");
            continue;
        };
        if latest.insert(id, body).is_none() {
            order.push(id);
        }
    }
    if order.is_empty() {
        return Ok(Vec::new());
    }

    let existing = with_timeout(
        "entity lookup",
        batch_timeout(order.len()),
        store.get_many_by_ids(kind, &order),
    )
    .await?;

    let mut records = Vec::with_capacity(order.len());
    for id in order {
        let Some(body) = latest.remove(&id) else {
            continue;
        };
        let storage_id = existing
            .get(&id)
            .map(|r| r.storage_id)
            .unwrap_or_else(Uuid::new_v4);
        records.push(EntityRecord {
            storage_id,
            kind,
            external_id: id,
            body,
        });
    }

    with_timeout(
        "entity upsert",
        batch_timeout(records.len()),
        store.upsert_many(kind, &records),
    )
    .await?;
    Ok(records)
}

/// Writes `game` over any aggregate already stored for its id, keeping that
/// aggregate's storage id.
pub async fn commit_aggregate(
    store: &dyn AggregateStore,
    game: GameAggregate,
) -> SyncResult<StoredAggregate> {
    let previous = with_timeout("aggregate lookup", SINGLE_OP_TIMEOUT, store.get(game.id)).await?;
    let stored = StoredAggregate {
        storage_id: previous.map(|p| p.storage_id).unwrap_or_else(Uuid::new_v4),
        game,
    };
    with_timeout("aggregate upsert", SINGLE_OP_TIMEOUT, store.upsert(&stored)).await?;
    Ok(stored)
}
