//! Scripted catalog used by the unit tests. Records every call it receives.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::client::CatalogSource;
use super::document::ExternalId;
use super::kinds::EntityKind;
use crate::database_ops::memory::MemoryStore;
use crate::database_ops::store::{EntityRecord, EntityStore};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Count(EntityKind),
    Page(EntityKind, u64, u64),
    GetByIds(EntityKind, Vec<u64>),
}

#[derive(Default)]
pub struct FakeCatalog {
    bodies: Mutex<HashMap<EntityKind, BTreeMap<u64, Value>>>,
    counts: Mutex<HashMap<EntityKind, u64>>,
    failing_counts: Mutex<HashSet<EntityKind>>,
    failing_offsets: Mutex<HashSet<(EntityKind, u64)>>,
    failing_lookups: Mutex<HashSet<EntityKind>>,
    page_delays: Mutex<HashMap<EntityKind, Duration>>,
    lookup_delays: Mutex<HashMap<EntityKind, Duration>>,
    scripted_lookups: Mutex<HashMap<EntityKind, VecDeque<(Duration, Value)>>>,
    retry_allowance: Mutex<Duration>,
    calls: Mutex<Vec<Call>>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: EntityKind, body: Value) {
        let id = body.external_id().expect("fixture body needs an id");
        self.bodies
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .insert(id, body);
    }

    /// Seeds `n` bodies `{id, name}` with ids `1..=n`.
    pub fn seed(&self, kind: EntityKind, n: u64) {
        for id in 1..=n {
            self.insert(kind, serde_json::json!({"id": id, "name": format!("{kind} {id}")}));
        }
    }

    /// Overrides the reported count, independently of the seeded bodies.
    pub fn set_count(&self, kind: EntityKind, count: u64) {
        self.counts.lock().unwrap().insert(kind, count);
    }

    pub fn fail_count(&self, kind: EntityKind) {
        self.failing_counts.lock().unwrap().insert(kind);
    }

    pub fn fail_page(&self, kind: EntityKind, offset: u64) {
        self.failing_offsets.lock().unwrap().insert((kind, offset));
    }

    /// Every `get_by_ids` for `kind` fails from now on.
    pub fn fail_lookups(&self, kind: EntityKind) {
        self.failing_lookups.lock().unwrap().insert(kind);
    }

    pub fn delay_pages(&self, kind: EntityKind, delay: Duration) {
        self.page_delays.lock().unwrap().insert(kind, delay);
    }

    pub fn delay_lookups(&self, kind: EntityKind, delay: Duration) {
        self.lookup_delays.lock().unwrap().insert(kind, delay);
    }

    /// The next `get_by_ids` for `kind` answers `body` after `delay`, whatever the
    /// seeded bodies say. Queued answers are used in order.
    pub fn script_lookup(&self, kind: EntityKind, delay: Duration, body: Value) {
        self.scripted_lookups
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back((delay, body));
    }

    pub fn set_retry_allowance(&self, allowance: Duration) {
        *self.retry_allowance.lock().unwrap() = allowance;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn page_calls(&self, kind: EntityKind) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Page(k, _, _) if *k == kind))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn delay_of(delays: &Mutex<HashMap<EntityKind, Duration>>, kind: EntityKind) -> Duration {
        delays.lock().unwrap().get(&kind).copied().unwrap_or_default()
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn count(&self, kind: EntityKind) -> SyncResult<u64> {
        self.record(Call::Count(kind));
        if self.failing_counts.lock().unwrap().contains(&kind) {
            return Err(SyncError::Upstream(anyhow::anyhow!("scripted {kind} count failure")));
        }
        if let Some(n) = self.counts.lock().unwrap().get(&kind) {
            return Ok(*n);
        }
        Ok(self
            .bodies
            .lock()
            .unwrap()
            .get(&kind)
            .map(|m| m.len() as u64)
            .unwrap_or(0))
    }

    async fn page(&self, kind: EntityKind, offset: u64, limit: u64) -> SyncResult<Vec<Value>> {
        self.record(Call::Page(kind, offset, limit));
        let delay = Self::delay_of(&self.page_delays, kind);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_offsets.lock().unwrap().contains(&(kind, offset)) {
            return Err(SyncError::Upstream(anyhow::anyhow!(
                "scripted failure at offset {offset}"
            )));
        }
        Ok(self
            .bodies
            .lock()
            .unwrap()
            .get(&kind)
            .map(|m| {
                m.values()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_by_ids(&self, kind: EntityKind, ids: &[u64]) -> SyncResult<Vec<Value>> {
        self.record(Call::GetByIds(kind, ids.to_vec()));
        if self.failing_lookups.lock().unwrap().contains(&kind) {
            return Err(SyncError::Upstream(anyhow::anyhow!("scripted {kind} lookup failure")));
        }
        let scripted = self
            .scripted_lookups
            .lock()
            .unwrap()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front);
        if let Some((delay, body)) = scripted {
            tokio::time::sleep(delay).await;
            let hit = body.external_id().is_some_and(|id| ids.contains(&id));
            return Ok(if hit { vec![body] } else { Vec::new() });
        }

        let delay = Self::delay_of(&self.lookup_delays, kind);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let guard = self.bodies.lock().unwrap();
        let Some(coll) = guard.get(&kind) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| coll.get(id).cloned()).collect())
    }

    fn retry_allowance(&self) -> Duration {
        *self.retry_allowance.lock().unwrap()
    }
}

/// A [`MemoryStore`] whose lookups take a network round trip, which widens the window
/// between a read and the write that follows it.
pub struct SlowStore {
    pub inner: Arc<MemoryStore>,
    pub lookup_delay: Duration,
}

#[async_trait]
impl EntityStore for SlowStore {
    async fn get_by_id(&self, kind: EntityKind, id: u64) -> SyncResult<Option<EntityRecord>> {
        tokio::time::sleep(self.lookup_delay).await;
        self.inner.get_by_id(kind, id).await
    }

    async fn get_many_by_ids(
        &self,
        kind: EntityKind,
        ids: &[u64],
    ) -> SyncResult<HashMap<u64, EntityRecord>> {
        tokio::time::sleep(self.lookup_delay).await;
        self.inner.get_many_by_ids(kind, ids).await
    }

    async fn upsert_one(&self, record: &EntityRecord) -> SyncResult<()> {
        self.inner.upsert_one(record).await
    }

    async fn upsert_many(&self, kind: EntityKind, records: &[EntityRecord]) -> SyncResult<()> {
        self.inner.upsert_many(kind, records).await
    }

    async fn paginate(&self, kind: EntityKind, offset: u64, limit: u64) -> SyncResult<Vec<EntityRecord>> {
        self.inner.paginate(kind, offset, limit).await
    }

    async fn count(&self, kind: EntityKind) -> SyncResult<u64> {
        self.inner.count(kind).await
    }

    async fn remove_duplicates(&self, kind: EntityKind) -> SyncResult<u64> {
        self.inner.remove_duplicates(kind).await
    }
}
