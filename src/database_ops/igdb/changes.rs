//! Incremental consistency: one upstream change notification rebuilds at most one
//! game aggregate.
//!
//! A notification moves `Received -> Validated -> Fetched -> Aggregated -> Committed`
//! or stops at `Rejected` / `Failed`. Notifications for one entity are serialized
//! from fetch until their owning game is locked, and a game stays locked through
//! commit, so the last committed aggregate reflects the latest fetch.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use super::client::{remote_deadline, CatalogSource};
use super::ingest::rebuild_game;
use super::kinds::EntityKind;
use super::resolver::Resolver;
use crate::database_ops::store::{persist_bodies, AggregateStore, EntityStore, SINGLE_OP_TIMEOUT};
use crate::error::{with_timeout, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Received,
    Validated,
    Fetched,
    Aggregated,
    Committed,
    Rejected,
    Failed,
}

/// Where a processed notification ended up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeOutcome {
    pub kind: EntityKind,
    pub id: u64,
    /// `Fetched` when the entity has no owning game, `Committed` otherwise.
    pub state: ChangeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChangeError {
    #[error("notification credential missing or wrong")]
    Unauthorized,
    #[error("notification rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Failed(#[from] SyncError),
}

impl ChangeError {
    pub fn state(&self) -> ChangeState {
        match self {
            ChangeError::Unauthorized | ChangeError::Rejected(_) => ChangeState::Rejected,
            ChangeError::Failed(_) => ChangeState::Failed,
        }
    }
}

fn secrets_match(expected: &str, presented: &str) -> bool {
    expected.len() == presented.len()
        && expected
            .bytes()
            .zip(presented.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Locks are keyed by entity; a game's own key doubles as the lock on its aggregate.
type LockKey = (EntityKind, u64);

pub struct ChangeManager {
    resolver: Resolver,
    aggregates: Arc<dyn AggregateStore>,
    secret: String,
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl ChangeManager {
    pub fn new(resolver: Resolver, aggregates: Arc<dyn AggregateStore>, secret: impl Into<String>) -> Self {
        Self {
            resolver,
            aggregates,
            secret: secret.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn store(&self) -> &dyn EntityStore {
        self.resolver.store().as_ref()
    }

    fn remote(&self) -> &dyn CatalogSource {
        self.resolver.remote().as_ref()
    }

    /// An unset secret accepts nothing.
    pub fn verify_secret(&self, presented: Option<&str>) -> bool {
        match presented {
            Some(p) if !self.secret.is_empty() => secrets_match(&self.secret, p),
            _ => false,
        }
    }

    #[instrument(skip_all, fields(kind = %kind, id = id))]
    pub async fn handle(
        &self,
        kind: EntityKind,
        id: u64,
        presented_secret: Option<&str>,
    ) -> Result<ChangeOutcome, ChangeError> {
        debug!(target = "igdb", kind = %kind, id, state = ?ChangeState::Received, "change notification");
        if !self.verify_secret(presented_secret) {
            warn!(target = "igdb", kind = %kind, id, "rejected notification with bad credential");
            return Err(ChangeError::Unauthorized);
        }
        if id == 0 {
            return Err(ChangeError::Rejected(format!("{kind} notification without an id")));
        }
        debug!(target = "igdb", kind = %kind, id, state = ?ChangeState::Validated, "change notification");

        let result = self.process(kind, id).await;
        self.forget_idle_locks().await;

        match &result {
            Ok(outcome) => info!(
                target = "igdb",
                kind = %kind,
                id,
                state = ?outcome.state,
                game_id = outcome.game_id,
                "change applied"
            ),
            Err(err) => warn!(target = "igdb", kind = %kind, id, error = %err, "change failed"),
        }
        result.map_err(ChangeError::from)
    }

    async fn process(&self, kind: EntityKind, id: u64) -> Result<ChangeOutcome, SyncError> {
        let entity_guard = self.lock(kind, id).await;
        let body = with_timeout(
            "entity fetch",
            remote_deadline(self.remote(), SINGLE_OP_TIMEOUT),
            self.remote().get_by_id(kind, id),
        )
        .await?;
        persist_bodies(self.store(), kind, vec![body.clone()]).await?;
        debug!(target = "igdb", kind = %kind, id, state = ?ChangeState::Fetched, "change notification");

        if kind.is_game() {
            rebuild_game(&self.resolver, self.aggregates.as_ref(), &body).await?;
            return Ok(ChangeOutcome {
                kind,
                id,
                state: ChangeState::Committed,
                game_id: Some(id),
            });
        }

        let Some(game_id) = kind.owning_game_id(&body) else {
            return Ok(ChangeOutcome {
                kind,
                id,
                state: ChangeState::Fetched,
                game_id: None,
            });
        };

        // The next notification for this entity may fetch once the game is ours.
        let _game_guard = self.lock(EntityKind::Game, game_id).await;
        drop(entity_guard);
        self.rebuild_owner(game_id).await?;

        Ok(ChangeOutcome {
            kind,
            id,
            state: ChangeState::Committed,
            game_id: Some(game_id),
        })
    }

    /// Loads the owning game (local first, mirrored from upstream on a miss) and
    /// replaces its aggregate.
    async fn rebuild_owner(&self, game_id: u64) -> Result<(), SyncError> {
        let raw = self
            .resolver
            .resolve_one(EntityKind::Game, Some(game_id))
            .await?
            .ok_or(SyncError::NotFound {
                kind: EntityKind::Game,
                id: game_id,
            })?;
        rebuild_game(&self.resolver, self.aggregates.as_ref(), &raw).await?;
        Ok(())
    }

    async fn lock(&self, kind: EntityKind, id: u64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry((kind, id)).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drops every lock nobody holds or waits on.
    async fn forget_idle_locks(&self) {
        self.locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }
}
