//! Bulk mirroring of IGDB collections and the full aggregation rebuild.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::aggregate::aggregate;
use super::client::{remote_deadline, CatalogSource, IGDB_MAX_LIMIT};
use super::kinds::EntityKind;
use super::resolver::Resolver;
use crate::database_ops::store::{
    commit_aggregate, persist_bodies, AggregateStore, EntityStore, StoredAggregate, COUNT_TIMEOUT,
    DEDUPE_TIMEOUT,
};
use crate::database_ops::worker_pool::{PoolReport, UnitFailure, WorkerPool};
use crate::error::{batch_timeout, with_timeout, SyncResult};

/// Raw games read per aggregation unit.
const GAMES_PER_UNIT: u64 = 500;

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub sync_concurrency: usize,
    pub aggregate_concurrency: usize,
    pub page_size: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_concurrency: 3,
            aggregate_concurrency: 10,
            page_size: IGDB_MAX_LIMIT as u64,
        }
    }
}

/// Per-kind outcome of [`SyncEngine::fetch_all`].
#[derive(Debug)]
pub struct KindReport {
    pub kind: EntityKind,
    pub report: PoolReport,
}

#[derive(Debug, Default)]
pub struct FetchSummary {
    pub synced: Vec<KindReport>,
    /// Kinds left alone because they already had local records.
    pub skipped: Vec<EntityKind>,
}

impl FetchSummary {
    pub fn failures(&self) -> usize {
        self.synced.iter().map(|k| k.report.failures.len()).sum()
    }
}

/// Aggregates `raw` and replaces the stored aggregate for its id.
pub async fn rebuild_game(
    resolver: &Resolver,
    aggregates: &dyn AggregateStore,
    raw: &Value,
) -> SyncResult<StoredAggregate> {
    let game = aggregate(resolver, raw).await?;
    commit_aggregate(aggregates, game).await
}

async fn sync_page(
    store: &dyn EntityStore,
    remote: &dyn CatalogSource,
    kind: EntityKind,
    offset: u64,
    limit: u64,
) -> SyncResult<usize> {
    let bodies = with_timeout(
        "page fetch",
        remote_deadline(remote, batch_timeout(limit as usize)),
        remote.page(kind, offset, limit),
    )
    .await?;
    Ok(persist_bodies(store, kind, bodies).await?.len())
}

pub struct SyncEngine {
    store: Arc<dyn EntityStore>,
    aggregates: Arc<dyn AggregateStore>,
    remote: Arc<dyn CatalogSource>,
    resolver: Resolver,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn EntityStore>,
        aggregates: Arc<dyn AggregateStore>,
        remote: Arc<dyn CatalogSource>,
        settings: SyncSettings,
    ) -> Self {
        let resolver = Resolver::new(store.clone(), remote.clone());
        let settings = SyncSettings {
            page_size: settings.page_size.clamp(1, IGDB_MAX_LIMIT as u64),
            ..settings
        };
        Self {
            store,
            aggregates,
            remote,
            resolver,
            settings,
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Mirrors one whole collection. The remote count sizes the run; a count failure
    /// is returned before any page is requested. Failed pages are reported, not retried.
    #[instrument(skip_all, fields(kind = %kind))]
    pub async fn sync(&self, kind: EntityKind) -> SyncResult<PoolReport> {
        let total = with_timeout(
            "remote count",
            remote_deadline(self.remote.as_ref(), COUNT_TIMEOUT),
            self.remote.count(kind),
        )
        .await?;
        let page_size = self.settings.page_size;
        let pages = total.div_ceil(page_size);
        info!(target = "igdb", kind = %kind, total, pages, "syncing collection");

        let offsets: Vec<u64> = (0..pages).map(|p| p * page_size).collect();
        let store = self.store.clone();
        let remote = self.remote.clone();
        let pool = WorkerPool::new(format!("sync {kind}"), self.settings.sync_concurrency);
        let report = pool
            .run(offsets, pages, move |offset, progress| {
                let store = store.clone();
                let remote = remote.clone();
                async move {
                    match sync_page(store.as_ref(), remote.as_ref(), kind, offset, page_size).await {
                        Ok(stored) => {
                            debug!(target = "igdb", kind = %kind, offset, stored, "page stored");
                            progress.tick();
                            Vec::new()
                        }
                        Err(err) => vec![UnitFailure::new(
                            format!("{kind} page at offset {offset}"),
                            err,
                        )],
                    }
                }
            })
            .await;

        if report.is_clean() {
            info!(target = "igdb", kind = %kind, pages = report.finished, "collection synced");
        } else {
            warn!(
                target = "igdb",
                kind = %kind,
                finished = report.finished,
                total = report.total,
                failed = report.failures.len(),
                "collection synced with failures"
            );
        }
        Ok(report)
    }

    /// Syncs `kinds` with every non-game collection before games. Unless `refetch` is
    /// set, a kind that already has local records is skipped.
    pub async fn fetch_all(&self, kinds: &[EntityKind], refetch: bool) -> SyncResult<FetchSummary> {
        let mut summary = FetchSummary::default();
        for kind in EntityKind::sync_order().filter(|k| kinds.contains(k)) {
            if !refetch {
                let local = with_timeout("local count", COUNT_TIMEOUT, self.store.count(kind)).await?;
                if local > 0 {
                    debug!(target = "igdb", kind = %kind, local, "already mirrored, skipping");
                    summary.skipped.push(kind);
                    continue;
                }
            }
            let report = self.sync(kind).await?;
            summary.synced.push(KindReport { kind, report });
        }
        info!(
            target = "igdb",
            synced = summary.synced.len(),
            skipped = summary.skipped.len(),
            failures = summary.failures(),
            "fetch finished"
        );
        Ok(summary)
    }

    /// Aggregates every mirrored game. Without `rebuild`, games that already have an
    /// aggregate count as finished and are left untouched.
    #[instrument(skip(self))]
    pub async fn aggregate_all(&self, rebuild: bool) -> SyncResult<PoolReport> {
        let total = with_timeout(
            "local count",
            COUNT_TIMEOUT,
            self.store.count(EntityKind::Game),
        )
        .await?;
        let units = total.div_ceil(GAMES_PER_UNIT);
        info!(target = "igdb", total, units, rebuild, "aggregating games");

        let offsets: Vec<u64> = (0..units).map(|u| u * GAMES_PER_UNIT).collect();
        let store = self.store.clone();
        let aggregates = self.aggregates.clone();
        let resolver = self.resolver.clone();
        let pool = WorkerPool::new("aggregate games", self.settings.aggregate_concurrency);
        let report = pool
            .run(offsets, total, move |offset, progress| {
                let store = store.clone();
                let aggregates = aggregates.clone();
                let resolver = resolver.clone();
                async move {
                    let page = match with_timeout(
                        "game page read",
                        batch_timeout(GAMES_PER_UNIT as usize),
                        store.paginate(EntityKind::Game, offset, GAMES_PER_UNIT),
                    )
                    .await
                    {
                        Ok(page) => page,
                        Err(err) => {
                            return vec![UnitFailure::new(format!("games at offset {offset}"), err)]
                        }
                    };

                    let done: HashSet<u64> = if rebuild {
                        HashSet::new()
                    } else {
                        let ids: Vec<u64> = page.iter().map(|r| r.external_id).collect();
                        match with_timeout(
                            "aggregate lookup",
                            batch_timeout(ids.len()),
                            aggregates.aggregated_ids(&ids),
                        )
                        .await
                        {
                            Ok(done) => done,
                            Err(err) => {
                                return vec![UnitFailure::new(
                                    format!("games at offset {offset}"),
                                    err,
                                )]
                            }
                        }
                    };

                    let mut failures = Vec::new();
                    for record in page {
                        if !done.contains(&record.external_id) {
                            if let Err(err) =
                                rebuild_game(&resolver, aggregates.as_ref(), &record.body).await
                            {
                                failures.push(UnitFailure::new(
                                    format!("game {}", record.external_id),
                                    err,
                                ));
                                continue;
                            }
                        }
                        progress.tick();
                    }
                    failures
                }
            })
            .await;

        info!(
            target = "igdb",
            finished = report.finished,
            total = report.total,
            failed = report.failures.len(),
            "aggregation finished"
        );
        Ok(report)
    }

    /// Drops repeated records per kind; returns the number removed.
    pub async fn dedupe(&self, kinds: &[EntityKind]) -> SyncResult<u64> {
        let mut removed = 0;
        for &kind in kinds {
            let n = with_timeout(
                "remove duplicates",
                DEDUPE_TIMEOUT,
                self.store.remove_duplicates(kind),
            )
            .await?;
            if n > 0 {
                info!(target = "igdb", kind = %kind, removed = n, "removed duplicates");
            }
            removed += n;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::igdb::testing::{Call, FakeCatalog};
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::store::EntityRecord;
    use crate::error::SyncError;
    use serde_json::json;
    use std::time::Duration;

    fn engine(store: &Arc<MemoryStore>, remote: &Arc<FakeCatalog>) -> SyncEngine {
        SyncEngine::new(
            store.clone(),
            store.clone(),
            remote.clone(),
            SyncSettings::default(),
        )
    }

    #[tokio::test]
    async fn sync_pages_by_remote_count() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        remote.seed(EntityKind::Genre, 1200);

        let report = engine(&store, &remote).sync(EntityKind::Genre).await.unwrap();

        assert!(report.is_clean());
        assert_eq!((report.finished, report.total), (3, 3));
        assert_eq!(remote.page_calls(EntityKind::Genre), 3);
        let mut offsets: Vec<u64> = remote
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Page(_, offset, 500) => Some(offset),
                _ => None,
            })
            .collect();
        offsets.sort();
        assert_eq!(offsets, vec![0, 500, 1000]);

        let records = store.snapshot(EntityKind::Genre).await;
        assert_eq!(records.len(), 1200);
        let distinct: HashSet<u64> = records.iter().map(|r| r.external_id).collect();
        assert_eq!(distinct.len(), 1200);
    }

    #[tokio::test]
    async fn repeated_sync_leaves_store_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        remote.seed(EntityKind::Theme, 730);
        let engine = engine(&store, &remote);

        engine.sync(EntityKind::Theme).await.unwrap();
        let first = store.snapshot(EntityKind::Theme).await;
        engine.sync(EntityKind::Theme).await.unwrap();
        let second = store.snapshot(EntityKind::Theme).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn failed_page_does_not_stop_siblings() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        remote.seed(EntityKind::Genre, 1200);
        remote.fail_page(EntityKind::Genre, 500);

        let report = engine(&store, &remote).sync(EntityKind::Genre).await.unwrap();

        assert_eq!(report.finished, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].unit.contains("offset 500"));
        assert!(matches!(report.failures[0].error, SyncError::Upstream(_)));
        assert_eq!(store.count(EntityKind::Genre).await.unwrap(), 700);
    }

    #[tokio::test]
    async fn empty_collection_launches_no_pages() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());

        let report = engine(&store, &remote).sync(EntityKind::Region).await.unwrap();

        assert_eq!(report.total, 0);
        assert_eq!(remote.calls(), vec![Call::Count(EntityKind::Region)]);
    }

    #[tokio::test]
    async fn fetch_all_skips_populated_kinds_and_runs_games_last() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        remote.seed(EntityKind::Game, 3);
        remote.seed(EntityKind::Genre, 4);
        remote.seed(EntityKind::Theme, 2);
        store
            .upsert_one(&EntityRecord::new(EntityKind::Theme, json!({"id": 1})).unwrap())
            .await
            .unwrap();
        let engine = engine(&store, &remote);
        let kinds = [EntityKind::Game, EntityKind::Genre, EntityKind::Theme];

        let summary = engine.fetch_all(&kinds, false).await.unwrap();
        assert_eq!(summary.skipped, vec![EntityKind::Theme]);
        let synced: Vec<EntityKind> = summary.synced.iter().map(|k| k.kind).collect();
        assert_eq!(synced, vec![EntityKind::Genre, EntityKind::Game]);

        let summary = engine.fetch_all(&kinds, true).await.unwrap();
        assert!(summary.skipped.is_empty());
        assert_eq!(summary.synced.last().map(|k| k.kind), Some(EntityKind::Game));
        assert_eq!(store.count(EntityKind::Theme).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn aggregate_all_skips_existing_unless_rebuilding() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        remote.insert(EntityKind::Genre, json!({"id": 5, "name": "RPG"}));
        for id in 1..=4u64 {
            store
                .upsert_one(
                    &EntityRecord::new(EntityKind::Game, json!({"id": id, "name": format!("g{id}"), "genres": [5]}))
                        .unwrap(),
                )
                .await
                .unwrap();
        }
        let engine = engine(&store, &remote);
        rebuild_game(
            engine.resolver(),
            store.as_ref(),
            &json!({"id": 2, "name": "g2"}),
        )
        .await
        .unwrap();
        assert_eq!(store.aggregate_writes(), 1);

        let report = engine.aggregate_all(false).await.unwrap();
        assert!(report.is_clean());
        assert_eq!((report.finished, report.total), (4, 4));
        assert_eq!(store.aggregate_writes(), 4);
        let kept = AggregateStore::get(store.as_ref(), 2).await.unwrap().unwrap();
        assert!(kept.game.relations.genres.is_empty());

        engine.aggregate_all(true).await.unwrap();
        assert_eq!(store.aggregate_writes(), 8);
        let rebuilt = AggregateStore::get(store.as_ref(), 2).await.unwrap().unwrap();
        assert_eq!(rebuilt.game.relations.genres[0]["name"], "RPG");
        assert_eq!(rebuilt.storage_id, kept.storage_id);
    }

    #[tokio::test]
    async fn one_bad_game_does_not_block_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        let games = vec![
            EntityRecord::new(EntityKind::Game, json!({"id": 1, "name": "fine"})).unwrap(),
            EntityRecord::new(EntityKind::Game, json!({"id": 2, "name": 42})).unwrap(),
            EntityRecord::new(EntityKind::Game, json!({"id": 3, "name": "also fine"})).unwrap(),
        ];
        store.upsert_many(EntityKind::Game, &games).await.unwrap();

        let report = engine(&store, &remote).aggregate_all(false).await.unwrap();

        assert_eq!(report.finished, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit, "game 2");
        assert_eq!(store.count_games().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dedupe_finds_nothing_once_records_are_keyed() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        let repeats: Vec<EntityRecord> = (0..3)
            .map(|_| EntityRecord::new(EntityKind::Keyword, json!({"id": 7})).unwrap())
            .collect();
        store.upsert_many(EntityKind::Keyword, &repeats).await.unwrap();

        let removed = engine(&store, &remote)
            .dedupe(&[EntityKind::Keyword, EntityKind::Genre])
            .await
            .unwrap();

        assert_eq!(removed, 0);
        assert_eq!(store.count(EntityKind::Keyword).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn count_failure_launches_no_pages() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        remote.seed(EntityKind::Platform, 20);
        remote.fail_count(EntityKind::Platform);

        let err = engine(&store, &remote).sync(EntityKind::Platform).await.unwrap_err();

        assert!(matches!(err, SyncError::Upstream(_)));
        assert_eq!(remote.calls(), vec![Call::Count(EntityKind::Platform)]);
        assert_eq!(store.entity_writes(), 0);
    }

    #[tokio::test]
    async fn reported_count_sizes_the_run() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        remote.seed(EntityKind::Company, 1000);
        remote.set_count(EntityKind::Company, 1001);

        let report = engine(&store, &remote).sync(EntityKind::Company).await.unwrap();

        assert_eq!((report.finished, report.total), (3, 3));
        assert_eq!(remote.page_calls(EntityKind::Company), 3);
        assert_eq!(store.count(EntityKind::Company).await.unwrap(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_page_times_out_as_a_unit_failure() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        remote.seed(EntityKind::Theme, 10);
        remote.delay_pages(EntityKind::Theme, Duration::from_secs(3600));

        let report = engine(&store, &remote).sync(EntityKind::Theme).await.unwrap();

        assert_eq!((report.finished, report.total), (0, 1));
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0].error,
            SyncError::Timeout { op: "page fetch", .. }
        ));
        assert_eq!(store.count(EntityKind::Theme).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reference_times_out_only_its_game() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeCatalog::new());
        remote.insert(EntityKind::Genre, json!({"id": 5, "name": "RPG"}));
        remote.delay_lookups(EntityKind::Genre, Duration::from_secs(3600));
        let games = vec![
            EntityRecord::new(EntityKind::Game, json!({"id": 1, "name": "plain"})).unwrap(),
            EntityRecord::new(EntityKind::Game, json!({"id": 2, "name": "slow", "genres": [5]})).unwrap(),
        ];
        store.upsert_many(EntityKind::Game, &games).await.unwrap();

        let report = engine(&store, &remote).aggregate_all(false).await.unwrap();

        assert_eq!((report.finished, report.total), (1, 2));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit, "game 2");
        assert!(matches!(report.failures[0].error, SyncError::Timeout { .. }));
        assert!(AggregateStore::get(store.as_ref(), 1).await.unwrap().is_some());
        assert!(AggregateStore::get(store.as_ref(), 2).await.unwrap().is_none());
    }
}
