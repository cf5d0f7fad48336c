use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode},
    PgPool, QueryBuilder, Row,
};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::database_ops::igdb::kinds::EntityKind;
use crate::database_ops::store::{AggregateStore, EntityRecord, EntityStore, StoredAggregate};
use crate::error::{SyncError, SyncResult};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS igdb_entities (
        storage_id UUID PRIMARY KEY,
        entity_type TEXT NOT NULL,
        external_id BIGINT NOT NULL,
        body JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    // Rows written before the unique key existed may repeat; keep the newest.
    "DELETE FROM igdb_entities e
     USING (
        SELECT storage_id,
               ROW_NUMBER() OVER (
                   PARTITION BY entity_type, external_id
                   ORDER BY updated_at DESC, storage_id
               ) AS rn
        FROM igdb_entities
     ) d
     WHERE e.storage_id = d.storage_id AND d.rn > 1",
    "DROP INDEX IF EXISTS igdb_entities_type_external_idx",
    "CREATE UNIQUE INDEX IF NOT EXISTS igdb_entities_type_external_key
        ON igdb_entities (entity_type, external_id)",
    "CREATE INDEX IF NOT EXISTS igdb_entities_owning_game_idx
        ON igdb_entities (entity_type, (COALESCE(body->'game'->'id', body->'game', body->'game_id')))",
    "CREATE TABLE IF NOT EXISTS game_details (
        storage_id UUID PRIMARY KEY,
        external_id BIGINT NOT NULL UNIQUE,
        document JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
];

// The storage id of an existing row is never overwritten.
const ENTITY_UPSERT_CONFLICT: &str = " ON CONFLICT (entity_type, external_id) DO UPDATE SET
    body = EXCLUDED.body,
    updated_at = now()";

/// PostgreSQL-backed entity and aggregate store.
#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

// Postgres has no unsigned integers; IGDB ids fit comfortably in i64.
fn to_pg(id: u64) -> i64 {
    id as i64
}

fn from_pg(id: i64) -> u64 {
    id as u64
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn open(database_url: &str, max_connections: u32) -> SyncResult<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        // PgBouncer txn mode safe
        connect_options = connect_options.statement_cache_capacity(0);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!(max_connections, "connected to db");

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    async fn ensure_schema(&self) -> SyncResult<()> {
        for stmt in SCHEMA {
            sqlx::raw_sql(stmt).execute(&self.pool).await?;
        }
        info!("mirror schema ready");
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
        info!("db pool closed");
    }

    fn entity_from_row(kind: EntityKind, row: &PgRow) -> SyncResult<EntityRecord> {
        Ok(EntityRecord {
            storage_id: row.try_get("storage_id")?,
            kind,
            external_id: from_pg(row.try_get("external_id")?),
            body: row.try_get::<Value, _>("body")?,
        })
    }

    fn aggregate_from_row(row: &PgRow) -> SyncResult<StoredAggregate> {
        let document: Value = row.try_get("document")?;
        Ok(StoredAggregate {
            storage_id: row.try_get("storage_id")?,
            game: serde_json::from_value(document)?,
        })
    }
}

#[async_trait]
impl EntityStore for Db {
    async fn get_by_id(&self, kind: EntityKind, id: u64) -> SyncResult<Option<EntityRecord>> {
        let row = sqlx::query(
            "SELECT storage_id, external_id, body FROM igdb_entities
             WHERE entity_type = $1 AND external_id = $2
             ORDER BY updated_at DESC, storage_id
             LIMIT 1",
        )
        .persistent(false)
        .bind(kind.endpoint())
        .bind(to_pg(id))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::entity_from_row(kind, &r)).transpose()
    }

    async fn get_many_by_ids(
        &self,
        kind: EntityKind,
        ids: &[u64],
    ) -> SyncResult<HashMap<u64, EntityRecord>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let pg_ids: Vec<i64> = ids.iter().copied().map(to_pg).collect();
        let rows = sqlx::query(
            "SELECT storage_id, external_id, body FROM igdb_entities
             WHERE entity_type = $1 AND external_id = ANY($2)
             ORDER BY external_id, updated_at DESC, storage_id",
        )
        .persistent(false)
        .bind(kind.endpoint())
        .bind(&pg_ids)
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let record = Self::entity_from_row(kind, row)?;
            out.entry(record.external_id).or_insert(record);
        }
        Ok(out)
    }

    async fn upsert_one(&self, record: &EntityRecord) -> SyncResult<()> {
        self.upsert_many(record.kind, std::slice::from_ref(record))
            .await
    }

    async fn upsert_many(&self, kind: EntityKind, records: &[EntityRecord]) -> SyncResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        // One row per external id per statement; Postgres refuses to update a row twice.
        let mut seen = HashSet::with_capacity(records.len());
        let batch: Vec<&EntityRecord> = records
            .iter()
            .rev()
            .filter(|r| seen.insert(r.external_id))
            .collect();

        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO igdb_entities (storage_id, entity_type, external_id, body) ",
        );
        qb.push_values(batch, |mut b, r| {
            b.push_bind(r.storage_id)
                .push_bind(kind.endpoint())
                .push_bind(to_pg(r.external_id))
                .push_bind(&r.body);
        });
        qb.push(ENTITY_UPSERT_CONFLICT);
        qb.build().persistent(false).execute(&self.pool).await?;
        Ok(())
    }

    async fn paginate(
        &self,
        kind: EntityKind,
        offset: u64,
        limit: u64,
    ) -> SyncResult<Vec<EntityRecord>> {
        let rows = sqlx::query(
            "SELECT storage_id, external_id, body FROM igdb_entities
             WHERE entity_type = $1
             ORDER BY external_id ASC, storage_id
             OFFSET $2 LIMIT $3",
        )
        .persistent(false)
        .bind(kind.endpoint())
        .bind(to_pg(offset))
        .bind(to_pg(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Self::entity_from_row(kind, r))
            .collect()
    }

    async fn count(&self, kind: EntityKind) -> SyncResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM igdb_entities WHERE entity_type = $1")
            .persistent(false)
            .bind(kind.endpoint())
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn remove_duplicates(&self, kind: EntityKind) -> SyncResult<u64> {
        let res = sqlx::query(
            "DELETE FROM igdb_entities e
             USING (
                SELECT storage_id,
                       ROW_NUMBER() OVER (
                           PARTITION BY external_id
                           ORDER BY updated_at DESC, storage_id
                       ) AS rn
                FROM igdb_entities
                WHERE entity_type = $1
             ) d
             WHERE e.storage_id = d.storage_id AND d.rn > 1",
        )
        .persistent(false)
        .bind(kind.endpoint())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl AggregateStore for Db {
    async fn get(&self, game_id: u64) -> SyncResult<Option<StoredAggregate>> {
        let row = sqlx::query("SELECT storage_id, document FROM game_details WHERE external_id = $1")
            .persistent(false)
            .bind(to_pg(game_id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::aggregate_from_row(&r)).transpose()
    }

    async fn aggregated_ids(&self, game_ids: &[u64]) -> SyncResult<HashSet<u64>> {
        if game_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let pg_ids: Vec<i64> = game_ids.iter().copied().map(to_pg).collect();
        let found: Vec<i64> =
            sqlx::query_scalar("SELECT external_id FROM game_details WHERE external_id = ANY($1)")
                .persistent(false)
                .bind(&pg_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(found.into_iter().map(from_pg).collect())
    }

    async fn upsert(&self, aggregate: &StoredAggregate) -> SyncResult<()> {
        let document = serde_json::to_value(&aggregate.game)?;
        let res = sqlx::query(
            "INSERT INTO game_details (storage_id, external_id, document)
             VALUES ($1, $2, $3)
             ON CONFLICT (external_id) DO UPDATE SET
                document = EXCLUDED.document,
                updated_at = now()",
        )
        .persistent(false)
        .bind(aggregate.storage_id)
        .bind(to_pg(aggregate.game.id))
        .bind(&document)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(SyncError::Store(format!(
                "game {} aggregate was not written",
                aggregate.game.id
            )));
        }
        Ok(())
    }

    async fn count_games(&self) -> SyncResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM game_details")
            .persistent(false)
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}
