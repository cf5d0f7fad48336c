use anyhow::{Context, Result};
use clap::Parser;
use futures::future::try_join_all;
use igdb_mirror::api::{AppState, WebhookServer};
use igdb_mirror::config::MirrorConfig;
use igdb_mirror::database_ops::db::Db;
use igdb_mirror::database_ops::igdb::changes::ChangeManager;
use igdb_mirror::database_ops::igdb::client::{IgdbClient, WebhookMethod};
use igdb_mirror::database_ops::igdb::ingest::SyncEngine;
use igdb_mirror::database_ops::igdb::kinds::EntityKind;
use igdb_mirror::database_ops::memory::MemoryStore;
use igdb_mirror::database_ops::store::{AggregateStore, EntityStore};
use igdb_mirror::util::env::init_env;
use std::sync::Arc;
use tracing::{info, warn};

/// Mirror IGDB into a local store, build denormalized games and keep them fresh.
#[derive(Debug, Parser)]
#[command(name = "igdb-mirror", version)]
struct Cli {
    /// Sync collections that have no local records yet
    #[arg(long)]
    fetch: bool,
    /// Sync every selected collection, even populated ones
    #[arg(long)]
    re_fetch: bool,
    /// Aggregate games that have no aggregate yet
    #[arg(long)]
    aggregate: bool,
    /// Rebuild every aggregate
    #[arg(long)]
    re_aggregate: bool,
    /// Remove repeated records before anything else
    #[arg(long)]
    dedupe: bool,
    /// Register webhooks and listen for changes (default)
    #[arg(long, overrides_with = "no_webhook")]
    webhook: bool,
    #[arg(long, overrides_with = "webhook")]
    no_webhook: bool,
    /// Limit fetch and dedupe to these endpoints, e.g. `genres,games`
    #[arg(long, value_delimiter = ',')]
    kinds: Vec<EntityKind>,
    /// Use the in-process store instead of Postgres (dry runs)
    #[arg(long)]
    memory: bool,
}

async fn register_webhooks(client: &IgdbClient, cfg: &MirrorConfig, secret: &str) -> Result<()> {
    if cfg.public_webhook_base().is_none() {
        info!("EXTERNAL_URL unset or loopback; skipping webhook registration");
        return Ok(());
    }
    let targets: Vec<(EntityKind, String)> = EntityKind::ALL
        .iter()
        .copied()
        .filter(|k| k.accepts_webhooks())
        .filter_map(|k| cfg.webhook_url(k).map(|url| (k, url)))
        .collect();

    try_join_all(targets.iter().flat_map(|(kind, url)| {
        [WebhookMethod::Create, WebhookMethod::Update]
            .into_iter()
            .map(move |method| client.register_webhook(*kind, url, secret, method))
    }))
    .await
    .context("registering IGDB webhooks")?;
    info!(endpoints = targets.len(), "webhooks registered");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    igdb_mirror::tracing::init_tracing("info,sqlx=warn,actix_server=warn")?;
    let cli = Cli::parse();
    let cfg = MirrorConfig::from_env()?;

    let store: Arc<dyn EntityStore>;
    let aggregates: Arc<dyn AggregateStore>;
    let mut db: Option<Db> = None;
    if cli.memory {
        warn!("using the in-memory store; nothing survives this process");
        let memory = Arc::new(MemoryStore::new());
        store = memory.clone();
        aggregates = memory;
    } else {
        let opened = Db::open(cfg.require_database_url()?, cfg.db_max_conns)
            .await
            .context("opening mirror database")?;
        let shared = Arc::new(opened.clone());
        store = shared.clone();
        aggregates = shared;
        db = Some(opened);
    }

    let client = Arc::new(IgdbClient::new_from_env()?);
    let engine = SyncEngine::new(store, aggregates.clone(), client.clone(), cfg.sync);
    let kinds = if cli.kinds.is_empty() {
        EntityKind::ALL.to_vec()
    } else {
        cli.kinds.clone()
    };

    if cli.dedupe {
        let removed = engine.dedupe(&kinds).await.context("dedupe")?;
        info!(removed, "dedupe finished");
    }

    if cli.fetch || cli.re_fetch {
        let summary = engine
            .fetch_all(&kinds, cli.re_fetch)
            .await
            .context("fetch")?;
        if summary.failures() > 0 {
            warn!(
                failures = summary.failures(),
                "some pages failed; re-run --fetch to retry them"
            );
        }
    }

    if cli.aggregate || cli.re_aggregate {
        let report = engine
            .aggregate_all(cli.re_aggregate)
            .await
            .context("aggregate")?;
        if !report.is_clean() {
            warn!(failures = report.failures.len(), "some games failed to aggregate");
        }
    }

    if cli.webhook || !cli.no_webhook {
        let secret = cfg.require_webhook_secret()?.to_string();
        register_webhooks(&client, &cfg, &secret).await?;
        let manager = Arc::new(ChangeManager::new(
            engine.resolver().clone(),
            aggregates.clone(),
            secret,
        ));
        WebhookServer::new(cfg.webhook_addr)
            .run(AppState::new(manager, aggregates))
            .await?;
    }

    if let Some(db) = db {
        db.close().await;
    }
    Ok(())
}
