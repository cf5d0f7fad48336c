use anyhow::Context;
use std::net::SocketAddr;
use url::Url;

use crate::database_ops::igdb::client::IGDB_MAX_LIMIT;
use crate::database_ops::igdb::ingest::SyncSettings;
use crate::database_ops::igdb::kinds::EntityKind;
use crate::util::env::{env_opt, env_parse};

/// Runtime configuration read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub database_url: Option<String>,
    pub db_max_conns: u32,
    pub webhook_secret: Option<String>,
    pub webhook_addr: SocketAddr,
    pub external_url: Option<Url>,
    pub sync: SyncSettings,
}

impl MirrorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let webhook_addr = env_opt("WEBHOOK_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("WEBHOOK_ADDR must be host:port")?;
        let external_url = env_opt("EXTERNAL_URL")
            .map(|raw| Url::parse(&raw).with_context(|| format!("EXTERNAL_URL is not a URL: {raw}")))
            .transpose()?;

        Ok(Self {
            database_url: env_opt("DATABASE_URL"),
            db_max_conns: env_parse("DB_MAX_CONNS", 10u32),
            webhook_secret: env_opt("WEBHOOK_SECRET"),
            webhook_addr,
            external_url,
            sync: SyncSettings {
                sync_concurrency: env_parse("SYNC_CONCURRENCY", 3usize),
                aggregate_concurrency: env_parse("AGGREGATE_CONCURRENCY", 10usize),
                page_size: env_parse("SYNC_PAGE_SIZE", IGDB_MAX_LIMIT as u64)
                    .clamp(1, IGDB_MAX_LIMIT as u64),
            },
        })
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is required unless --memory is set")
    }

    pub fn require_webhook_secret(&self) -> anyhow::Result<&str> {
        self.webhook_secret
            .as_deref()
            .context("WEBHOOK_SECRET is required to run the webhook listener")
    }

    /// Public base URL for webhook registration; `None` when unset or loopback,
    /// since upstream could never reach it.
    pub fn public_webhook_base(&self) -> Option<&Url> {
        self.external_url.as_ref().filter(|url| !is_loopback(url))
    }

    /// Where upstream should post changes for `kind`, if registration applies.
    pub fn webhook_url(&self, kind: EntityKind) -> Option<String> {
        self.public_webhook_base().map(|base| {
            format!(
                "{}/webhook/{}",
                base.as_str().trim_end_matches('/'),
                kind.endpoint()
            )
        })
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback() || ip.is_unspecified(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback() || ip.is_unspecified(),
        None => true,
    }
}
