use anyhow::{anyhow, Context};
use async_trait::async_trait;
use itertools::Itertools;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::document::ExternalId;
use super::kinds::EntityKind;
use crate::error::{SyncError, SyncResult};
use crate::util::env::{env_opt, env_parse, env_req};

const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const IGDB_API_BASE: &str = "https://api.igdb.com/v4";
/// Upstream cap on `limit` and on ids per `where id = (...)` clause.
pub const IGDB_MAX_LIMIT: usize = 500;

/// Remote side of the mirror.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn count(&self, kind: EntityKind) -> SyncResult<u64>;

    /// Bodies ordered by id ascending.
    async fn page(&self, kind: EntityKind, offset: u64, limit: u64) -> SyncResult<Vec<Value>>;

    /// Ids that do not exist upstream are simply absent from the result.
    async fn get_by_ids(&self, kind: EntityKind, ids: &[u64]) -> SyncResult<Vec<Value>>;

    async fn get_by_id(&self, kind: EntityKind, id: u64) -> SyncResult<Value> {
        self.get_by_ids(kind, &[id])
            .await?
            .into_iter()
            .find(|body| body.external_id() == Some(id))
            .ok_or(SyncError::NotFound { kind, id })
    }

    /// Longest a single call may spend waiting between attempts.
    fn retry_allowance(&self) -> Duration {
        Duration::ZERO
    }
}

/// Deadline for one remote call: `base` for the exchange itself plus the source's
/// retry allowance, so backoff never turns a recoverable call into a timeout.
pub fn remote_deadline(remote: &dyn CatalogSource, base: Duration) -> Duration {
    base + remote.retry_allowance()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookMethod {
    Create,
    Update,
}

impl WebhookMethod {
    fn as_str(self) -> &'static str {
        match self {
            WebhookMethod::Create => "create",
            WebhookMethod::Update => "update",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IgdbClientConfig {
    pub api_base: String,
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
    pub rps: f32,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl IgdbClientConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            api_base: env_opt("IGDB_API_BASE").unwrap_or_else(|| IGDB_API_BASE.to_string()),
            client_id: env_req("TWITCH_CLIENT_ID")
                .context("TWITCH_CLIENT_ID is required for IGDB")?,
            client_secret: env_req("TWITCH_CLIENT_SECRET")
                .context("TWITCH_CLIENT_SECRET is required for IGDB")?,
            user_agent: env_opt("IGDB_USER_AGENT")
                .unwrap_or_else(|| "igdb-mirror/0.1".to_string()),
            rps: env_parse("IGDB_RPS", 4.0f32),
            max_retries: env_parse("IGDB_MAX_RETRIES", 5u32),
            backoff_ms: env_parse("IGDB_BACKOFF_MS", 1000u64),
        })
    }

    /// Linear backoff plus up to 25% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_ms * ((attempt + 1) as u64);
        let jitter = if base >= 4 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Every backoff at full jitter plus one throttle slot per attempt.
    pub fn retry_allowance(&self) -> Duration {
        let backoff_ms: u64 = (1..=self.max_retries as u64)
            .map(|n| {
                let base = self.backoff_ms * n;
                base + base / 4
            })
            .sum();
        let slots = self.per_request_interval().unwrap_or_default() * (self.max_retries + 1);
        Duration::from_millis(backoff_ms) + slots
    }

    fn per_request_interval(&self) -> Option<Duration> {
        if self.rps > 0.0 {
            Some(Duration::from_secs_f64(1.0 / self.rps as f64))
        } else {
            None
        }
    }
}

/// Spaces every outbound request, across all tasks sharing the client.
#[derive(Clone)]
struct RequestThrottle {
    interval: Option<Duration>,
    next_allowed: Arc<Mutex<Instant>>,
}

impl RequestThrottle {
    fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            next_allowed: Arc::new(Mutex::new(Instant::now())),
        }
    }

    async fn wait(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let mut next_allowed = self.next_allowed.lock().await;
        let now = Instant::now();
        let wait_until = if now >= *next_allowed {
            now
        } else {
            *next_allowed
        };
        let sleep_duration = wait_until.saturating_duration_since(now);
        *next_allowed = wait_until + interval;
        drop(next_allowed);

        if !sleep_duration.is_zero() {
            tokio::time::sleep(sleep_duration).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct TwitchTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct IgdbToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

pub struct IgdbClient {
    cfg: IgdbClientConfig,
    http: Client,
    token: Arc<Mutex<Option<IgdbToken>>>,
    throttle: RequestThrottle,
}

impl IgdbClient {
    pub fn new(cfg: IgdbClientConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to construct IGDB HTTP client")?;
        let throttle = RequestThrottle::new(cfg.per_request_interval());
        Ok(Self {
            cfg,
            http,
            token: Arc::new(Mutex::new(None)),
            throttle,
        })
    }

    pub fn new_from_env() -> anyhow::Result<Self> {
        Self::new(IgdbClientConfig::from_env()?)
    }

    fn endpoint_url(&self, kind: EntityKind, suffix: &str) -> String {
        format!(
            "{}/{}{}",
            self.cfg.api_base.trim_end_matches('/'),
            kind.endpoint(),
            suffix
        )
    }

    async fn ensure_token(&self) -> anyhow::Result<String> {
        {
            let guard = self.token.lock().await;
            if let Some(token) = guard.as_ref() {
                if token.expires_at > Instant::now() + Duration::from_secs(30) {
                    return Ok(token.access_token.clone());
                }
            }
        }
        let token = self.request_new_token().await?;
        let mut guard = self.token.lock().await;
        *guard = Some(token.clone());
        Ok(token.access_token)
    }

    async fn request_new_token(&self) -> anyhow::Result<IgdbToken> {
        let response = self
            .http
            .post(TWITCH_TOKEN_URL)
            .query(&[
                ("client_id", self.cfg.client_id.as_str()),
                ("client_secret", self.cfg.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .context("requesting Twitch OAuth token")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "twitch token request failed (status={}): {}",
                status,
                text
            ));
        }
        let token: TwitchTokenResponse = response.json().await?;
        let ttl = token.expires_in.saturating_sub(30).max(30);
        info!(target = "igdb", ttl_secs = ttl, "obtained IGDB access token");
        Ok(IgdbToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(ttl),
        })
    }

    /// POSTs an Apicalypse query, retrying 429/5xx and transport errors with linear backoff.
    async fn execute_raw(&self, url: &str, body: String) -> anyhow::Result<String> {
        let mut attempt = 0u32;
        loop {
            let token = self.ensure_token().await?;
            self.throttle.wait().await;
            let response = self
                .http
                .post(url)
                .header("Client-ID", &self.cfg.client_id)
                .header("Content-Type", "text/plain")
                .header("Authorization", format!("Bearer {}", token))
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if status == StatusCode::UNAUTHORIZED {
                        let mut guard = self.token.lock().await;
                        *guard = None;
                    }

                    let retryable = status == StatusCode::TOO_MANY_REQUESTS
                        || status == StatusCode::UNAUTHORIZED
                        || status.is_server_error();
                    if retryable && attempt < self.cfg.max_retries {
                        let wait = self.cfg.backoff(attempt);
                        warn!(target = "igdb", %status, attempt, wait_ms = wait.as_millis() as u64, url, "igdb request retry");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }

                    let text = resp.text().await.unwrap_or_default();
                    return Err(anyhow!("igdb request failed (status={}): {}", status, text));
                }
                Err(err) => {
                    if attempt >= self.cfg.max_retries {
                        return Err(err.into());
                    }
                    let wait = self.cfg.backoff(attempt);
                    warn!(target = "igdb", error = %err, attempt, url, "igdb transport error, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                    continue;
                }
            }
        }
    }

    async fn query(&self, kind: EntityKind, body: String) -> SyncResult<Vec<Value>> {
        let url = self.endpoint_url(kind, "");
        let text = self
            .execute_raw(&url, body)
            .await
            .map_err(SyncError::Upstream)?;
        serde_json::from_str(&text)
            .map_err(|err| SyncError::Upstream(anyhow!("failed to parse IGDB payload ({err}): {text}")))
    }

    /// Registers a webhook for `kind` pointing at `url`.
    #[instrument(skip(self, secret))]
    pub async fn register_webhook(
        &self,
        kind: EntityKind,
        url: &str,
        secret: &str,
        method: WebhookMethod,
    ) -> SyncResult<()> {
        let token = self.ensure_token().await.map_err(SyncError::Upstream)?;
        self.throttle.wait().await;
        let resp = self
            .http
            .post(self.endpoint_url(kind, "/webhooks/"))
            .header("Client-ID", &self.cfg.client_id)
            .header("Authorization", format!("Bearer {}", token))
            .form(&[("url", url), ("secret", secret), ("method", method.as_str())])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SyncError::Upstream(anyhow!(
                "webhook registration for {kind} failed (status={status}): {text}"
            )));
        }
        Ok(())
    }
}

pub(crate) fn page_query(offset: u64, limit: u64) -> String {
    format!("fields *; sort id asc; limit {limit}; offset {offset};")
}

pub(crate) fn ids_query(ids: &[u64]) -> String {
    format!(
        "fields *; where id = ({}); limit {};",
        ids.iter().join(","),
        ids.len().clamp(1, IGDB_MAX_LIMIT)
    )
}

#[async_trait]
impl CatalogSource for IgdbClient {
    #[instrument(skip(self))]
    async fn count(&self, kind: EntityKind) -> SyncResult<u64> {
        let url = self.endpoint_url(kind, "/count");
        let text = self
            .execute_raw(&url, String::new())
            .await
            .map_err(SyncError::Upstream)?;
        let parsed: CountResponse = serde_json::from_str(&text)
            .map_err(|err| SyncError::Upstream(anyhow!("bad count payload ({err}): {text}")))?;
        Ok(parsed.count)
    }

    async fn page(&self, kind: EntityKind, offset: u64, limit: u64) -> SyncResult<Vec<Value>> {
        let limit = limit.clamp(1, IGDB_MAX_LIMIT as u64);
        debug!(target = "igdb", kind = %kind, offset, limit, "fetching page");
        self.query(kind, page_query(offset, limit)).await
    }

    async fn get_by_ids(&self, kind: EntityKind, ids: &[u64]) -> SyncResult<Vec<Value>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IGDB_MAX_LIMIT) {
            out.extend(self.query(kind, ids_query(chunk)).await?);
        }
        Ok(out)
    }

    fn retry_allowance(&self) -> Duration {
        self.cfg.retry_allowance()
    }
}
