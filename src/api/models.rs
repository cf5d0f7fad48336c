// Listener request/response models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub meta: Meta,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Meta::now(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            meta: Meta::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Upstream posts the changed record; only its id matters here. A missing id
/// decodes as 0 and is rejected downstream.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Aggregates stored, when the store answered in time.
    pub aggregates: Option<u64>,
    pub uptime_seconds: u64,
}
