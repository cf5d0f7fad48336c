// HTTP handlers for the webhook listener

use crate::api::models::*;
use crate::api::server::AppState;
use crate::database_ops::igdb::changes::ChangeError;
use crate::database_ops::igdb::kinds::EntityKind;
use crate::database_ops::store::{AggregateStore, COUNT_TIMEOUT};
use crate::error::with_timeout;
use actix_web::{web, HttpRequest, HttpResponse};

/// Header carrying the shared secret registered with upstream.
pub const SECRET_HEADER: &str = "X-Secret";

/// Liveness; also reports how many aggregates are stored.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let aggregates = with_timeout("aggregate count", COUNT_TIMEOUT, state.aggregates.count_games())
        .await
        .ok();

    HttpResponse::Ok().json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        aggregates,
        uptime_seconds: state.started.elapsed().as_secs(),
    }))
}

/// `POST /webhook/{endpoint}` with `{"id": N}`.
///
/// The credential is checked before anything else is decoded, so unauthenticated
/// callers only ever see 401.
pub async fn receive_change(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    let secret = req
        .headers()
        .get(SECRET_HEADER)
        .and_then(|h| h.to_str().ok());
    if !state.manager.verify_secret(secret) {
        return HttpResponse::Unauthorized().json(ApiResponse::error("invalid secret"));
    }

    let endpoint = path.into_inner();
    let kind = match endpoint.parse::<EntityKind>() {
        Ok(kind) => kind,
        Err(err) => return HttpResponse::BadRequest().json(ApiResponse::error(err.to_string())),
    };
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return HttpResponse::BadRequest()
                .json(ApiResponse::error(format!("undecodable body: {err}")))
        }
    };

    match state.manager.handle(kind, payload.id, secret).await {
        Ok(outcome) => HttpResponse::Ok().json(ApiResponse::success(outcome)),
        Err(err @ ChangeError::Unauthorized) => {
            HttpResponse::Unauthorized().json(ApiResponse::error(err.to_string()))
        }
        Err(err @ ChangeError::Rejected(_)) => {
            HttpResponse::BadRequest().json(ApiResponse::error(err.to_string()))
        }
        // 5xx so upstream redelivers
        Err(err @ ChangeError::Failed(_)) => {
            HttpResponse::InternalServerError().json(ApiResponse::error(err.to_string()))
        }
    }
}
