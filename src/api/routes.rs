// Listener route configuration

use crate::api::handlers;
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        // One path per IGDB endpoint, e.g. /webhook/covers
        .route("/webhook/{endpoint}", web::post().to(handlers::receive_change));
}
