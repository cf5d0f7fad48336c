// Webhook listener: receives IGDB change notifications and hands them to the
// incremental consistency manager.

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{AppState, WebhookServer};
