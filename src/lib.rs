pub mod api;
pub mod config;
pub mod database_ops;
pub mod error;
pub mod tracing;

pub mod util {
    pub mod env;
}
