pub mod db;
pub mod igdb;
pub mod memory;
pub mod store;
pub mod worker_pool;
