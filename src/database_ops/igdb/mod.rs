pub mod aggregate;
pub mod changes;
pub mod client;
pub mod document;
pub mod ingest;
pub mod kinds;
pub mod resolver;

#[cfg(test)]
pub(crate) mod testing;
