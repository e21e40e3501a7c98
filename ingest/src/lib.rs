pub mod aggregate;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod merge;
pub mod metrics;
pub mod query;
pub mod record;
pub mod retry;
pub mod router;
pub mod server;
pub mod source;
pub mod sources;
pub mod store;
pub mod stores;
