pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod expiry;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod payment;
pub mod wal;
