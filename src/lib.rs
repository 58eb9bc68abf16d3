// Expose modules for the binary, benchmarks and tests

pub mod alerts;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod notify;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod types;
