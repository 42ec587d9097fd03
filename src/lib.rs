pub mod cancel;
pub mod config;
pub mod error;
pub mod fetch;
pub mod history;
pub mod ingest;
pub mod period;
pub mod process;
pub mod store;
