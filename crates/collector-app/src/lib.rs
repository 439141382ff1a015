pub mod api;
pub mod config;
pub mod cycle;

pub use config::CollectorConfig;
