pub mod alerts;
pub mod api;
pub mod config;
pub mod envelope;
pub mod eth;
pub mod extract;
pub mod ingest;
pub mod ingest_stats;
pub mod models;
pub mod series;
pub mod storage;
pub mod whales;
