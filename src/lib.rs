pub mod app;
pub mod auth;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod pricing;
pub mod project;
pub mod query;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_support;
