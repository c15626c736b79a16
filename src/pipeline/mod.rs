pub mod metrics;
pub mod pii;
pub mod trace_builder;
