pub mod filters;
pub mod grouping;
pub mod guardrails;
pub mod handler;
pub mod planner;
