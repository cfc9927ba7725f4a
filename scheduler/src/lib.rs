//! Stagehand: assigns queued build jobs to a fixed pool of Cloud Foundry
//! containers, enforces a per-build timeout, and reports timed-out builds
//! back to their callback endpoints.

pub mod build;
pub mod config;
pub mod dispatcher;
pub mod pool;
pub mod reporter;
pub mod server;
pub mod testing;
pub mod worker;
