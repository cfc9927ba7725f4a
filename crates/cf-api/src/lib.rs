//! Cloud Foundry API client for the build scheduler.
//!
//! The scheduler only needs four operations against the platform: list the
//! apps in the build space, read an app's instance state, replace an app's
//! environment, and restage it. They are expressed as the
//! [`ContainerPlatform`] trait so the scheduler can run against an in-memory
//! platform in tests.

mod client;

pub use client::{CfApiConfig, CloudFoundryClient};

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("platform authentication failed: {message}")]
    Auth { message: String },

    #[error("platform request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("platform returned HTTP {status} for {operation}")]
    Api { operation: &'static str, status: u16 },

    #[error("platform configuration error: {message}")]
    Config { message: String },
}

/// A compute unit known to the remote platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub guid: String,
    pub name: String,
}

/// Remote run state of a container. Anything other than `Running` is
/// excluded from the scheduler's live pool view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Other(String),
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

impl From<&str> for ContainerState {
    fn from(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("RUNNING") {
            ContainerState::Running
        } else {
            ContainerState::Other(raw.to_string())
        }
    }
}

/// The remote container-platform operations the scheduler depends on.
#[async_trait]
pub trait ContainerPlatform: Send + Sync {
    /// List the containers currently present in the build space.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, PlatformError>;

    /// Read the run state of a single container.
    async fn container_state(&self, guid: &str) -> Result<ContainerState, PlatformError>;

    /// Replace the container's environment with `environment`.
    async fn update_environment(
        &self,
        guid: &str,
        environment: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError>;

    /// Restart the container's process with its currently configured
    /// environment.
    async fn restage(&self, guid: &str) -> Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parses_running_case_insensitively() {
        assert!(ContainerState::from("RUNNING").is_running());
        assert!(ContainerState::from("running").is_running());
        assert_eq!(
            ContainerState::from("CRASHED"),
            ContainerState::Other("CRASHED".to_string())
        );
    }
}
