//! In-memory stand-ins for the remote platform and the timeout notifier,
//! shared by unit tests and the integration specs.

use crate::build::Build;
use crate::reporter::TimeoutNotifier;
use async_trait::async_trait;
use cf_api::{ContainerPlatform, ContainerState, ContainerSummary, PlatformError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Queue-message payload for a build with the given id and callback URLs.
pub fn build_message(build_id: &str, log_callback: &str, status_callback: &str) -> Vec<u8> {
    serde_json::json!({
        "containerEnvironment": {
            "BUILD_ID": build_id,
            "LOG_CALLBACK": log_callback,
            "STATUS_CALLBACK": status_callback,
        }
    })
    .to_string()
    .into_bytes()
}

/// A decoded build whose callbacks point nowhere routable.
pub fn build_fixture(build_id: &str) -> Build {
    let payload = build_message(
        build_id,
        &format!("http://127.0.0.1:9/log/{build_id}"),
        &format!("http://127.0.0.1:9/status/{build_id}"),
    );
    Build::from_message(&payload).expect("valid build fixture")
}

/// Scriptable [`ContainerPlatform`] recording the mutations it receives.
#[derive(Default)]
pub struct InMemoryPlatform {
    containers: Mutex<Vec<ContainerSummary>>,
    stopped: Mutex<BTreeSet<String>>,
    fail_listing: AtomicBool,
    fail_environment: AtomicBool,
    fail_restage: AtomicBool,
    mutation_delay_ms: AtomicU64,
    environment_calls: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    restage_calls: Mutex<Vec<String>>,
}

impl InMemoryPlatform {
    pub fn with_containers(guids: &[&str]) -> Arc<Self> {
        let platform = Arc::new(Self::default());
        platform.set_containers(guids);
        platform
    }

    pub fn set_containers(&self, guids: &[&str]) {
        *self.containers.lock().unwrap() = guids
            .iter()
            .map(|guid| ContainerSummary {
                guid: guid.to_string(),
                name: format!("builder-{guid}"),
            })
            .collect();
    }

    pub fn mark_stopped(&self, guid: &str) {
        self.stopped.lock().unwrap().insert(guid.to_string());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn fail_environment(&self, fail: bool) {
        self.fail_environment.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restage(&self, fail: bool) {
        self.fail_restage.store(fail, Ordering::SeqCst);
    }

    /// Delay every remote mutation, to hold `start_build` open across a
    /// suspension point.
    pub fn set_mutation_delay(&self, delay: Duration) {
        self.mutation_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn environment_calls(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.environment_calls.lock().unwrap().clone()
    }

    pub fn restage_calls(&self) -> Vec<String> {
        self.restage_calls.lock().unwrap().clone()
    }

    async fn mutation_delay(&self) {
        let millis = self.mutation_delay_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    fn scripted_failure(flag: &AtomicBool, operation: &'static str) -> Result<(), PlatformError> {
        if flag.load(Ordering::SeqCst) {
            Err(PlatformError::Api {
                operation,
                status: 500,
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContainerPlatform for InMemoryPlatform {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, PlatformError> {
        Self::scripted_failure(&self.fail_listing, "list apps")?;
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn container_state(&self, guid: &str) -> Result<ContainerState, PlatformError> {
        if self.stopped.lock().unwrap().contains(guid) {
            Ok(ContainerState::Other("STOPPED".to_string()))
        } else {
            Ok(ContainerState::Running)
        }
    }

    async fn update_environment(
        &self,
        guid: &str,
        environment: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError> {
        self.mutation_delay().await;
        Self::scripted_failure(&self.fail_environment, "update environment")?;
        self.environment_calls
            .lock()
            .unwrap()
            .push((guid.to_string(), environment.clone()));
        Ok(())
    }

    async fn restage(&self, guid: &str) -> Result<(), PlatformError> {
        self.mutation_delay().await;
        Self::scripted_failure(&self.fail_restage, "restage")?;
        self.restage_calls.lock().unwrap().push(guid.to_string());
        Ok(())
    }
}

/// Notifier that records which builds were reported instead of POSTing.
#[derive(Default)]
pub struct CountingNotifier {
    reports: Mutex<Vec<String>>,
}

impl CountingNotifier {
    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl TimeoutNotifier for CountingNotifier {
    async fn report_build_timeout(&self, build: &Build) {
        self.reports
            .lock()
            .unwrap()
            .push(build.build_id().to_string());
    }
}
