use crate::build::Build;
use cf_api::{ContainerPlatform, PlatformError};
use metrics::gauge;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
#[error("no available containers")]
pub struct NoAvailableContainer;

#[derive(Debug, Clone)]
struct Slot {
    guid: String,
    name: String,
    build: Option<Build>,
}

/// Locally cached view of the remote container pool.
///
/// The slot vector is the single shared mutable resource of the scheduler;
/// every mutation goes through `claim`/`release`/`refresh` under the lock,
/// so a scan-and-mark claim is atomic with respect to concurrent claims.
/// The remote platform stays the source of truth for what actually runs;
/// this view self-heals on the next refresh.
pub struct ContainerPool {
    platform: Arc<dyn ContainerPlatform>,
    slots: Mutex<Vec<Slot>>,
}

impl ContainerPool {
    pub fn new(platform: Arc<dyn ContainerPlatform>) -> Self {
        Self {
            platform,
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn count_available(&self) -> usize {
        self.slots
            .lock()
            .expect("pool lock poisoned")
            .iter()
            .filter(|slot| slot.build.is_none())
            .count()
    }

    pub fn total(&self) -> usize {
        self.slots.lock().expect("pool lock poisoned").len()
    }

    pub fn can_claim(&self) -> bool {
        self.count_available() > 0
    }

    /// Assign `build` to the first idle container in insertion order.
    ///
    /// The scan and the assignment happen under one lock acquisition, so
    /// two concurrent claims can never select the same container even
    /// though the remote calls that follow are asynchronous.
    pub fn claim(&self, build: &Build) -> Result<String, NoAvailableContainer> {
        let mut slots = self.slots.lock().expect("pool lock poisoned");
        let slot = slots
            .iter_mut()
            .find(|slot| slot.build.is_none())
            .ok_or(NoAvailableContainer)?;
        slot.build = Some(build.clone());
        debug!(build_id = %build.build_id(), guid = %slot.guid, name = %slot.name, "claimed container");
        Ok(slot.guid.clone())
    }

    /// Clear the assignment of the container with `guid`. Unknown guids
    /// are a no-op; the container may have been dropped by a refresh.
    pub fn release(&self, guid: &str) {
        let mut slots = self.slots.lock().expect("pool lock poisoned");
        if let Some(slot) = slots.iter_mut().find(|slot| slot.guid == guid) {
            slot.build = None;
            debug!(%guid, "released container");
        }
    }

    /// Clear whichever container holds `build_id`, returning its guid.
    /// `None` means no container holds the build (never started, already
    /// stopped, or orphaned by a refresh).
    pub fn release_build(&self, build_id: &str) -> Option<String> {
        let mut slots = self.slots.lock().expect("pool lock poisoned");
        let slot = slots.iter_mut().find(|slot| {
            slot.build
                .as_ref()
                .is_some_and(|build| build.build_id() == build_id)
        })?;
        slot.build = None;
        debug!(%build_id, guid = %slot.guid, "released container for build");
        Some(slot.guid.clone())
    }

    /// Replace the pool's identity list with the platform's current view.
    ///
    /// Only containers reporting a running state enter the view. Builds
    /// assigned to a guid that persists across the refresh are preserved;
    /// builds on a guid that disappeared remotely are orphaned and only
    /// logged, the platform being authoritative.
    pub async fn refresh(&self) -> Result<(), PlatformError> {
        let listed = self.platform.list_containers().await?;
        let mut running = Vec::with_capacity(listed.len());
        for summary in listed {
            let state = self.platform.container_state(&summary.guid).await?;
            if state.is_running() {
                running.push(summary);
            } else {
                debug!(guid = %summary.guid, ?state, "excluding non-running container");
            }
        }

        let mut slots = self.slots.lock().expect("pool lock poisoned");
        let mut previous: BTreeMap<String, Option<Build>> = slots
            .drain(..)
            .map(|slot| (slot.guid, slot.build))
            .collect();
        *slots = running
            .into_iter()
            .map(|summary| Slot {
                build: previous.remove(&summary.guid).flatten(),
                guid: summary.guid,
                name: summary.name,
            })
            .collect();
        for (guid, build) in previous {
            if let Some(build) = build {
                warn!(
                    %guid,
                    build_id = %build.build_id(),
                    "container disappeared from platform while assigned; build orphaned"
                );
            }
        }

        let available = slots.iter().filter(|slot| slot.build.is_none()).count();
        gauge!("stagehand_pool_containers", slots.len() as f64);
        gauge!("stagehand_pool_available", available as f64);
        info!(containers = slots.len(), available, "pool refreshed");
        Ok(())
    }

    /// Poll the platform on a fixed interval, keeping the previous view
    /// when a poll fails. Never returns.
    pub async fn run_refresh_loop(self: Arc<Self>, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh().await {
                warn!(error = %err, "pool refresh failed; keeping previous view");
            }
        }
    }
}
