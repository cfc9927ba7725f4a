use crate::build::Build;
use crate::pool::ContainerPool;
use crate::reporter::TimeoutNotifier;
use cf_api::{ContainerPlatform, PlatformError};
use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Every container is occupied; the caller decides whether to requeue.
    #[error("no available containers")]
    NoAvailableContainer,

    /// Applying the environment or restaging failed. The container has
    /// already been released; the build never started.
    #[error("remote mutation failed: {0}")]
    RemoteMutation(#[from] PlatformError),
}

/// Drives a build from claimed to running, and later to stopped — either
/// normally or through the timeout timer.
pub struct BuildDispatcher {
    pool: Arc<ContainerPool>,
    platform: Arc<dyn ContainerPlatform>,
    notifier: Arc<dyn TimeoutNotifier>,
    build_timeout: Duration,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BuildDispatcher {
    pub fn new(
        pool: Arc<ContainerPool>,
        platform: Arc<dyn ContainerPlatform>,
        notifier: Arc<dyn TimeoutNotifier>,
        build_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            platform,
            notifier,
            build_timeout,
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn can_start_build(&self) -> bool {
        self.pool.can_claim()
    }

    /// Claim a container, apply the build's environment, restage, and arm
    /// the timeout timer. Any remote failure releases the container and
    /// leaves the build never-started.
    pub async fn start_build(self: &Arc<Self>, build: Build) -> Result<(), DispatchError> {
        let guid = self
            .pool
            .claim(&build)
            .map_err(|_| DispatchError::NoAvailableContainer)?;

        if let Err(err) = self.apply_and_restage(&guid, &build).await {
            warn!(build_id = %build.build_id(), %guid, error = %err, "start failed; releasing container");
            self.pool.release(&guid);
            return Err(err.into());
        }

        info!(build_id = %build.build_id(), %guid, "build started");
        counter!("stagehand_builds_started_total", 1);
        self.arm_timer(build);
        Ok(())
    }

    /// The environment must be fully applied before the restage; staging
    /// with a stale environment is incorrect.
    async fn apply_and_restage(&self, guid: &str, build: &Build) -> Result<(), PlatformError> {
        self.platform
            .update_environment(guid, build.container_environment())
            .await?;
        self.platform.restage(guid).await
    }

    /// Normal completion or cancellation. Disarms the timer and frees the
    /// container; never takes the notification path.
    pub fn stop_build(&self, build: &Build) -> bool {
        self.stop_build_by_id(build.build_id())
    }

    /// Returns whether the build was actually live (a timer was disarmed
    /// or a container released); stopping an unknown build is a no-op.
    pub fn stop_build_by_id(&self, build_id: &str) -> bool {
        let handle = self
            .timers
            .lock()
            .expect("timer map lock poisoned")
            .remove(build_id);
        let disarmed = handle.is_some();
        if let Some(handle) = handle {
            handle.abort();
        }

        let released = self.pool.release_build(build_id).is_some();
        if disarmed || released {
            info!(%build_id, "build stopped");
        } else {
            debug!(%build_id, "stop of unknown build; no-op");
        }
        disarmed || released
    }

    fn arm_timer(self: &Arc<Self>, build: Build) {
        let build_id = build.build_id().to_string();
        let dispatcher = Arc::clone(self);

        // Spawn while holding the map lock: expiry starts by taking the
        // same lock, so even a zero-duration timer cannot look itself up
        // before its handle is registered.
        let mut timers = self.timers.lock().expect("timer map lock poisoned");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(dispatcher.build_timeout).await;
            dispatcher.handle_timeout(build).await;
        });
        if let Some(stale) = timers.insert(build_id.clone(), handle) {
            // Guard against a double start: never two live timers per build.
            stale.abort();
            warn!(build_id = %build_id, "replaced a live timeout timer");
        }
    }

    /// Timer expiry path. The task removes its own map entry before doing
    /// anything else; only the side that wins that removal reclaims the
    /// container and notifies, so an expiry racing an explicit stop
    /// reports at most once.
    async fn handle_timeout(self: Arc<Self>, build: Build) {
        let armed = self
            .timers
            .lock()
            .expect("timer map lock poisoned")
            .remove(build.build_id())
            .is_some();
        if !armed {
            return;
        }

        warn!(build_id = %build.build_id(), "build exceeded its timeout");
        counter!("stagehand_builds_timed_out_total", 1);
        self.pool.release_build(build.build_id());
        self.notifier.report_build_timeout(&build).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{build_fixture, CountingNotifier, InMemoryPlatform};

    async fn dispatcher_with(
        guids: &[&str],
        timeout: Duration,
    ) -> (
        Arc<InMemoryPlatform>,
        Arc<ContainerPool>,
        Arc<CountingNotifier>,
        Arc<BuildDispatcher>,
    ) {
        let platform = InMemoryPlatform::with_containers(guids);
        let pool = Arc::new(ContainerPool::new(platform.clone()));
        pool.refresh().await.unwrap();
        let notifier = Arc::new(CountingNotifier::default());
        let dispatcher = BuildDispatcher::new(
            pool.clone(),
            platform.clone(),
            notifier.clone(),
            timeout,
        );
        (platform, pool, notifier, dispatcher)
    }

    #[tokio::test]
    async fn start_applies_environment_before_restage() {
        let (platform, pool, _notifier, dispatcher) =
            dispatcher_with(&["a"], Duration::from_secs(60)).await;

        dispatcher.start_build(build_fixture("b-1")).await.unwrap();

        let env_calls = platform.environment_calls();
        assert_eq!(env_calls.len(), 1);
        assert_eq!(env_calls[0].0, "a");
        assert_eq!(env_calls[0].1["BUILD_ID"], "b-1");
        assert_eq!(platform.restage_calls(), vec!["a".to_string()]);
        assert_eq!(pool.count_available(), 0);
    }

    #[tokio::test]
    async fn start_fails_when_pool_is_full() {
        let (_platform, _pool, _notifier, dispatcher) =
            dispatcher_with(&[], Duration::from_secs(60)).await;

        let err = dispatcher.start_build(build_fixture("b-1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoAvailableContainer));
    }

    #[tokio::test]
    async fn restage_failure_releases_the_container() {
        let (platform, pool, notifier, dispatcher) =
            dispatcher_with(&["a"], Duration::from_millis(50)).await;
        platform.fail_restage(true);

        let err = dispatcher.start_build(build_fixture("b-1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::RemoteMutation(_)));
        assert_eq!(pool.count_available(), 1);

        // No timer was armed, so nothing fires later either.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(notifier.reports().is_empty());
    }

    #[tokio::test]
    async fn environment_failure_releases_the_container() {
        let (platform, pool, _notifier, dispatcher) =
            dispatcher_with(&["a"], Duration::from_secs(60)).await;
        platform.fail_environment(true);

        assert!(dispatcher.start_build(build_fixture("b-1")).await.is_err());
        assert_eq!(pool.count_available(), 1);
        assert!(platform.restage_calls().is_empty());
    }

    #[tokio::test]
    async fn concurrent_starts_claim_distinct_containers() {
        let (platform, _pool, _notifier, dispatcher) =
            dispatcher_with(&["a", "b"], Duration::from_secs(60)).await;
        // Hold both starts open across a suspension point.
        platform.set_mutation_delay(Duration::from_millis(50));

        let (first, second) = tokio::join!(
            dispatcher.start_build(build_fixture("b-1")),
            dispatcher.start_build(build_fixture("b-2")),
        );
        first.unwrap();
        second.unwrap();

        let mut restaged = platform.restage_calls();
        restaged.sort();
        assert_eq!(restaged, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn second_concurrent_start_fails_when_one_container_remains() {
        let (platform, _pool, _notifier, dispatcher) =
            dispatcher_with(&["a"], Duration::from_secs(60)).await;
        platform.set_mutation_delay(Duration::from_millis(50));

        let (first, second) = tokio::join!(
            dispatcher.start_build(build_fixture("b-1")),
            dispatcher.start_build(build_fixture("b-2")),
        );
        assert!(first.is_ok() != second.is_ok());
        let failed = if first.is_err() { first } else { second };
        assert!(matches!(
            failed.unwrap_err(),
            DispatchError::NoAvailableContainer
        ));
    }

    #[tokio::test]
    async fn stop_before_timeout_never_notifies() {
        let (_platform, pool, notifier, dispatcher) =
            dispatcher_with(&["a"], Duration::from_millis(200)).await;

        let build = build_fixture("b-1");
        dispatcher.start_build(build.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.stop_build(&build));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(notifier.reports().is_empty());
        assert_eq!(pool.count_available(), 1);
    }

    #[tokio::test]
    async fn timeout_notifies_exactly_once_and_frees_the_container() {
        let (_platform, pool, notifier, dispatcher) =
            dispatcher_with(&["a"], Duration::from_millis(100)).await;

        let build = build_fixture("b-1");
        dispatcher.start_build(build.clone()).await.unwrap();
        assert_eq!(pool.count_available(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(notifier.reports(), vec!["b-1".to_string()]);
        assert_eq!(pool.count_available(), 1);

        // A late explicit stop after expiry is a no-op.
        assert!(!dispatcher.stop_build(&build));
        assert_eq!(notifier.reports().len(), 1);
    }

    #[tokio::test]
    async fn double_start_leaves_a_single_live_timer() {
        let (_platform, _pool, notifier, dispatcher) =
            dispatcher_with(&["a", "b"], Duration::from_millis(100)).await;

        let build = build_fixture("b-1");
        dispatcher.start_build(build.clone()).await.unwrap();
        dispatcher.start_build(build).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(notifier.reports(), vec!["b-1".to_string()]);
    }

    #[tokio::test]
    async fn stop_of_unknown_build_is_a_noop() {
        let (_platform, _pool, _notifier, dispatcher) =
            dispatcher_with(&["a"], Duration::from_secs(60)).await;
        assert!(!dispatcher.stop_build_by_id("never-started"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_timeout_fires_immediately_and_exactly_once() {
        let (_platform, pool, notifier, dispatcher) =
            dispatcher_with(&["a"], Duration::ZERO).await;

        dispatcher.start_build(build_fixture("b-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(notifier.reports(), vec!["b-1".to_string()]);
        assert_eq!(pool.count_available(), 1);
    }

    #[tokio::test]
    async fn one_second_timer_fires_with_the_started_build_id() {
        let (_platform, _pool, notifier, dispatcher) =
            dispatcher_with(&["a"], Duration::from_secs(1)).await;

        dispatcher.start_build(build_fixture("b-timer")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(notifier.reports(), vec!["b-timer".to_string()]);
    }
}
