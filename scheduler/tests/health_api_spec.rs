//! Integration tests for the scheduler's HTTP surface: the capacity probe
//! and the build-done signal.

use scheduler::dispatcher::BuildDispatcher;
use scheduler::pool::ContainerPool;
use scheduler::server::{serve, AppState};
use scheduler::testing::{build_fixture, CountingNotifier, InMemoryPlatform};
use serial_test::serial;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn start_test_server(port: u16) -> (Arc<ContainerPool>, Arc<BuildDispatcher>) {
    let platform = InMemoryPlatform::with_containers(&["a", "b"]);
    let pool = Arc::new(ContainerPool::new(platform.clone()));
    pool.refresh().await.unwrap();
    let notifier = Arc::new(CountingNotifier::default());
    let dispatcher = BuildDispatcher::new(
        pool.clone(),
        platform,
        notifier,
        Duration::from_secs(60),
    );

    let state = AppState {
        dispatcher: dispatcher.clone(),
        pool: pool.clone(),
    };
    tokio::spawn(async move {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        if let Err(err) = serve(addr, state).await {
            eprintln!("test server error: {err}");
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    (pool, dispatcher)
}

#[tokio::test]
#[serial]
async fn given_idle_pool_when_healthcheck_then_reports_capacity() -> anyhow::Result<()> {
    let (_pool, _dispatcher) = start_test_server(18117).await;

    let body: serde_json::Value = reqwest::Client::new()
        .get("http://127.0.0.1:18117/healthcheck")
        .send()
        .await?
        .json()
        .await?;

    assert_eq!(body["ok"], true);
    assert_eq!(body["containers"], 2);
    assert_eq!(body["available"], 2);
    Ok(())
}

#[tokio::test]
#[serial]
async fn given_running_build_when_done_posted_then_container_is_freed() -> anyhow::Result<()> {
    let (pool, dispatcher) = start_test_server(18118).await;
    dispatcher.start_build(build_fixture("b-1")).await?;
    assert_eq!(pool.count_available(), 1);

    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .post("http://127.0.0.1:18118/builds/b-1/done")
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["stopped"], true);
    assert_eq!(pool.count_available(), 2);

    // A second done signal for the same build is a no-op.
    let body: serde_json::Value = client
        .post("http://127.0.0.1:18118/builds/b-1/done")
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["stopped"], false);
    Ok(())
}
