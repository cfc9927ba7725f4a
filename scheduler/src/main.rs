use anyhow::Result;
use cf_api::{CfApiConfig, CloudFoundryClient, ContainerPlatform};
use scheduler::config::SchedulerConfig;
use scheduler::dispatcher::BuildDispatcher;
use scheduler::pool::ContainerPool;
use scheduler::reporter::CallbackReporter;
use scheduler::server::{self, AppState};
use scheduler::worker;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = SchedulerConfig::default();
    info!(?config, "starting build scheduler");

    let platform: Arc<dyn ContainerPlatform> =
        Arc::new(CloudFoundryClient::new(CfApiConfig::from_env()?)?);
    let pool = Arc::new(ContainerPool::new(Arc::clone(&platform)));
    let reporter = Arc::new(CallbackReporter::new()?);
    let dispatcher = BuildDispatcher::new(
        pool.clone(),
        platform,
        reporter,
        config.build_timeout,
    );

    let refresh = tokio::spawn(pool.clone().run_refresh_loop(config.poll_interval));
    let queue = tokio::spawn(worker::run_loop(dispatcher.clone(), config.clone()));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let api = tokio::spawn(server::serve(addr, AppState { dispatcher, pool }));

    tokio::select! {
        result = refresh => {
            error!(?result, "pool refresh loop exited");
        }
        result = queue => {
            error!(?result, "build worker exited");
        }
        result = api => {
            error!(?result, "API server exited");
        }
    }

    anyhow::bail!("scheduler task exited unexpectedly")
}
