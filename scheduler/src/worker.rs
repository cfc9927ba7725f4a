use crate::build::Build;
use crate::config::SchedulerConfig;
use crate::dispatcher::{BuildDispatcher, DispatchError};
use anyhow::Result;
use async_nats::jetstream;
use async_nats::jetstream::{consumer::DeliverPolicy, AckKind, Message};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Pull build requests off the queue and hand them to the dispatcher.
///
/// Pulling is capacity-gated: while the pool is fully occupied the worker
/// idles instead of taking messages it cannot place. A request that loses
/// the race for the last container, or whose remote start fails, is NAKed
/// with a redelivery delay; undecodable payloads are acked and dropped.
pub async fn run_loop(dispatcher: Arc<BuildDispatcher>, cfg: SchedulerConfig) -> Result<()> {
    info!(nats_url = %cfg.nats_url, stream = %cfg.build_stream, subject = %cfg.build_subject, "build worker starting");
    let client = async_nats::connect(&cfg.nats_url).await?;
    let js = jetstream::new(client);
    let stream = js
        .get_or_create_stream(jetstream::stream::Config {
            name: cfg.build_stream.clone(),
            subjects: vec![cfg.build_subject.clone()],
            ..Default::default()
        })
        .await?;
    let consumer = stream
        .create_consumer(jetstream::consumer::pull::Config {
            durable_name: Some(cfg.build_consumer.clone()),
            filter_subject: cfg.build_subject.clone(),
            deliver_policy: DeliverPolicy::All,
            ..Default::default()
        })
        .await?;

    loop {
        if !dispatcher.can_start_build() {
            debug!("pool fully occupied; idling before next pull");
            tokio::time::sleep(cfg.pull_timeout).await;
            continue;
        }

        let mut batch = consumer
            .batch()
            .max_messages(1)
            .expires(cfg.pull_timeout)
            .messages()
            .await?;
        while let Some(message) = batch.next().await {
            match message {
                Ok(message) => handle_message(&dispatcher, message, &cfg).await,
                Err(err) => warn!(error = %err, "build worker: message error"),
            }
        }
    }
}

async fn handle_message(dispatcher: &Arc<BuildDispatcher>, msg: Message, cfg: &SchedulerConfig) {
    let build = match Build::from_message(&msg.message.payload) {
        Ok(build) => build,
        Err(err) => {
            warn!(error = %err, "undecodable build request; ack and skip");
            let _ = msg.ack().await;
            return;
        }
    };

    let build_id = build.build_id().to_string();
    match dispatcher.start_build(build).await {
        Ok(()) => {
            info!(%build_id, "build request accepted");
            let _ = msg.ack().await;
        }
        Err(DispatchError::NoAvailableContainer) => {
            debug!(%build_id, "no container free; redelivering later");
            let _ = msg.ack_with(AckKind::Nak(Some(cfg.requeue_delay))).await;
        }
        Err(err) => {
            error!(%build_id, error = %err, "build start failed; redelivering later");
            let _ = msg.ack_with(AckKind::Nak(Some(cfg.requeue_delay))).await;
        }
    }
}
