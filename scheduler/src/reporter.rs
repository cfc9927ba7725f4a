use crate::build::Build;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::time::Duration;
use tracing::{info, warn};

const TIMEOUT_MESSAGE: &str = "The build timed out";
const REPORTER_SOURCE: &str = "Build scheduler";

/// Seam between the dispatcher's timeout path and the outside world, so
/// tests can observe notifications without an HTTP round trip.
#[async_trait]
pub trait TimeoutNotifier: Send + Sync {
    async fn report_build_timeout(&self, build: &Build);
}

/// Best-effort notifier: POSTs the fixed timed-out payloads to the
/// build's log and status callbacks. Delivery failures are logged and
/// swallowed; reporting must never block or fail pool reclamation.
pub struct CallbackReporter {
    http: reqwest::Client,
}

impl CallbackReporter {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }

    async fn post(&self, url: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        let response = self.http.post(url).json(payload).send().await?;
        anyhow::ensure!(
            response.status().is_success(),
            "callback returned HTTP {}",
            response.status()
        );
        Ok(())
    }
}

#[async_trait]
impl TimeoutNotifier for CallbackReporter {
    async fn report_build_timeout(&self, build: &Build) {
        let encoded = BASE64.encode(TIMEOUT_MESSAGE);
        let log_payload = serde_json::json!({
            "output": encoded,
            "source": REPORTER_SOURCE,
        });
        let status_payload = serde_json::json!({
            "message": encoded,
            "status": "error",
        });

        let (log_result, status_result) = tokio::join!(
            self.post(build.log_callback(), &log_payload),
            self.post(build.status_callback(), &status_payload),
        );

        let delivered = log_result.is_ok() || status_result.is_ok();
        if let Err(err) = log_result {
            warn!(build_id = %build.build_id(), error = %err, "log callback delivery failed");
        }
        if let Err(err) = status_result {
            warn!(build_id = %build.build_id(), error = %err, "status callback delivery failed");
        }
        if delivered {
            info!(build_id = %build.build_id(), "timeout reported");
        }
    }
}
