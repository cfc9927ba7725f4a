use crate::{ContainerPlatform, ContainerState, ContainerSummary, PlatformError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Connection settings for the Cloud Foundry API and its UAA token
/// endpoint, read once at process start.
#[derive(Debug, Clone)]
pub struct CfApiConfig {
    pub api_url: String,
    pub token_url: String,
    pub username: String,
    pub password: String,
    pub space_guid: String,
    pub request_timeout: Duration,
}

impl CfApiConfig {
    pub fn from_env() -> Result<Self, PlatformError> {
        Ok(Self {
            api_url: require_var("CF_API_URL")?,
            token_url: require_var("CF_TOKEN_URL")?,
            username: require_var("CF_USERNAME")?,
            password: require_var("CF_PASSWORD")?,
            space_guid: require_var("CF_SPACE_GUID")?,
            request_timeout: Duration::from_secs(
                env::var("CF_REQUEST_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        })
    }
}

fn require_var(name: &'static str) -> Result<String, PlatformError> {
    env::var(name).map_err(|_| PlatformError::Config {
        message: format!("{} is required", name),
    })
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Cloud Foundry v2 client with a lazily refreshed UAA password-grant
/// token.
pub struct CloudFoundryClient {
    http: reqwest::Client,
    config: CfApiConfig,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct AppsResponse {
    resources: Vec<AppResource>,
}

#[derive(Deserialize)]
struct AppResource {
    metadata: AppMetadata,
    entity: AppEntity,
}

#[derive(Deserialize)]
struct AppMetadata {
    guid: String,
}

#[derive(Deserialize)]
struct AppEntity {
    name: String,
}

#[derive(Deserialize)]
struct InstanceStats {
    state: String,
}

// Refresh the token this long before UAA says it expires.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

impl CloudFoundryClient {
    pub fn new(config: CfApiConfig) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    async fn bearer_token(&self) -> Result<String, PlatformError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        debug!(token_url = %self.config.token_url, "fetching platform token");
        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth("cf", Some(""))
            .form(&[
                ("grant_type", "password"),
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
                ("response_type", "token"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PlatformError::Auth {
                message: format!("token endpoint returned HTTP {}", response.status()),
            });
        }

        let body: TokenResponse = response.json().await?;
        let access_token = body.access_token.clone();
        *cached = Some(CachedToken {
            access_token: body.access_token,
            expires_at: Instant::now()
                + Duration::from_secs(body.expires_in).saturating_sub(TOKEN_EXPIRY_SKEW),
        });
        Ok(access_token)
    }

    /// Drop the cached token so the next call re-authenticates.
    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn check_status(
        &self,
        operation: &'static str,
        response: &reqwest::Response,
    ) -> Result<(), PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            warn!(operation, "platform rejected token; invalidating cache");
            self.invalidate_token().await;
        }
        Err(PlatformError::Api {
            operation,
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl ContainerPlatform for CloudFoundryClient {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, PlatformError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(self.url(&format!("/v2/spaces/{}/apps", self.config.space_guid)))
            .bearer_auth(token)
            .send()
            .await?;
        self.check_status("list apps", &response).await?;

        let body: AppsResponse = response.json().await?;
        Ok(body
            .resources
            .into_iter()
            .map(|r| ContainerSummary {
                guid: r.metadata.guid,
                name: r.entity.name,
            })
            .collect())
    }

    async fn container_state(&self, guid: &str) -> Result<ContainerState, PlatformError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(self.url(&format!("/v2/apps/{}/stats", guid)))
            .bearer_auth(token)
            .send()
            .await?;

        // Stats of a stopped app is a 400, not an empty stats map.
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Ok(ContainerState::Other("STOPPED".to_string()));
        }
        self.check_status("app stats", &response).await?;

        let stats: BTreeMap<String, InstanceStats> = response.json().await?;
        let state = stats
            .get("0")
            .map(|instance| ContainerState::from(instance.state.as_str()))
            .unwrap_or_else(|| ContainerState::Other("UNKNOWN".to_string()));
        Ok(state)
    }

    async fn update_environment(
        &self,
        guid: &str,
        environment: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .put(self.url(&format!("/v2/apps/{}", guid)))
            .bearer_auth(token)
            .json(&serde_json::json!({ "environment_json": environment }))
            .send()
            .await?;
        self.check_status("update environment", &response).await
    }

    async fn restage(&self, guid: &str) -> Result<(), PlatformError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .post(self.url(&format!("/v2/apps/{}/restage", guid)))
            .bearer_auth(token)
            .send()
            .await?;
        self.check_status("restage", &response).await
    }
}
