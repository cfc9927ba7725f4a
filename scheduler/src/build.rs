use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildDecodeError {
    #[error("invalid build message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("build message is missing required environment key {0}")]
    MissingKey(&'static str),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildMessage {
    container_environment: BTreeMap<String, String>,
}

const REQUIRED_KEYS: [&str; 3] = ["BUILD_ID", "LOG_CALLBACK", "STATUS_CALLBACK"];

/// A single build job, decoded once from an inbound queue message and
/// never mutated afterwards. The environment is what gets applied to the
/// claimed container; the callback URLs are where a timeout is reported.
#[derive(Debug, Clone)]
pub struct Build {
    build_id: String,
    container_environment: BTreeMap<String, String>,
}

impl Build {
    pub fn from_message(payload: &[u8]) -> Result<Self, BuildDecodeError> {
        let message: BuildMessage = serde_json::from_slice(payload)?;
        for key in REQUIRED_KEYS {
            if !message.container_environment.contains_key(key) {
                return Err(BuildDecodeError::MissingKey(key));
            }
        }
        let build_id = message.container_environment["BUILD_ID"].clone();
        Ok(Self {
            build_id,
            container_environment: message.container_environment,
        })
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn container_environment(&self) -> &BTreeMap<String, String> {
        &self.container_environment
    }

    pub fn log_callback(&self) -> &str {
        &self.container_environment["LOG_CALLBACK"]
    }

    pub fn status_callback(&self) -> &str {
        &self.container_environment["STATUS_CALLBACK"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_complete_message() {
        let payload = serde_json::json!({
            "containerEnvironment": {
                "BUILD_ID": "build-42",
                "LOG_CALLBACK": "https://example.gov/log/42",
                "STATUS_CALLBACK": "https://example.gov/status/42",
                "SOURCE_REPO": "org/site"
            }
        })
        .to_string();

        let build = Build::from_message(payload.as_bytes()).unwrap();
        assert_eq!(build.build_id(), "build-42");
        assert_eq!(build.log_callback(), "https://example.gov/log/42");
        assert_eq!(build.status_callback(), "https://example.gov/status/42");
        assert_eq!(
            build.container_environment().get("SOURCE_REPO"),
            Some(&"org/site".to_string())
        );
    }

    #[test]
    fn rejects_message_missing_callbacks() {
        let payload = serde_json::json!({
            "containerEnvironment": { "BUILD_ID": "build-42" }
        })
        .to_string();

        let err = Build::from_message(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, BuildDecodeError::MissingKey("LOG_CALLBACK")));
    }

    #[test]
    fn rejects_non_json_payload() {
        assert!(matches!(
            Build::from_message(b"not json"),
            Err(BuildDecodeError::Json(_))
        ));
    }
}
