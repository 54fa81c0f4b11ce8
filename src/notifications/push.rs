//! Push provider adapter

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    /// Providers only accept string values
    pub data: BTreeMap<String, String>,
    pub image_url: Option<String>,
    pub click_action: Option<String>,
}

impl PushMessage {
    /// Flatten an arbitrary JSON object into string pairs.
    pub fn from_parts(title: &str, body: &str, data: &serde_json::Value) -> Self {
        let mut flat = BTreeMap::new();
        if let Some(map) = data.as_object() {
            for (k, v) in map {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                flat.insert(k.clone(), value);
            }
        }
        let image_url = flat.get("image_url").cloned();
        let click_action = flat.get("click_action").cloned();
        Self {
            title: title.to_string(),
            body: body.to_string(),
            data: flat,
            image_url,
            click_action,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    /// Timeouts, 5xx, throttling
    #[error("transient push failure: {0}")]
    Transient(String),

    /// Token unknown or unregistered; never retry
    #[error("invalid device token: {0}")]
    InvalidToken(String),
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), PushError>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FcmConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// OAuth bearer for the send endpoint
    pub access_token: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_endpoint() -> String {
    "https://fcm.googleapis.com/v1/projects/treesindia/messages:send".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

/// Firebase Cloud Messaging HTTP v1 client
pub struct FcmClient {
    config: FcmConfig,
    http: reqwest::Client,
}

impl FcmClient {
    pub fn new(config: FcmConfig) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| CoreError::internal(format!("failed to build push client: {}", e)))?;
        Ok(Self { config, http })
    }

    fn payload(token: &str, message: &PushMessage) -> serde_json::Value {
        let mut notification = json!({ "title": message.title, "body": message.body });
        if let Some(image) = &message.image_url {
            notification["image"] = json!(image);
        }
        let mut android = json!({});
        if let Some(action) = &message.click_action {
            android["notification"] = json!({ "click_action": action });
        }
        json!({
            "message": {
                "token": token,
                "notification": notification,
                "data": message.data,
                "android": android,
            }
        })
    }
}

#[async_trait]
impl PushProvider for FcmClient {
    fn name(&self) -> &'static str {
        "fcm"
    }

    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), PushError> {
        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.access_token)
            .json(&Self::payload(token, message))
            .send()
            .await
            .map_err(|e| PushError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND || body.contains("UNREGISTERED") {
            return Err(PushError::InvalidToken(body));
        }
        if status == reqwest::StatusCode::BAD_REQUEST && body.contains("INVALID_ARGUMENT") {
            return Err(PushError::InvalidToken(body));
        }
        Err(PushError::Transient(format!("HTTP {}: {}", status, body)))
    }
}
