//! WhatsApp connection status, read from an Evolution API instance.

use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::error::CollaboratorError;

const SERVICE: &str = "evolution";

/// Connection state of the WhatsApp instance (`open`, `close`,
/// `connecting`, or `unknown`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub instance: Option<String>,
    pub state: String,
}

impl ConnectionState {
    /// Read the state out of an Evolution API body. Depending on the server
    /// version the state sits at the top level or under `instance`.
    pub fn from_body(body: &serde_json::Value) -> Self {
        let nested = body.get("instance").filter(|v| v.is_object());
        let instance = match nested {
            Some(obj) => obj
                .get("instanceName")
                .and_then(|v| v.as_str())
                .map(String::from),
            None => body.get("instance").and_then(|v| v.as_str()).map(String::from),
        };
        let state = body
            .get("state")
            .and_then(|v| v.as_str())
            .or_else(|| nested.and_then(|obj| obj.get("state")).and_then(|v| v.as_str()))
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown")
            .to_string();
        Self { instance, state }
    }
}

/// Evolution API client for a single instance.
pub struct EvolutionClient {
    client: reqwest::Client,
    base_url: Url,
    instance: String,
    api_key: SecretString,
}

impl EvolutionClient {
    pub fn new(client: reqwest::Client, base_url: Url, instance: String, api_key: SecretString) -> Self {
        Self {
            client,
            base_url,
            instance,
            api_key,
        }
    }

    fn state_url(&self) -> Result<Url, CollaboratorError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CollaboratorError::malformed(SERVICE, "base url cannot carry a path"))?
            .pop_if_empty()
            .extend(["instance", "connectionState", self.instance.as_str()]);
        Ok(url)
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, CollaboratorError> {
        let resp = self
            .client
            .get(self.state_url()?)
            .header("apikey", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| CollaboratorError::transport(SERVICE, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, instance = %self.instance, "Evolution API status check failed");
            return Err(CollaboratorError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CollaboratorError::malformed(SERVICE, e))?;
        Ok(ConnectionState::from_body(&body))
    }
}
