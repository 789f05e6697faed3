//! CV extraction: posts the uploaded document to the workflow webhook and
//! reads back the structured profile.

use async_trait::async_trait;
use reqwest::Url;
use reqwest::multipart::{Form, Part};

use crate::error::CollaboratorError;
use crate::onboarding::model::{ExtractedProfile, UploadedDocument};

const SERVICE: &str = "extraction";

/// Turns an uploaded document into structured profile fields.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(&self, document: UploadedDocument)
    -> Result<ExtractedProfile, CollaboratorError>;
}

/// Extraction backed by an n8n-style webhook that accepts `multipart/form-data`.
pub struct WebhookExtractor {
    client: reqwest::Client,
    url: Url,
}

impl WebhookExtractor {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl ExtractionService for WebhookExtractor {
    async fn extract(
        &self,
        document: UploadedDocument,
    ) -> Result<ExtractedProfile, CollaboratorError> {
        let UploadedDocument {
            filename,
            content_type,
            bytes,
        } = document;

        let part = Part::bytes(bytes)
            .file_name(filename.clone())
            .mime_str(&content_type)
            .map_err(|e| CollaboratorError::transport(SERVICE, e))?;
        let form = Form::new()
            .part("cv", part)
            .text("filename", filename.clone());

        let resp = self
            .client
            .post(self.url.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| CollaboratorError::transport(SERVICE, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Extraction webhook rejected document");
            return Err(CollaboratorError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| CollaboratorError::transport(SERVICE, e))?;
        let profile = parse_extraction(&body)?;
        tracing::debug!(filename = %filename, email = %profile.email, "CV extracted");
        Ok(profile)
    }
}

/// Parse the webhook body.
///
/// The workflow answers with either the profile object or a one-element array
/// holding it. Anything else is malformed.
pub fn parse_extraction(body: &[u8]) -> Result<ExtractedProfile, CollaboratorError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| CollaboratorError::malformed(SERVICE, e))?;

    let value = match value {
        serde_json::Value::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    };
    if !value.is_object() {
        return Err(CollaboratorError::malformed(
            SERVICE,
            "expected a JSON object with the extracted fields",
        ));
    }

    serde_json::from_value(value).map_err(|e| CollaboratorError::malformed(SERVICE, e))
}
