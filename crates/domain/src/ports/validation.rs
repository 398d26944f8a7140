use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum ValidationClientError {
    #[error("validation client configuration error: {0}")]
    Configuration(String),
    #[error("validation transport error: {0}")]
    Transport(String),
    #[error("validation upstream error: status {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("validation response decode error: {0}")]
    InvalidResponse(String),
}

/// Outbound body for the external classifier.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationRequest {
    #[serde(rename = "ImageUrl")]
    pub image_url: String,
    #[serde(rename = "WebhookUrl")]
    pub webhook_url: String,
}

pub trait ValidationClient: Send + Sync {
    /// Returns the classifier's task id.
    fn submit(
        &self,
        request: &ValidationRequest,
    ) -> BoxFuture<'_, Result<String, ValidationClientError>>;
}
