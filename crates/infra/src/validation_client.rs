use std::time::Duration;

use pantau_domain::ports::BoxFuture;
use pantau_domain::ports::validation::{
    ValidationClient, ValidationClientError, ValidationRequest,
};
use reqwest::StatusCode;

use crate::config::AppConfig;

/// Client for the external image classifier. One POST per report; the body of
/// a successful response is the task id, optionally JSON-quoted.
#[derive(Debug, Clone)]
pub struct HttpValidationClient {
    http: reqwest::Client,
    base_url: String,
    path: String,
}

impl HttpValidationClient {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            &config.validation_base_url,
            &config.validation_path,
            Duration::from_millis(config.validation_timeout_ms.max(1)),
        )
    }

    pub fn new(base_url: &str, path: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            path: path.trim().to_string(),
        }
    }

    async fn post_request(
        &self,
        request: &ValidationRequest,
    ) -> Result<String, ValidationClientError> {
        if self.base_url.is_empty() {
            return Err(ValidationClientError::Configuration(
                "validation base url is not configured".to_string(),
            ));
        }
        let url = endpoint_url(&self.base_url, &self.path);

        let response = self
            .http
            .post(&url)
            .header("accept", "text/plain, application/json")
            .json(request)
            .send()
            .await
            .map_err(|err| ValidationClientError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ValidationClientError::InvalidResponse(err.to_string()))?;

        if !status.is_success() {
            return Err(ValidationClientError::Upstream {
                status: status.as_u16(),
                message: truncate(&body, 512),
            });
        }
        parse_task_id(status, &body)
    }
}

impl ValidationClient for HttpValidationClient {
    fn submit(
        &self,
        request: &ValidationRequest,
    ) -> BoxFuture<'_, Result<String, ValidationClientError>> {
        let request = request.clone();
        Box::pin(async move { self.post_request(&request).await })
    }
}

fn parse_task_id(status: StatusCode, body: &str) -> Result<String, ValidationClientError> {
    let trimmed = body.trim();
    let task_id = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::String(value)) => value,
        _ => trimmed.trim_matches('"').to_string(),
    };
    let task_id = task_id.trim().to_string();
    if task_id.is_empty() {
        return Err(ValidationClientError::InvalidResponse(format!(
            "status {}: empty task id",
            status.as_u16()
        )));
    }
    Ok(task_id)
}

fn endpoint_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
