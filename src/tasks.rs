use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use vendflow_core::config::TasksConfig;
use vendflow_core::error::{TaskError, TaskErrorKind};
use vendflow_core::traits::TaskExecutor;

/// Runs tasks by POSTing the payload to `{base_url}/{task}`.
pub struct HttpTaskExecutor {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTaskExecutor {
    pub fn new(config: &TasksConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    fn endpoint(&self, task: &str) -> String {
        format!("{}/{}", self.base_url, task)
    }
}

/// Map an HTTP failure status onto the task error taxonomy.
pub fn classify_status(status: StatusCode) -> TaskErrorKind {
    match status.as_u16() {
        429 => TaskErrorKind::Throttled,
        400 | 404 | 422 => TaskErrorKind::ValidationFailed,
        408 | 504 => TaskErrorKind::Timeout,
        _ => TaskErrorKind::Unknown,
    }
}

fn classify_transport(e: &reqwest::Error) -> TaskErrorKind {
    if e.is_timeout() {
        TaskErrorKind::Timeout
    } else {
        TaskErrorKind::Unknown
    }
}

impl TaskExecutor for HttpTaskExecutor {
    fn invoke(&self, task: &str, payload: Value) -> BoxFuture<'_, Result<Value, TaskError>> {
        let task = task.to_string();
        Box::pin(async move {
            let url = self.endpoint(&task);
            debug!(task = %task, url = %url, "Invoking task");

            let mut request = self.http.post(&url).json(&payload);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| TaskError::new(&task, classify_transport(&e), e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(TaskError::new(
                    &task,
                    classify_status(status),
                    format!("HTTP {}: {}", status, body),
                ));
            }

            response.json::<Value>().await.map_err(|e| {
                let kind = if e.is_timeout() {
                    TaskErrorKind::Timeout
                } else {
                    TaskErrorKind::ValidationFailed
                };
                TaskError::new(&task, kind, format!("invalid response body: {}", e))
            })
        })
    }
}
