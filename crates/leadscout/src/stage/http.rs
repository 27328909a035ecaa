//! Provider-backed stage runner.
//!
//! POSTs the [`StageContext`] as JSON to the stage's endpoint and expects
//! `{ "records": [{ "title": ..., "data": ... }, ...] }` back.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{RecordSink, StageContext, StageError, StageKind, StageRecord, StageRunner};
use crate::config::ProvidersConfig;

#[derive(Debug, Deserialize)]
struct StageResponse {
    records: Vec<StageRecord>,
}

/// Calls one external generation endpoint.
pub struct HttpStageRunner {
    kind: StageKind,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpStageRunner {
    pub fn new(kind: StageKind, endpoint: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            client,
        }
    }

    /// Builds one runner per stage from the provider configuration, sharing
    /// a single HTTP client.
    pub fn all_from_config(config: &ProvidersConfig) -> Result<Vec<Self>, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(StageKind::ALL
            .into_iter()
            .map(|kind| Self::new(kind, config.endpoint(kind), client.clone()))
            .collect())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl StageRunner for HttpStageRunner {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn run(&self, ctx: &StageContext, sink: &RecordSink) -> Result<(), StageError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(ctx)
            .send()
            .await
            .map_err(|e| classify_transport(self.kind, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(self.kind, status, &body));
        }

        let parsed: StageResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                StageError::terminal(self.kind, format!("malformed provider response: {}", e))
            } else {
                classify_transport(self.kind, &e)
            }
        })?;

        tracing::debug!(
            endpoint = %self.endpoint,
            records = parsed.records.len(),
            "Provider returned records"
        );
        sink.persist_all(parsed.records)?;
        Ok(())
    }
}

fn classify_transport(stage: StageKind, err: &reqwest::Error) -> StageError {
    if err.is_timeout() {
        StageError::transient(stage, format!("provider timed out: {}", err))
    } else if err.is_builder() {
        StageError::terminal(stage, format!("invalid provider request: {}", err))
    } else {
        StageError::transient(stage, format!("provider unreachable: {}", err))
    }
}

/// 5xx, 408 and 429 are worth retrying; any other non-success status is not.
fn classify_status(stage: StageKind, status: StatusCode, body: &str) -> StageError {
    let snippet: String = body.chars().take(200).collect();
    let message = if snippet.is_empty() {
        format!("provider returned {}", status)
    } else {
        format!("provider returned {}: {}", status, snippet)
    };

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        StageError::transient(stage, message)
    } else {
        StageError::terminal(stage, message)
    }
}
