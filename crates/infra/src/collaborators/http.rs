//! HTTP adapters for the external collaborators.
//!
//! Status mapping (shared by all three):
//!
//! | Response | CollaboratorError |
//! |---|---|
//! | 2xx | none |
//! | 429, 5xx | `Transient` |
//! | other 4xx | `Validation` |
//! | connect error / timeout | `Transient` |
//! | undecodable body | `Validation` |
//!
//! Constructors fail if the underlying client cannot be built, so a configured
//! request timeout is never silently dropped.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::debug;

use batchflow_core::{ExternalJobId, OutputRef, Parameter, RecordBatchRef, RecordId};
use batchflow_workflow::CollaboratorError;

use super::{CommitAck, InferenceService, RecordBatch, RecordQuery, ResultWriter};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Classify a non-success status. `None` for 2xx.
pub fn classify_status(status: StatusCode, body: &str) -> Option<CollaboratorError> {
    if status.is_success() {
        return None;
    }
    let msg = if body.is_empty() {
        format!("status {}", status.as_u16())
    } else {
        format!("status {}: {}", status.as_u16(), body)
    };
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(CollaboratorError::Transient(msg))
    } else {
        Some(CollaboratorError::Validation(msg))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> CollaboratorError {
    if err.is_decode() {
        CollaboratorError::validation(format!("malformed response: {err}"))
    } else {
        CollaboratorError::transient(err.to_string())
    }
}

fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

#[derive(Debug, Clone)]
struct Endpoint {
    client: Client,
    base_url: String,
}

impl Endpoint {
    fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, CollaboratorError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "collaborator responded");
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text)
                .unwrap_or_else(|| CollaboratorError::validation("unexpected status")));
        }

        response.json::<R>().await.map_err(map_reqwest_error)
    }
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    parameter: &'a str,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    record_ids: Vec<String>,
    batch_ref: Option<String>,
}

/// `POST {base}/query {parameter}` → `{record_ids, batch_ref}`.
#[derive(Debug, Clone)]
pub struct HttpRecordQuery {
    endpoint: Endpoint,
}

impl HttpRecordQuery {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, timeout)?,
        })
    }
}

#[async_trait::async_trait]
impl RecordQuery for HttpRecordQuery {
    async fn query_unprocessed(
        &self,
        parameter: &Parameter,
    ) -> Result<RecordBatch, CollaboratorError> {
        let resp: QueryResponse = self
            .endpoint
            .post(
                "/query",
                &QueryRequest {
                    parameter: parameter.as_str(),
                },
            )
            .await?;

        let record_ids = resp
            .record_ids
            .into_iter()
            .map(RecordId::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CollaboratorError::validation(e.to_string()))?;
        let batch_ref = resp
            .batch_ref
            .map(RecordBatchRef::new)
            .transpose()
            .map_err(|e| CollaboratorError::validation(e.to_string()))?;

        Ok(RecordBatch {
            record_ids,
            batch_ref,
        })
    }
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    parameter: &'a str,
    batch_ref: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

/// `POST {base}/jobs {parameter, batch_ref}` → `{job_id}`.
#[derive(Debug, Clone)]
pub struct HttpInferenceService {
    endpoint: Endpoint,
}

impl HttpInferenceService {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, timeout)?,
        })
    }
}

#[async_trait::async_trait]
impl InferenceService for HttpInferenceService {
    async fn submit(
        &self,
        parameter: &Parameter,
        batch_ref: &RecordBatchRef,
    ) -> Result<ExternalJobId, CollaboratorError> {
        let resp: SubmitResponse = self
            .endpoint
            .post(
                "/jobs",
                &SubmitRequest {
                    parameter: parameter.as_str(),
                    batch_ref: batch_ref.location(),
                },
            )
            .await?;
        ExternalJobId::new(resp.job_id).map_err(|e| CollaboratorError::validation(e.to_string()))
    }
}

#[derive(Serialize)]
struct CommitRequest<'a> {
    output_ref: &'a str,
}

/// `POST {base}/commit {output_ref}` → `{records_written}`.
#[derive(Debug, Clone)]
pub struct HttpResultWriter {
    endpoint: Endpoint,
}

impl HttpResultWriter {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, timeout)?,
        })
    }
}

#[async_trait::async_trait]
impl ResultWriter for HttpResultWriter {
    async fn commit(&self, output_ref: &OutputRef) -> Result<CommitAck, CollaboratorError> {
        self.endpoint
            .post(
                "/commit",
                &CommitRequest {
                    output_ref: output_ref.location(),
                },
            )
            .await
    }
}
