//! HTTP client for the Test Intelligence service.
//!
//! Two endpoints are used:
//!
//! | Method | Path | Body | Response |
//! |--------|------|------|----------|
//! | POST | `/tests/select` | `{ stepId, files, selectOnly }` | [`SelectionResult`] |
//! | GET | `/tests/timedata?includeSuiteDetail=..` | - | `{ "<pkg.class>": seconds }` |
//!
//! Every request carries the build identity (account, org, project,
//! pipeline, build, stage) as query parameters, read from the environment
//! when the client is built.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::ServiceConfig;
use crate::model::{ChangedFile, SelectionResult};
use crate::selection::SelectionService;
use crate::split::TimingService;

/// Errors returned by the service client.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// No endpoint is configured.
    #[error("test intelligence service is not configured")]
    NotConfigured,

    /// Transport or decoding failure.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
}

const IDENTITY_PARAMS: &[(&str, &str)] = &[
    ("accountId", "HARNESS_ACCOUNT_ID"),
    ("orgId", "HARNESS_ORG_ID"),
    ("projectId", "HARNESS_PROJECT_ID"),
    ("pipelineId", "HARNESS_PIPELINE_ID"),
    ("buildId", "HARNESS_BUILD_NUMBER"),
    ("stageId", "HARNESS_STAGE_ID"),
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SelectRequest<'a> {
    step_id: &'a str,
    files: &'a [ChangedFile],
    select_only: bool,
}

/// Client for the Test Intelligence service.
pub struct TiClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    identity: Vec<(String, String)>,
}

impl TiClient {
    /// Builds a client from the service configuration.
    ///
    /// Returns `Ok(None)` when no endpoint is configured.
    pub fn from_config(
        config: &ServiceConfig,
        env: &HashMap<String, String>,
    ) -> Result<Option<Self>, ServiceError> {
        let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let identity = IDENTITY_PARAMS
            .iter()
            .filter_map(|(param, var)| {
                env.get(*var)
                    .filter(|v| !v.is_empty())
                    .map(|v| (param.to_string(), v.clone()))
            })
            .collect();
        Ok(Some(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            identity,
        }))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.query(&self.identity);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ServiceError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl SelectionService for TiClient {
    async fn select_tests(
        &self,
        step_id: &str,
        files: &[ChangedFile],
        select_only: bool,
    ) -> Result<SelectionResult, ServiceError> {
        let body = SelectRequest {
            step_id,
            files,
            select_only,
        };
        let request = self.authorize(self.http.post(self.url("/tests/select")).json(&body));
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TimingService for TiClient {
    async fn test_times(
        &self,
        include_suite_detail: bool,
    ) -> Result<HashMap<String, f64>, ServiceError> {
        let request = self
            .authorize(self.http.get(self.url("/tests/timedata")))
            .query(&[("includeSuiteDetail", include_suite_detail)]);
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }
}
