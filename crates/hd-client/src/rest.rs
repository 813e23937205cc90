//! HTTP control plane.

use async_trait::async_trait;
use hd_types::{config_error, HdError, HdResult, RunId, RunMetrics, RunState};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::control_plane::ControlPlane;

pub const ENDPOINT_ENV: &str = "HYPERDRIVE_ENDPOINT";
pub const REQUEST_TIMEOUT_ENV: &str = "HYPERDRIVE_REQUEST_TIMEOUT_SECS";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the control plane lives and how long a single request may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestConfig {
    pub endpoint: String,
    pub request_timeout: Duration,
}

impl RestConfig {
    pub fn new(endpoint: impl Into<String>) -> HdResult<Self> {
        let endpoint = endpoint.into();
        let endpoint = endpoint.trim().trim_end_matches('/');
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(config_error!(
                "endpoint must be an http(s) URL, got '{endpoint}'"
            ));
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Read `HYPERDRIVE_ENDPOINT` and `HYPERDRIVE_REQUEST_TIMEOUT_SECS`.
    pub fn from_env() -> HdResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> HdResult<Self> {
        let endpoint =
            lookup(ENDPOINT_ENV).ok_or_else(|| config_error!("{ENDPOINT_ENV} is not set"))?;
        let config = Self::new(endpoint)?;
        match lookup(REQUEST_TIMEOUT_ENV) {
            None => Ok(config),
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or_else(|| {
                        config_error!("{REQUEST_TIMEOUT_ENV} must be a positive integer, got '{raw}'")
                    })?;
                Ok(config.with_request_timeout(Duration::from_secs(secs)))
            }
        }
    }

    fn jobs_url(&self) -> String {
        format!("{}/jobs", self.endpoint)
    }

    fn job_url(&self, id: &RunId, suffix: &str) -> String {
        format!("{}/jobs/{}{}", self.endpoint, id, suffix)
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: RunId,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: RunState,
}

#[derive(Deserialize)]
struct ChildrenResponse {
    children: Vec<RunId>,
}

fn transport(err: reqwest::Error) -> HdError {
    HdError::Transport {
        message: err.to_string(),
    }
}

/// Error body for a failed response, or the status line when there is none.
fn body_or_status<E>(body: Result<String, E>, status: StatusCode) -> String {
    match body {
        Ok(body) if !body.trim().is_empty() => body,
        _ => format!("HTTP {status}"),
    }
}

fn submit_error(status: StatusCode, body: String) -> HdError {
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::CONFLICT
        | StatusCode::UNPROCESSABLE_ENTITY
        | StatusCode::TOO_MANY_REQUESTS => HdError::SubmissionRejected { reason: body },
        other => HdError::Transport {
            message: format!("submit failed with HTTP {other}: {body}"),
        },
    }
}

fn query_error(status: StatusCode, body: String, run_id: &RunId) -> HdError {
    if status == StatusCode::NOT_FOUND {
        HdError::RunNotFound {
            run_id: run_id.to_string(),
        }
    } else {
        HdError::Transport {
            message: format!("query for {run_id} failed with HTTP {status}: {body}"),
        }
    }
}

/// Control plane reached over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct RestControlPlane {
    config: RestConfig,
    client: reqwest::Client,
}

impl RestControlPlane {
    pub fn new(config: RestConfig) -> HdResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| config_error!("failed to build HTTP client: {e}"))?;
        Ok(Self { config, client })
    }

    pub fn from_env() -> HdResult<Self> {
        Self::new(RestConfig::from_env()?)
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String, run_id: &RunId) -> HdResult<T> {
        debug!(%url, "GET");
        let response = self.client.get(&url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = body_or_status(response.text().await, status);
            return Err(query_error(status, body, run_id));
        }
        response.json::<T>().await.map_err(transport)
    }
}

#[async_trait]
impl ControlPlane for RestControlPlane {
    async fn submit_job(&self, job: &serde_json::Value) -> HdResult<RunId> {
        let url = self.config.jobs_url();
        debug!(%url, "POST");
        let response = self
            .client
            .post(&url)
            .json(job)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = body_or_status(response.text().await, status);
            return Err(submit_error(status, body));
        }
        let accepted: SubmitResponse = response.json().await.map_err(transport)?;
        Ok(accepted.id)
    }

    async fn get_job_status(&self, job_id: &RunId) -> HdResult<RunState> {
        let response: StatusResponse = self
            .get_json(self.config.job_url(job_id, ""), job_id)
            .await?;
        Ok(response.status)
    }

    async fn get_job_metrics(&self, job_id: &RunId) -> HdResult<RunMetrics> {
        self.get_json(self.config.job_url(job_id, "/metrics"), job_id)
            .await
    }

    async fn list_child_jobs(&self, job_id: &RunId) -> HdResult<Vec<RunId>> {
        let response: ChildrenResponse = self
            .get_json(self.config.job_url(job_id, "/children"), job_id)
            .await?;
        Ok(response.children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_from_env() {
        let config = RestConfig::from_lookup(env(&[
            (ENDPOINT_ENV, "https://ml.example.com/api/"),
            (REQUEST_TIMEOUT_ENV, "5"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint, "https://ml.example.com/api");
        assert_eq!(config.request_timeout, Duration::from_secs(5));

        let config = RestConfig::from_lookup(env(&[(ENDPOINT_ENV, "http://localhost:8080")])).unwrap();
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_config_errors() {
        assert!(matches!(
            RestConfig::from_lookup(env(&[])),
            Err(HdError::Config(_))
        ));
        assert!(matches!(
            RestConfig::from_lookup(env(&[(ENDPOINT_ENV, "ml.example.com")])),
            Err(HdError::Config(_))
        ));
        for bad in ["0", "soon", "-3"] {
            assert!(matches!(
                RestConfig::from_lookup(env(&[
                    (ENDPOINT_ENV, "http://localhost"),
                    (REQUEST_TIMEOUT_ENV, bad),
                ])),
                Err(HdError::Config(_))
            ));
        }
    }

    #[test]
    fn test_urls() {
        let config = RestConfig::new("http://localhost:8080/").unwrap();
        let id = RunId::new("HD_1");
        assert_eq!(config.jobs_url(), "http://localhost:8080/jobs");
        assert_eq!(config.job_url(&id, ""), "http://localhost:8080/jobs/HD_1");
        assert_eq!(
            config.job_url(&id, "/children"),
            "http://localhost:8080/jobs/HD_1/children"
        );
    }

    #[test]
    fn test_submit_status_mapping() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::CONFLICT,
            StatusCode::UNPROCESSABLE_ENTITY,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            match submit_error(status, "quota exceeded".to_string()) {
                HdError::SubmissionRejected { reason } => assert_eq!(reason, "quota exceeded"),
                other => panic!("expected SubmissionRejected, got {other:?}"),
            }
        }
        let err = submit_error(StatusCode::BAD_GATEWAY, String::new());
        assert!(matches!(err, HdError::Transport { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_rejection_reason_never_empty() {
        let status = StatusCode::BAD_REQUEST;
        assert_eq!(body_or_status(Err(()), status), "HTTP 400 Bad Request");
        assert_eq!(body_or_status(Ok::<_, ()>("  ".to_string()), status), "HTTP 400 Bad Request");
        assert_eq!(body_or_status(Ok::<_, ()>("bad space".to_string()), status), "bad space");

        match submit_error(status, body_or_status(Err(()), status)) {
            HdError::SubmissionRejected { reason } => assert_eq!(reason, "HTTP 400 Bad Request"),
            other => panic!("expected SubmissionRejected, got {other:?}"),
        }
    }

    #[test]
    fn test_query_status_mapping() {
        let id = RunId::new("HD_1");
        assert!(matches!(
            query_error(StatusCode::NOT_FOUND, String::new(), &id),
            HdError::RunNotFound { .. }
        ));
        assert!(matches!(
            query_error(StatusCode::SERVICE_UNAVAILABLE, String::new(), &id),
            HdError::Transport { .. }
        ));
    }

    #[test]
    fn test_response_bodies() {
        let status: StatusResponse = serde_json::from_str(r#"{"status":"CancelRequested"}"#).unwrap();
        assert_eq!(status.status, RunState::CancelRequested);
        let children: ChildrenResponse =
            serde_json::from_str(r#"{"children":["HD_1_0","HD_1_1"]}"#).unwrap();
        assert_eq!(children.children, vec![RunId::new("HD_1_0"), RunId::new("HD_1_1")]);
        let metrics: RunMetrics = serde_json::from_str(r#"{"loss":[0.9,0.5]}"#).unwrap();
        assert_eq!(metrics["loss"], vec![0.9, 0.5]);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let config = RestConfig::new("http://127.0.0.1:9")
            .unwrap()
            .with_request_timeout(Duration::from_secs(2));
        let cp = RestControlPlane::new(config).unwrap();
        let err = cp.get_job_status(&RunId::new("HD_1")).await.unwrap_err();
        assert!(matches!(err, HdError::Transport { .. }));
    }
}
