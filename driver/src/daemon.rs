//! HTTP client for the execution daemon (§4.4): submit, long-poll status,
//! abort, workspace/method metadata. Stateless beyond the underlying
//! `reqwest::Client` and the circuit breaker guarding it.

use std::collections::HashMap;
use std::time::Duration;

use common::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use common::errors::{JobError, SubmitError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Errors talking to the daemon: either the breaker rejected the call, the
/// transport itself failed, or the response didn't decode as JSON.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon circuit breaker is open")]
    CircuitOpen,
    #[error("request to daemon failed: {0}")]
    Request(String),
    #[error("malformed response from daemon: {0}")]
    Decode(String),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("{} job(s) failed while waiting", .0.len())]
    JobFailed(Vec<JobError>),
}

impl<E: std::fmt::Display> From<CircuitBreakerError<E>> for DaemonError {
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen { .. } => DaemonError::CircuitOpen,
            CircuitBreakerError::RequestFailed(e) => DaemonError::Request(e.to_string()),
        }
    }
}

/// `{error?, jobs?, why_build?, done?}` from `POST /submit`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub jobs: Vec<SubmittedJob>,
    #[serde(default)]
    pub why_build: Option<Json>,
    #[serde(default)]
    pub done: bool,
}

/// One entry of `submit`'s `jobs` list: a method paired with the jobid the
/// daemon assigned (or reused) for it, and the reason ("MAKE", "link", ...).
#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedJob {
    pub method: String,
    pub jobid: String,
    pub reason: String,
}

/// `(jobid, method, status)` triple surfaced by `/status`'s `last_error`.
pub type LastErrorEntry = (String, String, String);

/// `{idle, status_stacks, current, last_error?}` from `GET /status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub idle: bool,
    #[serde(default)]
    pub status_stacks: Json,
    #[serde(default)]
    pub current: Option<Json>,
    #[serde(default)]
    pub last_error: Vec<LastErrorEntry>,
}

#[derive(Debug, Serialize)]
struct SubmitRequestBody<'a> {
    caption: &'a str,
    method: &'a str,
    params: &'a Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    subjob_cookie: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    why_build: Option<&'a Json>,
}

/// The payload `Automation::submit` hands the daemon: caption, the
/// originally requested method, its per-method params tree, and the
/// optional subjob/why-build plumbing.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub caption: String,
    pub method: String,
    pub params: Json,
    pub subjob_cookie: Option<String>,
    pub parent_pid: Option<u32>,
    pub why_build: Option<Json>,
}

/// Method dependency/metadata entry from `GET /methods/`.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodInfo {
    #[serde(default)]
    pub dep: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Json>,
}

/// Stateless HTTP client for the daemon's submit/status/metadata surface.
/// Wrapped in a [`CircuitBreaker`] so a down daemon opens the circuit
/// instead of the wait loop spinning against it forever.
pub struct DaemonClient {
    client: Client,
    base_url: String,
    breaker: CircuitBreaker,
}

impl DaemonClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, DaemonError> {
        Self::with_breaker_config(base_url, request_timeout, CircuitBreakerConfig::default())
    }

    pub fn with_breaker_config(
        base_url: impl Into<String>,
        request_timeout: Duration,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self, DaemonError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DaemonError::Request(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            breaker: CircuitBreaker::new("daemon", breaker_config),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    #[tracing::instrument(skip(self, request))]
    pub async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse, DaemonError> {
        let body = SubmitRequestBody {
            caption: &request.caption,
            method: &request.method,
            params: &request.params,
            subjob_cookie: request.subjob_cookie.as_deref(),
            parent_pid: request.parent_pid,
            why_build: request.why_build.as_ref(),
        };
        let encoded = serde_json::to_string(&body)
            .map_err(|e| DaemonError::Decode(format!("failed to encode submit body: {e}")))?;

        let response: SubmitResponse = self
            .breaker
            .call(async {
                self.client
                    .post(self.url("/submit"))
                    .form(&[("json", encoded.as_str())])
                    .send()
                    .await
                    .map_err(|e| DaemonError::Request(e.to_string()))?
                    .json::<SubmitResponse>()
                    .await
                    .map_err(|e| DaemonError::Decode(e.to_string()))
            })
            .await?;

        if let Some(err) = &response.error {
            return Err(DaemonError::Submit(SubmitError(err.clone())));
        }
        Ok(response)
    }

    /// Long-polls `/status`. `timeout` is a server-side query parameter
    /// (the wait loop passes `1`), not the client's own request timeout.
    #[tracing::instrument(skip(self))]
    pub async fn status(
        &self,
        subjob_cookie: Option<&str>,
        timeout: u64,
        full: bool,
    ) -> Result<StatusResponse, DaemonError> {
        let path = if full { "/status/full" } else { "/status" };
        self.breaker
            .call(async {
                let mut req = self.client.get(self.url(path)).query(&[("timeout", timeout)]);
                if let Some(cookie) = subjob_cookie {
                    req = req.query(&[("subjob_cookie", cookie)]);
                }
                req.send()
                    .await
                    .map_err(|e| DaemonError::Request(e.to_string()))?
                    .json::<StatusResponse>()
                    .await
                    .map_err(|e| DaemonError::Decode(e.to_string()))
            })
            .await
            .map_err(DaemonError::from)
    }

    pub async fn abort(&self) -> Result<Json, DaemonError> {
        self.get_json("/abort").await
    }

    pub async fn workspace_info(&self) -> Result<Json, DaemonError> {
        self.get_json("/workspace_info").await
    }

    pub async fn config(&self) -> Result<Json, DaemonError> {
        self.get_json("/config").await
    }

    pub async fn set_workspace(&self, name: &str) -> Result<String, DaemonError> {
        self.get_text(&format!("/set_workspace/{name}")).await
    }

    pub async fn method_info(&self, name: &str) -> Result<Json, DaemonError> {
        self.get_json(&format!("/method_info/{name}")).await
    }

    pub async fn methods(&self) -> Result<HashMap<String, MethodInfo>, DaemonError> {
        self.get_json_as("/methods/").await
    }

    pub async fn update_methods(&self) -> Result<String, DaemonError> {
        self.get_text("/update_methods").await
    }

    pub async fn list_workspaces(&self) -> Result<HashMap<String, Json>, DaemonError> {
        self.get_json_as("/list_workspaces/").await
    }

    /// `GET /update/<jobid>[/<phase>]`: rebuild a job, optionally from a
    /// given phase onward.
    pub async fn remake(&self, jobid: &str, phase: Option<&str>) -> Result<String, DaemonError> {
        let path = match phase {
            Some(p) => format!("/update/{jobid}/{p}"),
            None => format!("/update/{jobid}"),
        };
        self.get_text(&path).await
    }

    async fn get_json(&self, path: &str) -> Result<Json, DaemonError> {
        self.get_json_as(path).await
    }

    async fn get_json_as<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, DaemonError> {
        let url = self.url(path);
        self.breaker
            .call(async {
                self.client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| DaemonError::Request(e.to_string()))?
                    .json::<T>()
                    .await
                    .map_err(|e| DaemonError::Decode(e.to_string()))
            })
            .await
            .map_err(DaemonError::from)
    }

    async fn get_text(&self, path: &str) -> Result<String, DaemonError> {
        let url = self.url(path);
        self.breaker
            .call(async {
                self.client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| DaemonError::Request(e.to_string()))?
                    .text()
                    .await
                    .map_err(|e| DaemonError::Request(e.to_string()))
            })
            .await
            .map_err(DaemonError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> DaemonClient {
        DaemonClient::new(base_url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn submit_returns_jobs_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobs": [{"method": "csvimport", "jobid": "job-1", "reason": "MAKE"}],
                "done": true
            })))
            .mount(&server)
            .await;

        let daemon = client(server.uri());
        let request = SubmitRequest {
            caption: "fsm_csvimport".into(),
            method: "csvimport".into(),
            params: serde_json::json!({}),
            subjob_cookie: None,
            parent_pid: None,
            why_build: None,
        };
        let response = daemon.submit(&request).await.unwrap();
        assert!(response.error.is_none());
        assert_eq!(response.jobs.len(), 1);
        assert_eq!(response.jobs[0].jobid, "job-1");
    }

    #[tokio::test]
    async fn submit_surfaces_error_field_as_submit_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "no such method",
            })))
            .mount(&server)
            .await;

        let daemon = client(server.uri());
        let request = SubmitRequest {
            caption: "fsm_bogus".into(),
            method: "bogus".into(),
            params: serde_json::json!({}),
            subjob_cookie: None,
            parent_pid: None,
            why_build: None,
        };
        let err = daemon.submit(&request).await.unwrap_err();
        assert!(matches!(err, DaemonError::Submit(_)));
    }

    #[tokio::test]
    async fn status_reports_idle_and_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "idle": true,
                "status_stacks": [],
                "current": null,
                "last_error": [["job-1", "csvimport", "crashed"]],
            })))
            .mount(&server)
            .await;

        let daemon = client(server.uri());
        let status = daemon.status(None, 1, false).await.unwrap();
        assert!(status.idle);
        assert_eq!(status.last_error.len(), 1);
        assert_eq!(status.last_error[0].1, "csvimport");
    }

    #[tokio::test]
    async fn set_workspace_returns_plain_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/set_workspace/churn"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let daemon = client(server.uri());
        assert_eq!(daemon.set_workspace("churn").await.unwrap(), "ok");
    }
}
