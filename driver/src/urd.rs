//! Ledger (Urd) client (§4.6): begin/finish transactions, point-in-time
//! lookup, dependency capture, and the retry budget for transport failures.

use std::collections::HashMap;
use std::time::Duration;

use common::errors::{AuthError, ConflictError, TransportError, UsageError};
use common::retry::{FixedDelay, RetryStrategy};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::automation::{Automation, CallMethodRequest, MaybeScoped, NameRef};
use crate::daemon::DaemonError;
use crate::joblist::JobList;

#[derive(Debug, thiserror::Error)]
pub enum UrdError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Usage(#[from] UsageError),
}

/// Errors from [`UrdClient::build`]/[`UrdClient::build_chained`]: either a
/// chaining misuse caught before submission, or whatever the underlying
/// `call_method` raised.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

/// The ledger's record for one `(user, automation, timestamp)` entry.
/// Empty content (no prior run) is distinguishable via [`UrdResponse::is_empty`],
/// so callers test `if let Some(r) = urd.latest(...)? { if !r.is_empty() { ... } }`
/// in place of the original's truthiness check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrdResponse {
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub joblist: JobList,
    #[serde(default)]
    pub deps: HashMap<String, String>,
}

impl UrdResponse {
    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty() && self.joblist.is_empty()
    }
}

struct Transaction {
    path: String,
    timestamp: Option<String>,
    caption: Option<String>,
    update: bool,
    deps: HashMap<String, String>,
    latest_joblist: Option<JobList>,
}

/// Ledger session. Only one `begin … finish` transaction may be open at a
/// time; dependencies captured under one do not leak to the next.
pub struct UrdClient {
    client: Client,
    base_url: String,
    user: String,
    flags: Vec<String>,
    retry: FixedDelay,
    current: Option<Transaction>,
}

impl UrdClient {
    pub fn new(base_url: impl Into<String>, user: impl Into<String>, password: &str) -> Result<Self, UrdError> {
        let user = user.into();
        let mut headers = reqwest::header::HeaderMap::new();
        let credentials = format!("{}:{}", user, password);
        let encoded = base64_encode(credentials.as_bytes());
        let auth_value = format!("Basic {encoded}");
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth_value)
                .map_err(|e| UrdError::Transport(TransportError::Request(e.to_string())))?,
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| UrdError::Transport(TransportError::Request(e.to_string())))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            user,
            flags: Vec::new(),
            retry: FixedDelay::new(Duration::from_secs(4), 3),
            current: None,
        })
    }

    fn url_for(&self, path: &str, timestamp: &str) -> String {
        let resolved_path = self.resolve_path(path);
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            urlencode(&resolved_path),
            urlencode(timestamp)
        )
    }

    /// Bare names (no `/`) get the session user prepended.
    fn resolve_path(&self, path: &str) -> String {
        if path.contains('/') {
            path.to_string()
        } else {
            format!("{}/{path}", self.user)
        }
    }

    pub fn begin(
        &mut self,
        path: impl Into<String>,
        timestamp: Option<String>,
        caption: Option<String>,
        update: bool,
    ) -> Result<(), UrdError> {
        let path = path.into();
        if self.current.is_some() {
            return Err(UrdError::Usage(common::errors::UsageError::TransactionAlreadyOpen(path)));
        }
        self.current = Some(Transaction {
            path,
            timestamp,
            caption,
            update,
            deps: HashMap::new(),
            latest_joblist: None,
        });
        Ok(())
    }

    pub fn abort(&mut self) {
        self.current = None;
    }

    async fn fetch(&mut self, path: &str, timestamp: &str, register_dep: bool) -> Result<Option<UrdResponse>, UrdError> {
        if self.current.is_none() {
            return Err(UrdError::Usage(common::errors::UsageError::NoTransactionOpen));
        }
        let resolved = self.resolve_path(path);
        let url = self.url_for(path, timestamp);

        let response = self.get_with_retry(&url).await?;

        if register_dep {
            let tx = self.current.as_mut().expect("checked above");
            if tx.deps.contains_key(&resolved) {
                return Err(UrdError::Usage(common::errors::UsageError::DuplicateDependency(resolved)));
            }
            let dep_timestamp = response.as_ref().map(|r| r.timestamp.clone()).unwrap_or_default();
            tx.deps.insert(resolved, dep_timestamp);
            tx.latest_joblist = response.as_ref().map(|r| r.joblist.clone());
        }

        Ok(response)
    }

    pub async fn get(&mut self, path: &str, timestamp: &str) -> Result<Option<UrdResponse>, UrdError> {
        self.fetch(path, timestamp, true).await
    }

    pub async fn latest(&mut self, path: &str) -> Result<Option<UrdResponse>, UrdError> {
        self.fetch(path, "latest", true).await
    }

    pub async fn first(&mut self, path: &str) -> Result<Option<UrdResponse>, UrdError> {
        self.fetch(path, "first", true).await
    }

    pub async fn peek(&mut self, path: &str, timestamp: &str) -> Result<Option<UrdResponse>, UrdError> {
        self.fetch(path, timestamp, false).await
    }

    pub async fn peek_latest(&mut self, path: &str) -> Result<Option<UrdResponse>, UrdError> {
        self.fetch(path, "latest", false).await
    }

    pub async fn peek_first(&mut self, path: &str) -> Result<Option<UrdResponse>, UrdError> {
        self.fetch(path, "first", false).await
    }

    /// Timestamps strictly after `timestamp` for `path`.
    pub async fn since(&mut self, path: &str, timestamp: &str) -> Result<Vec<String>, UrdError> {
        let url = format!(
            "{}/since/{}/{}",
            self.base_url.trim_end_matches('/'),
            urlencode(&self.resolve_path(path)),
            urlencode(timestamp)
        );
        let result = self.retry_request(|client| client.get(&url)).await?;
        let body: Vec<String> = result
            .json()
            .await
            .map_err(|e| UrdError::Transport(TransportError::Decode(e.to_string())))?;
        Ok(body)
    }

    pub async fn finish(
        &mut self,
        path: &str,
        timestamp: Option<String>,
        caption: Option<String>,
        joblist: JobList,
    ) -> Result<(), UrdError> {
        let tx = self
            .current
            .take()
            .ok_or(UrdError::Usage(common::errors::UsageError::NoTransactionOpen))?;
        if tx.path != path {
            let actual = tx.path.clone();
            self.current = Some(tx);
            return Err(UrdError::Usage(common::errors::UsageError::WrongTransaction {
                expected: path.to_string(),
                actual,
            }));
        }

        let resolved_timestamp = timestamp
            .or(tx.timestamp.clone())
            .ok_or_else(|| UrdError::Usage(common::errors::UsageError::MissingTimestamp(path.to_string())))?;

        #[derive(Serialize)]
        struct FinishBody<'a> {
            user: &'a str,
            automation: &'a str,
            joblist: &'a JobList,
            deps: &'a HashMap<String, String>,
            caption: &'a Option<String>,
            timestamp: &'a str,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            flags: &'a Vec<String>,
        }

        let mut flags = self.flags.clone();
        if tx.update && !flags.iter().any(|f| f == "update") {
            flags.push("update".to_string());
        }

        let body = FinishBody {
            user: &self.user,
            automation: &tx.path,
            joblist: &joblist,
            deps: &tx.deps,
            caption: &caption.or(tx.caption.clone()),
            timestamp: &resolved_timestamp,
            flags: &flags,
        };

        let url = format!("{}/add", self.base_url.trim_end_matches('/'));
        self.post_with_retry(&url, &body).await?;
        common::telemetry::record_urd_transaction_finished(path);
        Ok(())
    }

    pub async fn truncate(&mut self, path: &str, timestamp: &str) -> Result<(), UrdError> {
        let url = format!(
            "{}/truncate/{}/{}",
            self.base_url.trim_end_matches('/'),
            urlencode(&self.resolve_path(path)),
            urlencode(timestamp)
        );
        self.retry_request(|client| client.post(&url)).await?;
        Ok(())
    }

    /// The `JobRef` chained into `build_chained`'s `datasets["previous"]`
    /// slot, taken from the most recent `get`/`latest`/`first` fetch.
    pub fn latest_joblist(&self) -> Option<&JobList> {
        self.current.as_ref().and_then(|tx| tx.latest_joblist.as_ref())
    }

    /// Thin convenience over [`Automation::call_method`].
    pub async fn build(&self, automation: &mut Automation, request: CallMethodRequest) -> Result<String, BuildError> {
        Ok(automation.call_method(request).await?)
    }

    /// Like [`Self::build`], but injects `datasets["previous"]` with the
    /// jobid of `name` from the most recent `get`/`latest`/`first` fetch in
    /// this transaction before delegating.
    pub async fn build_chained(
        &self,
        automation: &mut Automation,
        mut request: CallMethodRequest,
        name: &str,
    ) -> Result<String, BuildError> {
        if name.is_empty() {
            return Err(BuildError::Usage(UsageError::MissingChainName));
        }
        let previous = self
            .latest_joblist()
            .and_then(|joblist| joblist.by_method(name))
            .cloned()
            .ok_or(UsageError::NothingToChainFrom)?;

        let method = request.method.clone();
        match &mut request.datasets {
            MaybeScoped::Flat(slots) => {
                slots.insert("previous".to_string(), NameRef::Job(previous));
            }
            MaybeScoped::ByMethod(by_method) => {
                by_method
                    .entry(method)
                    .or_default()
                    .insert("previous".to_string(), NameRef::Job(previous));
            }
        }

        Ok(automation.call_method(request).await?)
    }

    async fn get_with_retry(&mut self, url: &str) -> Result<Option<UrdResponse>, UrdError> {
        let result = self.retry_request(|client| client.get(url)).await?;
        let text = result
            .text()
            .await
            .map_err(|e| UrdError::Transport(TransportError::Decode(e.to_string())))?;
        if text.trim().is_empty() || text.trim() == "null" {
            return Ok(None);
        }
        let parsed: UrdResponse = serde_json::from_str(&text)
            .map_err(|e| UrdError::Transport(TransportError::Decode(e.to_string())))?;
        Ok(Some(parsed))
    }

    async fn post_with_retry<B: Serialize>(&mut self, url: &str, body: &B) -> Result<reqwest::Response, UrdError> {
        let json = serde_json::to_string(body)
            .map_err(|e| UrdError::Transport(TransportError::Decode(e.to_string())))?;
        self.retry_request(move |client| client.post(url).body(json.clone()))
            .await
    }

    /// Retries transport errors and malformed JSON up to three times with
    /// a 4s delay; HTTP 401/409 are surfaced immediately.
    async fn retry_request<F>(&self, build: F) -> Result<reqwest::Response, UrdError>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let response = build(&self.client).send().await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED {
                        return Err(UrdError::Auth(AuthError));
                    }
                    if status == StatusCode::CONFLICT {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(UrdError::Conflict(ConflictError(body)));
                    }
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let message = format!("unexpected status {status}");
                    if !self.retry.should_retry(attempt) {
                        return Err(UrdError::Transport(TransportError::Request(message)));
                    }
                }
                Err(e) => {
                    if !self.retry.should_retry(attempt) {
                        return Err(UrdError::Transport(TransportError::Request(e.to_string())));
                    }
                }
            }
            if let Some(delay) = self.retry.next_delay(attempt) {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => out.push(b as char),
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn base64_encode(input: &[u8]) -> String {
    const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((input.len() + 2) / 3 * 4);
    for chunk in input.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[(triple >> 18 & 0x3F) as usize] as char);
        out.push(ALPHABET[(triple >> 12 & 0x3F) as usize] as char);
        out.push(if chunk.len() > 1 { ALPHABET[(triple >> 6 & 0x3F) as usize] as char } else { '=' });
        out.push(if chunk.len() > 2 { ALPHABET[(triple & 0x3F) as usize] as char } else { '=' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn resolve_path_prepends_user_to_bare_names() {
        let client = UrdClient::new("http://localhost", "alice", "secret").unwrap();
        assert_eq!(client.resolve_path("project_a"), "alice/project_a");
        assert_eq!(client.resolve_path("bob/project_b"), "bob/project_b");
    }

    #[test]
    fn begin_rejects_nested_transaction() {
        let mut client = UrdClient::new("http://localhost", "alice", "secret").unwrap();
        client.begin("alice/a", None, None, false).unwrap();
        let err = client.begin("alice/b", None, None, false).unwrap_err();
        assert!(matches!(err, UrdError::Usage(common::errors::UsageError::TransactionAlreadyOpen(_))));
    }

    #[test]
    fn empty_urd_response_is_falsy() {
        let r = UrdResponse::default();
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn latest_registers_dependency_and_rejects_duplicate_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "caption": "run 1",
                "timestamp": "2024-01-01T00:00:00",
                "joblist": [],
                "deps": {},
            })))
            .mount(&server)
            .await;

        let mut client = UrdClient::new(server.uri(), "alice", "secret").unwrap();
        client.begin("alice/a", Some("2024-01-02".into()), None, false).unwrap();

        let first = client.latest("alice/a").await.unwrap();
        assert!(first.is_some());

        let err = client.latest("alice/a").await.unwrap_err();
        assert!(matches!(err, UrdError::Usage(common::errors::UsageError::DuplicateDependency(_))));
    }

    #[tokio::test]
    async fn unauthorized_status_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let mut client = UrdClient::new(server.uri(), "alice", "secret").unwrap();
        client.begin("alice/a", None, None, false).unwrap();
        let err = client.get("alice/a", "latest").await.unwrap_err();
        assert!(matches!(err, UrdError::Auth(_)));
    }

    async fn automation_against(server: &MockServer) -> Automation {
        Mock::given(method("GET"))
            .and(path("/methods/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "csvimport": {"dep": []},
            })))
            .mount(server)
            .await;
        let daemon = crate::daemon::DaemonClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        Automation::new(daemon, server.uri(), "default").await.unwrap()
    }

    #[tokio::test]
    async fn build_chained_rejects_empty_name() {
        let server = MockServer::start().await;
        let mut automation = automation_against(&server).await;
        let client = UrdClient::new(server.uri(), "alice", "secret").unwrap();
        let err = client
            .build_chained(&mut automation, CallMethodRequest::new("csvimport"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Usage(UsageError::MissingChainName)));
    }

    #[tokio::test]
    async fn build_chained_rejects_missing_prior_fetch() {
        let server = MockServer::start().await;
        let mut automation = automation_against(&server).await;
        let client = UrdClient::new(server.uri(), "alice", "secret").unwrap();
        let err = client
            .build_chained(&mut automation, CallMethodRequest::new("csvimport"), "csvimport")
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Usage(UsageError::NothingToChainFrom)));
    }
}
