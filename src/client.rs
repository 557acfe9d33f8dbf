//! HTTP client for a running `kvmprov serve`.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::api::ErrorBody;
use crate::error::ProvError;
use crate::model::{ProvisionRequest, VmRecord};
use crate::orchestrator::Accepted;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// `base` is either a bare `host:port` or a full `http://` URL.
    pub fn new(base: &str) -> Result<Self, ProvError> {
        let base = if base.starts_with("http://") || base.starts_with("https://") {
            base.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", base.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProvError::Client {
                message: format!("building HTTP client: {e}"),
            })?;
        Ok(Self { base, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub async fn health(&self) -> Result<(), ProvError> {
        let resp = self.send(self.http.get(self.url("/health"))).await?;
        check(resp).await.map(|_| ())
    }

    /// Returns whether a new attempt was started, and the `{name, state}` body.
    pub async fn submit(&self, request: &ProvisionRequest) -> Result<(bool, Accepted), ProvError> {
        let resp = self
            .send(self.http.post(self.url("/vms")).json(request))
            .await?;
        let started = resp.status() == StatusCode::ACCEPTED;
        let accepted = parse(check(resp).await?).await?;
        Ok((started, accepted))
    }

    /// `None` when the server has no record for `name`.
    pub async fn get(&self, name: &str) -> Result<Option<VmRecord>, ProvError> {
        let resp = self
            .send(self.http.get(self.url(&format!("/vms/{name}"))))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse(check(resp).await?).await.map(Some)
    }

    pub async fn list(&self) -> Result<Vec<VmRecord>, ProvError> {
        let resp = self.send(self.http.get(self.url("/vms"))).await?;
        parse(check(resp).await?).await
    }

    pub async fn stop(&self, name: &str, force: bool) -> Result<VmRecord, ProvError> {
        let req = self
            .http
            .post(self.url(&format!("/vms/{name}/stop")))
            .query(&[("force", force)]);
        parse(check(self.send(req).await?).await?).await
    }

    pub async fn start(&self, name: &str) -> Result<VmRecord, ProvError> {
        let req = self.http.post(self.url(&format!("/vms/{name}/start")));
        parse(check(self.send(req).await?).await?).await
    }

    pub async fn cancel(&self, name: &str) -> Result<VmRecord, ProvError> {
        let req = self.http.post(self.url(&format!("/vms/{name}/cancel")));
        parse(check(self.send(req).await?).await?).await
    }

    pub async fn delete(&self, name: &str) -> Result<VmRecord, ProvError> {
        let req = self.http.delete(self.url(&format!("/vms/{name}")));
        parse(check(self.send(req).await?).await?).await
    }

    /// Contents of the newest attempt or operation log for `name`.
    pub async fn log(&self, name: &str) -> Result<String, ProvError> {
        let req = self.http.get(self.url(&format!("/vms/{name}/log")));
        let resp = check(self.send(req).await?).await?;
        resp.text().await.map_err(|e| ProvError::Client {
            message: format!("reading response: {e}"),
        })
    }

    /// Poll until `name` has no operation in progress. `None` means the
    /// record is gone.
    pub async fn wait_settled(
        &self,
        name: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<Option<VmRecord>, ProvError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get(name).await? {
                None => return Ok(None),
                Some(record) if !record.in_progress => return Ok(Some(record)),
                Some(record) => {
                    tracing::debug!(name, state = %record.state, "waiting");
                }
            }
            if tokio::time::Instant::now() + poll > deadline {
                return Err(ProvError::Busy {
                    name: name.to_string(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response, ProvError> {
        req.send().await.map_err(|e| ProvError::Client {
            message: format!("cannot reach {}: {e}", self.base),
        })
    }
}

/// Turn a non-2xx response into an error carrying the server's `{field, reason}`.
async fn check(resp: Response) -> Result<Response, ProvError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => format!("{}: {}", body.field, body.reason),
        Err(_) if text.is_empty() => status.to_string(),
        Err(_) => text,
    };
    if status.is_server_error() {
        Err(ProvError::Server { message })
    } else {
        Err(ProvError::Client {
            message: format!("{status}: {message}"),
        })
    }
}

async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T, ProvError> {
    resp.json().await.map_err(|e| ProvError::Client {
        message: format!("unexpected response: {e}"),
    })
}
