//! The supervisor's view of the Container Control Service.
//!
//! `ContainerControl` is the seam the supervisor and reconciler depend on;
//! `CcsClient` is the HTTP implementation that signs each call with a
//! short-lived service token.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use studio_core::auth::{DEFAULT_TOKEN_TTL, ServiceAuth};
use studio_core::config::SupervisorConfig;
use studio_core::error::{ErrorBody, ErrorKind, StudioError};
use studio_core::types::{
    Ack, ContainerDetail, ContainerSummary, CreateNetworkRequest, NetworkSummary, RemoveRequest,
    RunContainerResult, RunContainerSpec, StopRequest,
};
use tracing::debug;

/// Service name carried in tokens minted by the supervisor.
pub const SERVICE_NAME: &str = "deployment-supervisor";

/// Container operations the supervisor needs.
#[async_trait]
pub trait ContainerControl: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, StudioError>;

    async fn get_container(&self, id: &str) -> Result<ContainerDetail, StudioError>;

    async fn run_container(&self, spec: &RunContainerSpec)
    -> Result<RunContainerResult, StudioError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), StudioError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), StudioError>;

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, StudioError>;

    async fn create_network(&self, name: &str) -> Result<NetworkSummary, StudioError>;
}

/// HTTP client for the CCS API.
#[derive(Debug, Clone)]
pub struct CcsClient {
    http: reqwest::Client,
    base_url: String,
    auth: ServiceAuth,
    call_timeout: Duration,
    run_timeout: Duration,
}

impl CcsClient {
    pub fn new(
        base_url: &str,
        secret: &str,
        call_timeout: Duration,
        run_timeout: Duration,
    ) -> Result<Self, StudioError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| StudioError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: ServiceAuth::new(secret),
            call_timeout,
            run_timeout,
        })
    }

    pub fn from_config(config: &SupervisorConfig, secret: &str) -> Result<Self, StudioError> {
        Self::new(
            &config.ccs_url,
            secret,
            Duration::from_secs(config.ccs_timeout_secs),
            Duration::from_secs(config.run_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn send<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<T, StudioError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let token = self.auth.issue(SERVICE_NAME, DEFAULT_TOKEN_TTL)?;
        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(token)
            .timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(method = %method, path, "CCS request");
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, path, timeout))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(decode_error(status, &text));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| transport_error(e, path, timeout))
    }
}

fn transport_error(e: reqwest::Error, path: &str, timeout: Duration) -> StudioError {
    if e.is_timeout() {
        StudioError::timeout(format!("CCS call {path}"), timeout)
    } else if e.is_connect() {
        StudioError::new(
            ErrorKind::RuntimeUnavailable,
            format!("CCS unreachable: {e}"),
        )
    } else if e.is_decode() {
        StudioError::new(ErrorKind::Upstream, format!("bad CCS response for {path}: {e}"))
    } else {
        StudioError::new(
            ErrorKind::RuntimeUnavailable,
            format!("CCS request {path} failed: {e}"),
        )
    }
}

/// Recover the typed error CCS sent, keeping its kind verbatim.
fn decode_error(status: StatusCode, body: &str) -> StudioError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.into(),
        Err(_) => StudioError::new(
            ErrorKind::Upstream,
            format!("CCS returned HTTP {status}: {body}"),
        ),
    }
}

#[async_trait]
impl ContainerControl for CcsClient {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, StudioError> {
        let path = format!("/containers?all={all}");
        self.send::<(), _>(Method::GET, &path, None, self.call_timeout)
            .await
    }

    async fn get_container(&self, id: &str) -> Result<ContainerDetail, StudioError> {
        self.send::<(), _>(
            Method::GET,
            &format!("/containers/{id}"),
            None,
            self.call_timeout,
        )
        .await
    }

    async fn run_container(
        &self,
        spec: &RunContainerSpec,
    ) -> Result<RunContainerResult, StudioError> {
        self.send(Method::POST, "/containers/run", Some(spec), self.run_timeout)
            .await
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), StudioError> {
        let body = StopRequest {
            timeout_seconds: Some(grace.as_secs()),
        };
        let _: Ack = self
            .send(
                Method::POST,
                &format!("/containers/{id}/stop"),
                Some(&body),
                grace + self.call_timeout,
            )
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), StudioError> {
        let _: Ack = self
            .send(
                Method::POST,
                &format!("/containers/{id}/remove"),
                Some(&RemoveRequest { force }),
                self.call_timeout,
            )
            .await?;
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, StudioError> {
        self.send::<(), _>(Method::GET, "/networks", None, self.call_timeout)
            .await
    }

    async fn create_network(&self, name: &str) -> Result<NetworkSummary, StudioError> {
        let body = CreateNetworkRequest {
            name: name.to_string(),
            driver: None,
        };
        self.send(Method::POST, "/networks", Some(&body), self.call_timeout)
            .await
    }
}
