//! MAAS provisioner
//!
//! Speaks the MAAS 2.0 REST API: allocate a machine, deploy it with the boot
//! configuration as user data, and wait for it to report an address.
//! Requests are signed with OAuth 1.0 PLAINTEXT from the
//! `consumer:token:secret` API key MAAS hands out.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{ProvisionRequest, ProvisionedMachine, Provisioner};
use crate::config::PollConfig;
use crate::retry::{retry, retry_with_backoff, RetryConfig};
use crate::Error;

/// MAAS status of a machine whose deployment failed
const FAILED_DEPLOYMENT: &str = "Failed deployment";

/// Connection settings for [`MaasProvisioner`]
#[derive(Clone, Debug)]
pub struct MaasConfig {
    /// MAAS endpoint, e.g. `http://maas.example:5240/MAAS`
    pub url: String,
    /// API key in `consumer:token:secret` form
    pub credentials: MaasCredentials,
    /// How long to wait for a deployed machine to report an address
    pub deploy_poll: PollConfig,
    /// Retries for individual API calls
    pub request_retry: RetryConfig,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl MaasConfig {
    /// Settings with default timings
    pub fn new(url: impl Into<String>, credentials: MaasCredentials) -> Self {
        Self {
            url: url.into(),
            credentials,
            deploy_poll: PollConfig::new(90, Duration::from_secs(10)),
            request_retry: RetryConfig::with_max_attempts(3),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// OAuth credentials parsed from a MAAS API key
#[derive(Clone, PartialEq, Eq)]
pub struct MaasCredentials {
    consumer_key: String,
    token_key: String,
    token_secret: String,
}

impl fmt::Debug for MaasCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaasCredentials")
            .field("consumer_key", &self.consumer_key)
            .field("token_key", &self.token_key)
            .field("token_secret", &"[redacted]")
            .finish()
    }
}

impl FromStr for MaasCredentials {
    type Err = Error;

    fn from_str(api_key: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = api_key.trim().split(':').collect();
        match parts.as_slice() {
            [consumer, token, secret]
                if !consumer.is_empty() && !token.is_empty() && !secret.is_empty() =>
            {
                Ok(Self {
                    consumer_key: consumer.to_string(),
                    token_key: token.to_string(),
                    token_secret: secret.to_string(),
                })
            }
            _ => Err(Error::validation_for(
                "maas",
                "API key must have the form consumer:token:secret",
            )),
        }
    }
}

impl MaasCredentials {
    /// `Authorization` header value for one request
    ///
    /// PLAINTEXT signing: the signature is the empty consumer secret and the
    /// token secret joined by `&`. Every request gets a fresh nonce.
    fn authorization_header(&self) -> String {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let timestamp = chrono::Utc::now().timestamp();
        format!(
            "OAuth oauth_version=\"1.0\", oauth_signature_method=\"PLAINTEXT\", \
             oauth_consumer_key=\"{}\", oauth_token=\"{}\", oauth_signature=\"&{}\", \
             oauth_nonce=\"{nonce}\", oauth_timestamp=\"{timestamp}\"",
            self.consumer_key, self.token_key, self.token_secret
        )
    }
}

/// Machine representation returned by the MAAS API
#[derive(Clone, Debug, Deserialize)]
struct MaasMachine {
    system_id: String,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    ip_addresses: Vec<String>,
    #[serde(default)]
    status_name: Option<String>,
}

impl From<MaasMachine> for ProvisionedMachine {
    fn from(m: MaasMachine) -> Self {
        Self {
            system_id: m.system_id,
            hostname: m.hostname,
            addresses: m.ip_addresses,
        }
    }
}

/// [`Provisioner`] backed by a MAAS region controller
pub struct MaasProvisioner {
    client: reqwest::Client,
    config: MaasConfig,
}

impl MaasProvisioner {
    /// Create a provisioner for the given endpoint
    pub fn new(config: MaasConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::internal_with_context("maas", e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/2.0/{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Send one API call with retries. `None` means MAAS answered 404.
    async fn send(
        &self,
        method: Method,
        path: &str,
        op: Option<&str>,
        form: &[(&str, &str)],
        subject: &str,
    ) -> Result<Option<String>, Error> {
        let url = self.url(path);
        let name = format!("maas {} {}", method, op.unwrap_or(path));

        retry_with_backoff(&self.config.request_retry, &name, || {
            let method = method.clone();
            let url = url.clone();
            async move {
                let mut request = self
                    .client
                    .request(method, &url)
                    .header(AUTHORIZATION, self.config.credentials.authorization_header());
                if let Some(op) = op {
                    request = request.query(&[("op", op)]);
                }
                if !form.is_empty() {
                    request = request.form(form);
                }

                let response = request
                    .send()
                    .await
                    .map_err(|e| Error::provisioner(subject, format!("request failed: {e}")))?;
                let status = response.status();
                let body = response.text().await.map_err(|e| {
                    Error::provisioner(subject, format!("failed to read response: {e}"))
                })?;

                if status.is_success() {
                    return Ok(Some(body));
                }
                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                Err(status_error(subject, status, &body))
            }
        })
        .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        op: Option<&str>,
        form: &[(&str, &str)],
        subject: &str,
    ) -> Result<T, Error> {
        let body = self
            .send(method, path, op, form, subject)
            .await?
            .ok_or_else(|| Error::provisioner_permanent(subject, format!("{path} not found")))?;
        serde_json::from_str(&body)
            .map_err(|e| Error::serialization_for_kind("maas machine", e.to_string()))
    }

    async fn allocate(&self, request: &ProvisionRequest) -> Result<MaasMachine, Error> {
        let mut form = vec![("name", request.name.as_str())];
        if let Some(instance_type) = request.instance_type.as_deref() {
            form.push(("tags", instance_type));
        }
        self.call(
            Method::POST,
            "machines/",
            Some("allocate"),
            &form,
            &request.name,
        )
        .await
    }

    async fn deploy(&self, system_id: &str, boot_config: &str) -> Result<MaasMachine, Error> {
        let user_data = BASE64.encode(boot_config);
        self.call(
            Method::POST,
            &format!("machines/{system_id}/"),
            Some("deploy"),
            &[("user_data", user_data.as_str())],
            system_id,
        )
        .await
    }

    async fn wait_for_address(
        &self,
        system_id: &str,
        cancel: &CancellationToken,
    ) -> Result<MaasMachine, Error> {
        let poll = self.config.deploy_poll;
        retry(poll.attempts, poll.interval, "maas_wait_for_address", cancel, move || async move {
            let machine: MaasMachine = self
                .call(
                    Method::GET,
                    &format!("machines/{system_id}/"),
                    None,
                    &[],
                    system_id,
                )
                .await?;

            if machine.status_name.as_deref() == Some(FAILED_DEPLOYMENT) {
                return Err(Error::provisioner_permanent(system_id, "deployment failed"));
            }
            if machine.ip_addresses.iter().all(|a| a.is_empty()) {
                return Err(Error::provisioner(system_id, "no address reported yet"));
            }
            Ok(machine)
        })
        .await
    }

    async fn release(&self, system_id: &str) -> Result<(), Error> {
        let released = self
            .send(
                Method::POST,
                &format!("machines/{system_id}/"),
                Some("release"),
                &[],
                system_id,
            )
            .await?;
        if released.is_none() {
            debug!(system_id, "machine already gone from MAAS");
        }
        Ok(())
    }
}

fn status_error(subject: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("MAAS returned {status}: {}", body.trim());
    // 409 is MAAS's "no machine matches the constraints right now"
    if status.is_server_error() || status == StatusCode::CONFLICT {
        Error::provisioner(subject, message)
    } else {
        Error::provisioner_permanent(subject, message)
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: &str,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation)),
        result = fut => result,
    }
}

#[async_trait]
impl Provisioner for MaasProvisioner {
    #[instrument(skip(self, request, cancel), fields(machine = %request.name))]
    async fn create(
        &self,
        request: &ProvisionRequest,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedMachine, Error> {
        let allocated = cancellable(cancel, "maas allocate", self.allocate(request)).await?;
        let system_id = allocated.system_id;
        info!(%system_id, "allocated machine");

        let deployed = cancellable(cancel, "maas deploy", async {
            self.deploy(&system_id, &request.boot_config).await?;
            self.wait_for_address(&system_id, cancel).await
        })
        .await;

        match deployed {
            Ok(machine) => {
                info!(%system_id, addresses = ?machine.ip_addresses, "machine deployed");
                Ok(machine.into())
            }
            Err(e) => {
                warn!(%system_id, error = %e, "deployment failed, releasing machine");
                if let Err(release_err) = self.release(&system_id).await {
                    warn!(%system_id, error = %release_err, "failed to release machine");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self, cancel))]
    async fn delete(&self, system_id: &str, cancel: &CancellationToken) -> Result<(), Error> {
        cancellable(cancel, "maas release", self.release(system_id)).await?;
        info!(system_id, "released machine");
        Ok(())
    }
}
