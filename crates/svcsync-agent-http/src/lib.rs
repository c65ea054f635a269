// # HTTP Catalog Agent
//
// reqwest-based `CatalogAgent` implementation speaking the discovery
// agent's v1 HTTP API.
//
// The client is constructed once, from an `AgentConfig`, and shared by the
// sync driver and every delegated-check runner. Construction is the only
// fatal error path in the system: bad TLS material fails here and the
// engine never starts. Everything after construction is a transient error
// the engine retries by diffing again on the next tick, so this crate
// performs exactly one request per call and never retries on its own.
//
// ## Security
//
// The ACL token is attached as a request header and never logged; the
// Debug implementation redacts it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::trace;

use svcsync_core::config::AgentConfig;
use svcsync_core::traits::{
    AgentCheck, AgentService, CatalogAgent, CheckRegistration, ServiceRegistration, TtlStatus,
};
use svcsync_core::{Error, Result};

/// Request header carrying the ACL token
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Timeout applied to every agent request
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the co-located discovery agent
pub struct HttpCatalogAgent {
    base_url: String,
    token: Option<String>,
    auth: Option<(String, Option<String>)>,
    client: reqwest::Client,
}

// The token must never reach the log output.
impl std::fmt::Debug for HttpCatalogAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCatalogAgent")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl HttpCatalogAgent {
    /// Build a client from configuration.
    ///
    /// Reads and validates any referenced TLS material; errors here are
    /// fatal to the caller by design.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = reqwest::Client::builder().timeout(DEFAULT_HTTP_TIMEOUT);
        let scheme = if let Some(tls) = &config.tls {
            if let Some(ca_file) = &tls.ca_file {
                let pem = std::fs::read(ca_file).map_err(|err| {
                    Error::config(format!("cannot read CA file {}: {}", ca_file, err))
                })?;
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|err| {
                    Error::config(format!("invalid CA certificate {}: {}", ca_file, err))
                })?;
                builder = builder.add_root_certificate(cert);
            }
            if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
                let cert = std::fs::read(cert_file).map_err(|err| {
                    Error::config(format!("cannot read cert file {}: {}", cert_file, err))
                })?;
                let key = std::fs::read(key_file).map_err(|err| {
                    Error::config(format!("cannot read key file {}: {}", key_file, err))
                })?;
                let mut combined = cert.clone();
                combined.extend_from_slice(&key);
                let identity = reqwest::Identity::from_pem(&combined).map_err(|err| {
                    Error::config(format!("invalid client certificate: {}", err))
                })?;
                builder = builder.identity(identity);
            }
            if tls.skip_verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
            "https"
        } else {
            "http"
        };

        let client = builder
            .build()
            .map_err(|err| Error::config(format!("cannot build HTTP client: {}", err)))?;

        Ok(Self {
            base_url: format!("{}://{}", scheme, config.address),
            token: config.token.clone(),
            auth: config.basic_auth(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token);
        }
        if let Some((user, pass)) = &self.auth {
            req = req.basic_auth(user, pass.as_deref());
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = self
            .apply_auth(req)
            .send()
            .await
            .map_err(|err| Error::http(format!("{}: {}", what, err)))?;

        let status = resp.status();
        if status.is_success() {
            trace!(%status, what, "agent call succeeded");
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 => Err(Error::auth(format!("{}: {} {}", what, status, body))),
            _ => Err(Error::agent(format!("{}: {} {}", what, status, body))),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let resp = self.send(self.client.get(self.url(path)), what).await?;
        resp.json::<T>()
            .await
            .map_err(|err| Error::agent(format!("{}: invalid response body: {}", what, err)))
    }

    async fn put_json<B: serde::Serialize>(&self, path: &str, body: &B, what: &str) -> Result<()> {
        self.send(self.client.put(self.url(path)).json(body), what)
            .await?;
        Ok(())
    }

    async fn put_empty(&self, path: &str, what: &str) -> Result<()> {
        self.send(self.client.put(self.url(path)), what).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogAgent for HttpCatalogAgent {
    async fn services(&self) -> Result<HashMap<String, AgentService>> {
        self.get_json("/v1/agent/services", "list services").await
    }

    async fn checks(&self) -> Result<HashMap<String, AgentCheck>> {
        self.get_json("/v1/agent/checks", "list checks").await
    }

    async fn register_service(&self, reg: &ServiceRegistration) -> Result<()> {
        self.put_json("/v1/agent/service/register", reg, "register service")
            .await
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let path = format!("/v1/agent/service/deregister/{}", service_id);
        self.put_empty(&path, "deregister service").await
    }

    async fn register_check(&self, reg: &CheckRegistration) -> Result<()> {
        self.put_json("/v1/agent/check/register", reg, "register check")
            .await
    }

    async fn deregister_check(&self, check_id: &str) -> Result<()> {
        let path = format!("/v1/agent/check/deregister/{}", check_id);
        self.put_empty(&path, "deregister check").await
    }

    async fn update_ttl(&self, check_id: &str, output: &str, status: TtlStatus) -> Result<()> {
        let path = format!("/v1/agent/check/update/{}", check_id);
        let body = json!({
            "Status": status.as_str(),
            "Output": output,
        });
        self.put_json(&path, &body, "update ttl").await
    }

    async fn ping(&self) -> Result<()> {
        self.send(self.client.get(self.url("/v1/agent/self")), "agent self")
            .await?;
        Ok(())
    }
}
