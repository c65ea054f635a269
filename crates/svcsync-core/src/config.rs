//! Configuration for reaching the discovery agent
//!
//! Consumed by the HTTP client implementation when it is constructed. TLS
//! material referenced here is loaded once at client build time and never
//! mutated afterwards; bad material is the engine's only fatal error path.

use serde::{Deserialize, Serialize};

/// Connection settings for the co-located discovery agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent address as `host:port`
    #[serde(default = "default_address")]
    pub address: String,

    /// ACL token sent with every request
    #[serde(default)]
    pub token: Option<String>,

    /// HTTP basic auth, either `user:pass` or just `user`
    #[serde(default)]
    pub auth: Option<String>,

    /// TLS settings; presence switches the client to HTTPS
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl AgentConfig {
    /// Config pointing at a plaintext local agent
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: None,
            auth: None,
            tls: None,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.address.is_empty() {
            return Err(crate::Error::config("agent address cannot be empty"));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    /// Split the `auth` field into username and optional password
    pub fn basic_auth(&self) -> Option<(String, Option<String>)> {
        let auth = self.auth.as_deref()?;
        match auth.split_once(':') {
            Some((user, pass)) => Some((user.to_string(), Some(pass.to_string()))),
            None => Some((auth.to_string(), None)),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(default_address())
    }
}

/// TLS settings for the agent connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle to verify the agent's certificate against
    #[serde(default)]
    pub ca_file: Option<String>,

    /// Client certificate PEM presented to the agent
    #[serde(default)]
    pub cert_file: Option<String>,

    /// Private key PEM for the client certificate
    #[serde(default)]
    pub key_file: Option<String>,

    /// Skip verification of the agent's certificate
    #[serde(default)]
    pub skip_verify: bool,
}

impl TlsConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        match (&self.cert_file, &self.key_file) {
            (Some(_), None) => Err(crate::Error::config(
                "tls cert_file requires key_file",
            )),
            (None, Some(_)) => Err(crate::Error::config(
                "tls key_file requires cert_file",
            )),
            _ => Ok(()),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:8500".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_splits_user_and_password() {
        let mut cfg = AgentConfig::default();
        cfg.auth = Some("alice:secret".to_string());
        assert_eq!(
            cfg.basic_auth(),
            Some(("alice".to_string(), Some("secret".to_string())))
        );

        cfg.auth = Some("alice".to_string());
        assert_eq!(cfg.basic_auth(), Some(("alice".to_string(), None)));

        cfg.auth = None;
        assert_eq!(cfg.basic_auth(), None);
    }

    #[test]
    fn half_configured_client_cert_is_rejected() {
        let mut cfg = AgentConfig::default();
        cfg.tls = Some(TlsConfig {
            cert_file: Some("client.pem".to_string()),
            ..TlsConfig::default()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_address_is_rejected() {
        let cfg = AgentConfig::new("");
        assert!(cfg.validate().is_err());
    }
}
