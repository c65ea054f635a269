//! Producer-facing service and check definitions
//!
//! Producers (server, client, executors) describe what they want registered
//! using these records. The engine turns them into agent registrations
//! during `set_services`; producers never construct wire types directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tag for HTTP endpoints of the orchestrator's own services
pub const TAG_HTTP: &str = "http";

/// Tag for RPC endpoints of the orchestrator's own services
pub const TAG_RPC: &str = "rpc";

/// Tag for gossip endpoints of the orchestrator's own services
pub const TAG_SERF: &str = "serf";

/// A service a producer wants registered with the discovery agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Display name registered with the agent
    pub name: String,

    /// Tags attached to the registration. Order influences the derived
    /// service key but not registration equality.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Label resolved to a concrete host and port by the installed address
    /// finder at registration-build time
    pub port_label: String,

    /// Health checks attached to this service
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

impl Service {
    /// Create a service with no tags or checks
    pub fn new(name: impl Into<String>, port_label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            port_label: port_label.into(),
            checks: Vec::new(),
        }
    }

    /// Replace the tag list
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a check
    pub fn with_check(mut self, check: CheckSpec) -> Self {
        self.checks.push(check);
        self
    }
}

/// A health check specification attached to a [`Service`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    /// Check name registered with the agent
    pub name: String,

    /// Probe kind
    pub kind: CheckKind,

    /// Cadence the probe runs at
    pub interval: Duration,

    /// How long a single probe may take
    pub timeout: Duration,

    /// URL scheme for HTTP probes; defaults to `http` when unset
    #[serde(default)]
    pub protocol: Option<String>,

    /// URL path for HTTP probes
    #[serde(default)]
    pub path: Option<String>,
}

/// The probe kinds the engine knows how to register.
///
/// `Http` and `Tcp` probes are executed by the agent itself. `Script`
/// probes are delegated: the engine runs them and reports results through
/// TTL updates, so they register as TTL checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Http,
    Tcp,
    Script,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Script => "script",
        }
    }
}
