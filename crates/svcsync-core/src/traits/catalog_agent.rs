//! Discovery-agent contract
//!
//! The engine drives a co-located discovery agent through this trait. The
//! wire types mirror the agent's JSON contract: registrations flow towards
//! the agent, [`AgentService`] and [`AgentCheck`] are its reported view.
//! Implementations perform one request per call and leave retries to the
//! engine, whose next sync tick reproduces any pending action.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;

/// A service registration sent to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    /// Opaque service ID following the engine's ID grammar
    #[serde(rename = "ID")]
    pub id: String,

    /// Display name
    pub name: String,

    /// Tag set; equality over these is order-insensitive
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Address the service is reachable at; omitted when unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Port the service listens on; omitted when unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Let external tooling edit tags without the agent reverting them
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_tag_override: bool,
}

/// A check registration sent to the agent.
///
/// Exactly one of `http`, `tcp`, `ttl` is set, matching the probe kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckRegistration {
    /// Content-hashed check ID
    #[serde(rename = "ID")]
    pub id: String,

    /// Display name
    pub name: String,

    /// Free-form notes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,

    /// Owning service ID
    #[serde(rename = "ServiceID")]
    pub service_id: String,

    /// Probe URL for agent-executed HTTP checks
    #[serde(rename = "HTTP", default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,

    /// Probe target for agent-executed TCP checks
    #[serde(rename = "TCP", default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,

    /// TTL window for delegated checks the engine reports into
    #[serde(rename = "TTL", default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    /// Probe cadence, for agent-executed checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Probe timeout, for agent-executed checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// A service as reported by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,

    /// Display name (the agent calls this field `Service`)
    pub service: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub enable_tag_override: bool,
}

/// A check as reported by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,

    pub name: String,

    #[serde(default)]
    pub notes: String,

    /// Owning service ID; empty for node-level checks
    #[serde(rename = "ServiceID", default)]
    pub service_id: String,

    #[serde(default)]
    pub status: String,
}

/// Status reported through a TTL update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlStatus {
    Passing,
    Warning,
    Critical,
}

impl TtlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for TtlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client for the co-located discovery agent.
///
/// A single instance is shared by the sync driver and every delegated-check
/// runner, so implementations must be safe for concurrent use. Calls may
/// block up to the client's HTTP timeout; the engine never holds a lock
/// across them.
#[async_trait]
pub trait CatalogAgent: Send + Sync {
    /// All services currently registered with the agent, keyed by ID
    async fn services(&self) -> Result<HashMap<String, AgentService>>;

    /// All checks currently registered with the agent, keyed by ID
    async fn checks(&self) -> Result<HashMap<String, AgentCheck>>;

    /// Register or re-register a service
    async fn register_service(&self, reg: &ServiceRegistration) -> Result<()>;

    /// Remove a service (and its checks) from the agent
    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    /// Register or re-register a check
    async fn register_check(&self, reg: &CheckRegistration) -> Result<()>;

    /// Remove a check from the agent
    async fn deregister_check(&self, check_id: &str) -> Result<()>;

    /// Push a delegated check result into its TTL window
    async fn update_ttl(&self, check_id: &str, output: &str, status: TtlStatus) -> Result<()>;

    /// Cheap reachability probe
    async fn ping(&self) -> Result<()>;
}

/// Render a duration the way the agent expects (`"10s"`, `"1500ms"`)
pub fn duration_string(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

// The agent serialises absent tag lists as JSON null rather than omitting
// the field.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
