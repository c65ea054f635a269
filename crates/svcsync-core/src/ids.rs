//! Identifier scheme for engine-owned services and checks
//!
//! Every record this engine registers with the discovery agent carries an
//! identifier derived here. Service IDs follow the grammar
//! `_nomad-{domain}-{serviceKey}`; the prefix is load-bearing for external
//! tooling and must stay stable across versions. Check IDs are content
//! hashes, so identical specs under the same service collapse to a single
//! registration and IDs survive restarts.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::service::{CheckSpec, Service};

/// Prefix scoping every service registered by this engine.
///
/// External tooling filters on this prefix; it must not change.
pub const SERVICE_ID_PREFIX: &str = "_nomad";

/// Namespace partitioning desired state by producer.
///
/// Each producer writes into its own domain so concurrent updates never
/// collide. Domains render into service IDs, so their string forms are part
/// of the external contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceDomain {
    /// Services owned by the cluster server component
    Server,
    /// Services owned by the node-local client component
    Client,
    /// Services owned by a per-workload executor
    Executor {
        /// Allocation the workload belongs to
        alloc_id: String,
        /// Task name within the allocation
        task_name: String,
    },
}

impl ServiceDomain {
    /// Domain for the executor driving `task_name` in `alloc_id`
    pub fn executor(alloc_id: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self::Executor {
            alloc_id: alloc_id.into(),
            task_name: task_name.into(),
        }
    }
}

impl fmt::Display for ServiceDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
            Self::Executor { alloc_id, task_name } => {
                write!(f, "executor-{}-{}", alloc_id, task_name)
            }
        }
    }
}

/// Stable identifier for a service within a domain.
///
/// Derived from the service name and its tags joined by `-`. The join is
/// order-sensitive on purpose: reordering tags produces a new key and hence
/// a new service ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceKey(String);

impl ServiceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key for a producer-supplied service
    pub fn for_service(service: &Service) -> Self {
        if service.tags.is_empty() {
            Self(service.name.clone())
        } else {
            Self(format!("{}-{}", service.name, service.tags.join("-")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque service identifier registered with the agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Build the ID for `key` under `domain` per the ID grammar
    pub fn generate(domain: &ServiceDomain, key: &ServiceKey) -> Self {
        Self(format!("{}-{}-{}", SERVICE_ID_PREFIX, domain, key))
    }

    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque check identifier registered with the agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckId(String);

impl CheckId {
    /// Content hash of a check spec under its owning service.
    ///
    /// Hashes a fixed field list in a fixed order; fields added to
    /// [`CheckSpec`] later must not be fed in here or existing IDs would
    /// change under users.
    pub fn generate(spec: &CheckSpec, service_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(service_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(spec.name.as_bytes());
        hasher.update(b"\n");
        hasher.update(spec.kind.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(duration_field(spec.interval).as_bytes());
        hasher.update(b"\n");
        hasher.update(duration_field(spec.timeout).as_bytes());
        hasher.update(b"\n");
        hasher.update(spec.protocol.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\n");
        hasher.update(spec.path.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\n");
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn duration_field(d: Duration) -> String {
    format!("{}", d.as_millis())
}

/// The `_nomad-{domain}-` prefix every service ID in `domain` starts with.
///
/// The trailing hyphen is included so one domain can never prefix-match a
/// sibling whose name merely extends it.
pub fn domain_prefix(domain: &ServiceDomain) -> String {
    format!("{}-{}-", SERVICE_ID_PREFIX, domain)
}
