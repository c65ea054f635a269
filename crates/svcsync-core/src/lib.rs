// # svcsync-core
//
// Core library for the service-registry reconciliation engine.
//
// ## Architecture Overview
//
// This library keeps a local inventory of services and health checks in
// eventual agreement with a co-located discovery agent:
//
// - **CatalogAgent**: trait for the agent's HTTP API (implemented by the
//   `svcsync-agent-http` crate)
// - **Check**: trait for health probes the engine executes itself and
//   reports through TTL updates
// - **SyncEngine**: multi-producer desired state, four-way diffing and the
//   jittered periodic loop that drives the agent to match
// - **CheckRunner**: lifecycle of one delegated probe, bound to its
//   check's registration state
//
// ## Design Principles
//
// 1. **Eventually consistent**: every failed agent call is reproduced by
//    the next tick's diff; nothing is retried in place
// 2. **Producers never block each other**: no lock is held across a call
//    to the agent
// 3. **Ownership follows registration**: a delegated probe runs exactly
//    while its check is registered

pub mod check_runner;
pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod service;
pub mod traits;

mod availability;

// Re-export core types for convenience
pub use check_runner::CheckRunner;
pub use config::{AgentConfig, TlsConfig};
pub use engine::{
    AddrFinder, PeriodicHandler, SyncEngine, INITIAL_SYNC_BUFFER, INITIAL_SYNC_DELAY,
    SYNC_INTERVAL, SYNC_JITTER, TTL_CHECK_BUFFER,
};
pub use error::{Error, MultiError, Result};
pub use ids::{CheckId, ServiceDomain, ServiceId, ServiceKey, SERVICE_ID_PREFIX};
pub use service::{CheckKind, CheckSpec, Service};
pub use traits::{
    AgentCheck, AgentService, CatalogAgent, Check, CheckRegistration, CheckResult,
    DelegatedCheckFactory, ServiceRegistration, TtlStatus,
};
