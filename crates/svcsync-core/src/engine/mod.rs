//! Core reconciliation engine
//!
//! The `SyncEngine` keeps the inventory of services and checks owned by
//! this process in eventual agreement with the view held by a co-located
//! discovery agent.
//!
//! ```text
//! ┌────────────┐  set_services(domain, …)   ┌─────────────────┐
//! │ producers  │───────────────────────────▶│ desired state   │
//! │ (server,   │                            │ per domain      │
//! │  client,   │        sync_now()          └────────┬────────┘
//! │  executors)│────────────┐                        │ flatten
//! └────────────┘            ▼                        ▼
//!                    ┌────────────┐   diff    ┌─────────────┐
//!                    │ periodic   │──────────▶│ sync driver │
//!                    │ loop (run) │           └──────┬──────┘
//!                    └────────────┘                  │ register /
//!                                                    ▼ deregister
//!                                            ┌──────────────┐
//!                                            │ agent (HTTP) │
//!                                            └──────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Three locks guard the engine's state: the groups lock (desired state by
//! domain), the registry lock (tracked state, runner table, construction
//! helpers) and the periodic lock (handler table). The groups lock may be
//! taken before the registry lock, never the other way around; the
//! periodic lock nests under nothing. No lock is ever held across a call
//! to the agent; diff inputs are snapshotted first and tracked state is
//! updated afterwards.
//!
//! ## Degradation
//!
//! Every agent failure is retried implicitly: the next tick's diff
//! reproduces whatever action did not land. Reachability transitions are
//! logged once rather than per tick.

pub mod diff;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::availability::Availability;
use crate::check_runner::CheckRunner;
use crate::error::{Error, MultiError, Result};
use crate::ids::{domain_prefix, CheckId, ServiceDomain, ServiceId, ServiceKey, SERVICE_ID_PREFIX};
use crate::service::{CheckKind, CheckSpec, Service};
use crate::traits::{
    duration_string, AgentCheck, AgentService, CatalogAgent, CheckRegistration,
    DelegatedCheckFactory, ServiceRegistration,
};

/// Cadence of the periodic reconciliation
pub const SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Divisor for the random stagger subtracted from `SYNC_INTERVAL`
pub const SYNC_JITTER: u64 = 8;

/// Slack added to a delegated check's interval to form its TTL window,
/// covering scheduling delay between probe run and report
pub const TTL_CHECK_BUFFER: Duration = Duration::from_secs(31);

/// Max time an embedding process should stagger its initial sync by
pub const INITIAL_SYNC_BUFFER: Duration = Duration::from_secs(30);

/// Delay before an initial sync
pub const INITIAL_SYNC_DELAY: Duration = Duration::from_secs(5);

/// Uniquely named callback run before each sync attempt.
///
/// Execution order across handlers is unspecified.
pub type PeriodicHandler = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Resolver from a service's port label to a concrete host and port.
///
/// `None` legs are omitted from the registration.
pub type AddrFinder = Arc<dyn Fn(&str) -> (Option<String>, Option<u16>) + Send + Sync>;

/// Desired state, partitioned by producer domain.
///
/// The two maps share a key space: checks are only carried for services
/// present in the same domain under the same key.
#[derive(Default)]
struct Groups {
    services: HashMap<ServiceDomain, HashMap<ServiceKey, ServiceRegistration>>,
    checks: HashMap<ServiceDomain, HashMap<ServiceKey, Vec<CheckRegistration>>>,
}

/// Tracked state and construction helpers, guarded by the registry lock
#[derive(Default)]
struct Registry {
    tracked_services: HashMap<ServiceId, ServiceRegistration>,
    tracked_checks: HashMap<CheckId, CheckRegistration>,
    check_runners: HashMap<CheckId, Arc<CheckRunner>>,
    delegated: HashSet<CheckKind>,
    check_factory: Option<DelegatedCheckFactory>,
    addr_finder: Option<AddrFinder>,
}

struct EngineInner {
    agent: Arc<dyn CatalogAgent>,
    availability: Arc<Availability>,

    groups: RwLock<Groups>,
    registry: RwLock<Registry>,
    handlers: RwLock<HashMap<String, PeriodicHandler>>,

    /// Single-slot immediate-sync signal; bursts collapse into one permit
    sync_notify: Notify,
    shutdown_notify: Notify,
    shutdown: Mutex<bool>,
}

/// Reconciliation engine for one discovery agent.
///
/// Cheap to clone; clones share all state, so producers can hold their own
/// handle while the periodic loop runs elsewhere.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine over an already-constructed agent client
    pub fn new(agent: Arc<dyn CatalogAgent>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                agent,
                availability: Arc::new(Availability::new()),
                groups: RwLock::new(Groups::default()),
                registry: RwLock::new(Registry::default()),
                handlers: RwLock::new(HashMap::new()),
                sync_notify: Notify::new(),
                shutdown_notify: Notify::new(),
                shutdown: Mutex::new(false),
            }),
        }
    }

    /// The agent client this engine drives
    pub fn agent(&self) -> Arc<dyn CatalogAgent> {
        Arc::clone(&self.inner.agent)
    }

    /// Whether the last contact with the agent succeeded
    pub fn agent_reachable(&self) -> bool {
        self.inner.availability.is_reachable()
    }

    /// Probe the agent directly
    pub async fn agent_present(&self) -> bool {
        self.inner.agent.ping().await.is_ok()
    }

    /// Declare which check kinds this engine executes itself, and how to
    /// construct their probes
    pub fn set_delegated_checks(&self, kinds: HashSet<CheckKind>, factory: DelegatedCheckFactory) {
        let mut registry = self.inner.registry.write().unwrap();
        registry.delegated = kinds;
        registry.check_factory = Some(factory);
    }

    /// Install the port-label resolver used while building registrations
    pub fn set_addr_finder(&self, finder: AddrFinder) {
        self.inner.registry.write().unwrap().addr_finder = Some(finder);
    }

    /// Replace the desired state of `domain` with `services`.
    ///
    /// The previous contents of the domain are dropped wholesale; an empty
    /// map keeps the domain known so its remote records are removed as
    /// stale on the next sync. Construction errors are aggregated and
    /// returned, but items that built successfully are still applied and
    /// an immediate sync is signalled.
    pub fn set_services(
        &self,
        domain: ServiceDomain,
        services: HashMap<ServiceKey, Service>,
    ) -> Result<()> {
        let mut errs = MultiError::new();
        let mut built_services: HashMap<ServiceKey, ServiceRegistration> =
            HashMap::with_capacity(services.len());
        let mut built_checks: HashMap<ServiceKey, Vec<CheckRegistration>> =
            HashMap::with_capacity(services.len());

        for (key, service) in &services {
            let reg = self.build_service(service, &domain, key);
            for spec in &service.checks {
                let chk_reg = match self.build_check_reg(spec, &reg) {
                    Ok(chk_reg) => chk_reg,
                    Err(err) => {
                        errs.push(err);
                        continue;
                    }
                };
                if let Err(err) = self.ensure_check_runner(spec, &chk_reg) {
                    errs.push(err);
                    continue;
                }
                built_checks.entry(key.clone()).or_default().push(chk_reg);
            }
            built_services.insert(key.clone(), reg);
        }

        {
            let mut groups = self.inner.groups.write().unwrap();
            groups.checks.insert(domain.clone(), built_checks);
            groups.services.insert(domain, built_services);
        }

        self.sync_now();
        errs.into_result()
    }

    /// Request a sync ahead of the timer.
    ///
    /// Non-blocking; if a request is already pending the new one is
    /// dropped, collapsing bursts of producer updates.
    pub fn sync_now(&self) {
        self.inner.sync_notify.notify_one();
    }

    /// Deregister every engine-owned service at the agent that does not
    /// belong to any of `domains`.
    ///
    /// Operates on the agent's full inventory regardless of tracked state;
    /// desired state is not touched. Records without the engine's ID
    /// prefix are never considered.
    pub async fn reap_unmatched(&self, domains: &[ServiceDomain]) -> Result<()> {
        let services = self.inner.agent.services().await?;
        let keep: Vec<String> = domains.iter().map(domain_prefix).collect();

        let mut errs = MultiError::new();
        for id in services.keys() {
            if !id.starts_with(SERVICE_ID_PREFIX) {
                continue;
            }
            if keep.iter().any(|prefix| id.starts_with(prefix.as_str())) {
                continue;
            }
            debug!(service_id = %id, "reaping service from unmatched domain");
            if let Err(err) = self.inner.agent.deregister_service(id).await {
                errs.push(err);
            }
        }
        errs.into_result()
    }

    /// Add a uniquely named pre-sync callback. Returns false (and leaves
    /// the existing handler in place) when the name is taken.
    pub fn add_periodic_handler(
        &self,
        name: impl Into<String>,
        handler: PeriodicHandler,
    ) -> bool {
        let name = name.into();
        let mut handlers = self.inner.handlers.write().unwrap();
        if handlers.contains_key(&name) {
            error!(handler = %name, "periodic handler already registered");
            return false;
        }
        handlers.insert(name, handler);
        true
    }

    /// Remove a periodic handler by name
    pub fn remove_periodic_handler(&self, name: &str) {
        self.inner.handlers.write().unwrap().remove(name);
    }

    /// Number of registered periodic handlers
    pub fn num_handlers(&self) -> usize {
        self.inner.handlers.read().unwrap().len()
    }

    /// Number of delegated-check runners currently held, for diagnostics
    pub fn num_check_runners(&self) -> usize {
        self.inner.registry.read().unwrap().check_runners.len()
    }

    /// Run one full reconciliation: periodic handlers, then services, then
    /// checks.
    ///
    /// Services are reconciled before checks because the agent rejects a
    /// check whose service it has not seen. Per-item agent errors are
    /// aggregated and do not stop the remaining items; failing to query
    /// the agent's view aborts that phase only. Every error here is
    /// retried naturally at the next tick, so the outcome only adjusts the
    /// reachability flag and transitions are logged once.
    pub async fn sync(&self) -> Result<()> {
        let mut errs = MultiError::new();
        if let Err(err) = self.run_handlers() {
            errs.push(err);
        }
        if let Err(err) = self.reconcile_services().await {
            errs.push(err);
        }
        if let Err(err) = self.reconcile_checks().await {
            errs.push(err);
        }

        let result = errs.into_result();
        match &result {
            Ok(()) => {
                if self.inner.availability.mark(true) {
                    debug!("sync with agent restored");
                }
            }
            Err(err) => {
                if self.inner.availability.mark(false) {
                    debug!(error = %err, "sync failed, agent treated as unreachable");
                }
            }
        }
        result
    }

    /// Drive periodic reconciliation until [`SyncEngine::shutdown`] is
    /// called from elsewhere.
    ///
    /// The first tick fires immediately; afterwards the timer rearms to
    /// `SYNC_INTERVAL` minus a random stagger so co-located engines do not
    /// thundering-herd the agent.
    pub async fn run(&self) {
        self.run_internal(None).await
    }

    /// Like [`SyncEngine::run`], with an external shutdown signal.
    ///
    /// When the receiver resolves the engine shuts itself down and exits.
    pub async fn run_with_shutdown(&self, shutdown_rx: oneshot::Receiver<()>) {
        self.run_internal(Some(shutdown_rx)).await
    }

    async fn run_internal(&self, mut shutdown_rx: Option<oneshot::Receiver<()>>) {
        let sleep = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(sleep);
        let mut external_armed = shutdown_rx.is_some();

        loop {
            // Biased polling keeps the priorities fixed: a pending shutdown
            // always wins over one more tick, and the immediate first tick
            // wins over a producer signal that is already pending.
            tokio::select! {
                biased;
                _ = self.inner.shutdown_notify.notified() => {
                    info!("stopping registry sync");
                    return;
                }
                _ = external_signal(&mut shutdown_rx), if external_armed => {
                    external_armed = false;
                    if let Err(err) = self.shutdown().await {
                        warn!(error = %err, "shutdown completed with errors");
                    }
                }
                _ = &mut sleep => {
                    // Failures are not logged here per tick; sync() logs
                    // reachability transitions itself.
                    let _ = self.sync().await;
                    sleep.as_mut().reset(Instant::now() + jittered_interval());
                }
                _ = self.inner.sync_notify.notified() => {
                    sleep.as_mut().reset(Instant::now() + SYNC_INTERVAL);
                }
            }
        }
    }

    /// Shut the engine down: stop the periodic loop, stop all delegated
    /// runners and deregister every tracked service from the agent.
    ///
    /// Idempotent; the deregistrations are best-effort and their failures
    /// are aggregated into the returned error without retry.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut latch = self.inner.shutdown.lock().unwrap();
            if *latch {
                return Ok(());
            }
            *latch = true;
        }
        self.inner.shutdown_notify.notify_one();

        let runners: Vec<Arc<CheckRunner>> = {
            let registry = self.inner.registry.read().unwrap();
            registry.check_runners.values().cloned().collect()
        };
        for runner in &runners {
            runner.stop();
        }

        let tracked: Vec<ServiceId> = {
            let registry = self.inner.registry.read().unwrap();
            registry.tracked_services.keys().cloned().collect()
        };
        let mut errs = MultiError::new();
        for service_id in tracked {
            if let Err(err) = self.inner.agent.deregister_service(service_id.as_str()).await {
                warn!(
                    service_id = %service_id,
                    error = %err,
                    "failed to deregister service during shutdown"
                );
                errs.push(err);
            }
        }
        errs.into_result()
    }

    // Construction helpers

    /// Build the agent registration for a producer-supplied service
    fn build_service(
        &self,
        service: &Service,
        domain: &ServiceDomain,
        key: &ServiceKey,
    ) -> ServiceRegistration {
        let (address, port) = {
            let registry = self.inner.registry.read().unwrap();
            match &registry.addr_finder {
                Some(finder) => finder(&service.port_label),
                None => (None, None),
            }
        };
        ServiceRegistration {
            id: ServiceId::generate(domain, key).as_str().to_string(),
            name: service.name.clone(),
            tags: service.tags.clone(),
            address: address.filter(|host| !host.is_empty()),
            port: port.filter(|port| *port != 0),
            enable_tag_override: false,
        }
    }

    /// Build the agent registration for one check of `service`
    fn build_check_reg(
        &self,
        spec: &CheckSpec,
        service: &ServiceRegistration,
    ) -> Result<CheckRegistration> {
        if spec.interval.is_zero() {
            return Err(Error::invalid_service(format!(
                "check {:?} has a zero interval",
                spec.name
            )));
        }

        let mut reg = CheckRegistration {
            id: CheckId::generate(spec, &service.id).as_str().to_string(),
            name: spec.name.clone(),
            notes: String::new(),
            service_id: service.id.clone(),
            http: None,
            tcp: None,
            ttl: None,
            interval: Some(duration_string(spec.interval)),
            timeout: Some(duration_string(spec.timeout)),
        };

        let address = service.address.as_deref().unwrap_or("");
        let port = service.port.unwrap_or(0);
        match spec.kind {
            CheckKind::Http => {
                let protocol = spec.protocol.as_deref().unwrap_or("http");
                let path = spec.path.as_deref().unwrap_or("");
                let sep = if path.is_empty() || path.starts_with('/') {
                    ""
                } else {
                    "/"
                };
                reg.http = Some(format!("{}://{}:{}{}{}", protocol, address, port, sep, path));
            }
            CheckKind::Tcp => {
                reg.tcp = Some(format!("{}:{}", address, port));
            }
            CheckKind::Script => {
                // The engine runs the probe itself and reports through the
                // TTL window; the agent only times the reports out.
                reg.ttl = Some(duration_string(spec.interval + TTL_CHECK_BUFFER));
                reg.interval = None;
                reg.timeout = None;
            }
        }
        Ok(reg)
    }

    /// Create (unstarted) the runner for a delegated check, unless one
    /// already exists for this check ID
    fn ensure_check_runner(&self, spec: &CheckSpec, reg: &CheckRegistration) -> Result<()> {
        let check_id = CheckId::from_raw(reg.id.clone());
        let factory = {
            let registry = self.inner.registry.read().unwrap();
            if !registry.delegated.contains(&spec.kind) {
                return Ok(());
            }
            if registry.check_runners.contains_key(&check_id) {
                return Ok(());
            }
            registry.check_factory.clone().ok_or_else(|| {
                Error::check(format!(
                    "check kind {:?} is delegated but no factory is installed",
                    spec.kind.as_str()
                ))
            })?
        };

        let check = factory(spec, &check_id)?;
        let runner = Arc::new(CheckRunner::new(
            check,
            Arc::clone(&self.inner.agent),
            Arc::clone(&self.inner.availability),
        ));
        self.inner
            .registry
            .write()
            .unwrap()
            .check_runners
            .insert(check_id, runner);
        Ok(())
    }

    // Flatteners and filters

    /// All desired services across domains, snapshotted under the groups
    /// lock
    fn flattened_services(&self) -> Vec<ServiceRegistration> {
        let groups = self.inner.groups.read().unwrap();
        groups
            .services
            .values()
            .flat_map(|by_key| by_key.values().cloned())
            .collect()
    }

    /// All desired checks across domains, snapshotted under the groups
    /// lock
    fn flattened_checks(&self) -> Vec<CheckRegistration> {
        let groups = self.inner.groups.read().unwrap();
        groups
            .checks
            .values()
            .flat_map(|by_key| by_key.values().flatten().cloned())
            .collect()
    }

    /// Keep only agent services owned by a currently known domain
    fn filter_services(
        &self,
        services: HashMap<String, AgentService>,
    ) -> HashMap<String, AgentService> {
        let prefixes: Vec<String> = {
            let groups = self.inner.groups.read().unwrap();
            groups.services.keys().map(domain_prefix).collect()
        };
        services
            .into_iter()
            .filter(|(_, svc)| prefixes.iter().any(|p| svc.id.starts_with(p.as_str())))
            .collect()
    }

    /// Keep only agent checks whose owning service passes the service
    /// filter
    fn filter_checks(&self, checks: HashMap<String, AgentCheck>) -> HashMap<String, AgentCheck> {
        let prefixes: Vec<String> = {
            let groups = self.inner.groups.read().unwrap();
            groups.checks.keys().map(domain_prefix).collect()
        };
        checks
            .into_iter()
            .filter(|(_, chk)| {
                prefixes
                    .iter()
                    .any(|p| chk.service_id.starts_with(p.as_str()))
            })
            .collect()
    }

    // Sync driver

    /// Run the registered periodic handlers, in no particular order
    fn run_handlers(&self) -> Result<()> {
        let handlers: Vec<(String, PeriodicHandler)> = {
            let handlers = self.inner.handlers.read().unwrap();
            handlers
                .iter()
                .map(|(name, handler)| (name.clone(), Arc::clone(handler)))
                .collect()
        };

        let mut errs = MultiError::new();
        for (name, handler) in handlers {
            if let Err(err) = handler() {
                errs.push(Error::handler(name, &err));
            }
        }
        errs.into_result()
    }

    async fn reconcile_services(&self) -> Result<()> {
        let remote = self.filter_services(self.inner.agent.services().await?);
        let diff = diff::service_diff(self.flattened_services(), &remote);

        let mut errs = MultiError::new();
        for reg in diff.missing.iter().chain(diff.changed.iter()) {
            match self.inner.agent.register_service(reg).await {
                Ok(()) => {
                    let mut registry = self.inner.registry.write().unwrap();
                    registry
                        .tracked_services
                        .insert(ServiceId::from_raw(reg.id.clone()), reg.clone());
                }
                Err(err) => errs.push(err),
            }
        }
        for reg in &diff.stale {
            match self.inner.agent.deregister_service(&reg.id).await {
                Ok(()) => {
                    let mut registry = self.inner.registry.write().unwrap();
                    registry
                        .tracked_services
                        .remove(&ServiceId::from_raw(reg.id.clone()));
                }
                Err(err) => errs.push(err),
            }
        }
        errs.into_result()
    }

    async fn reconcile_checks(&self) -> Result<()> {
        let remote = self.filter_checks(self.inner.agent.checks().await?);
        let local = self.flattened_checks();
        let desired_ids: HashSet<String> = local.iter().map(|reg| reg.id.clone()).collect();
        let diff = diff::check_diff(local, &remote);

        let mut errs = MultiError::new();
        // Changed checks are re-registered without a prior deregister so an
        // open TTL window is never lost.
        for reg in diff.missing.iter().chain(diff.changed.iter()) {
            match self.register_check(reg).await {
                Ok(()) => {
                    let mut registry = self.inner.registry.write().unwrap();
                    registry
                        .tracked_checks
                        .insert(CheckId::from_raw(reg.id.clone()), reg.clone());
                }
                Err(err) => errs.push(err),
            }
        }
        // A delegated check can already sit at the agent with equal
        // content, for instance after a restart: it never passes through a
        // register call, but its runner still has to feed the TTL window.
        for reg in &diff.equal {
            if let Some(runner) = self.runner_for(&reg.id) {
                runner.start();
            }
        }
        for reg in &diff.stale {
            if let Err(err) = self.deregister_check(&CheckId::from_raw(reg.id.clone())).await {
                errs.push(err);
            }
        }

        // A check deregistered together with its service never shows up as
        // stale (the agent already dropped it), so the runner table is
        // reconciled against desired state directly: no runner may outlive
        // its check's presence there.
        let orphaned: Vec<Arc<CheckRunner>> = {
            let mut registry = self.inner.registry.write().unwrap();
            let orphan_ids: Vec<CheckId> = registry
                .check_runners
                .keys()
                .filter(|id| !desired_ids.contains(id.as_str()))
                .cloned()
                .collect();
            orphan_ids
                .into_iter()
                .filter_map(|id| {
                    registry.tracked_checks.remove(&id);
                    registry.check_runners.remove(&id)
                })
                .collect()
        };
        for runner in &orphaned {
            runner.stop();
        }

        errs.into_result()
    }

    /// The delegated runner for a check ID, when one exists
    fn runner_for(&self, check_id: &str) -> Option<Arc<CheckRunner>> {
        let registry = self.inner.registry.read().unwrap();
        registry
            .check_runners
            .get(&CheckId::from_raw(check_id.to_string()))
            .cloned()
    }

    /// Register a check with the agent, starting its delegated runner
    /// first when one exists for this ID
    async fn register_check(&self, reg: &CheckRegistration) -> Result<()> {
        if let Some(runner) = self.runner_for(&reg.id) {
            runner.start();
        }
        self.inner.agent.register_check(reg).await
    }

    /// Deregister a check from the agent; on success drop it from tracked
    /// state and stop its runner
    async fn deregister_check(&self, check_id: &CheckId) -> Result<()> {
        self.inner.agent.deregister_check(check_id.as_str()).await?;

        let runner = {
            let mut registry = self.inner.registry.write().unwrap();
            registry.tracked_checks.remove(check_id);
            registry.check_runners.remove(check_id)
        };
        if let Some(runner) = runner {
            runner.stop();
        }
        Ok(())
    }
}

/// `SYNC_INTERVAL` minus a random stagger of up to an eighth of it
fn jittered_interval() -> Duration {
    let max_jitter_ms = SYNC_INTERVAL.as_millis() as u64 / SYNC_JITTER;
    let jitter = rand::thread_rng().gen_range(0..max_jitter_ms);
    SYNC_INTERVAL - Duration::from_millis(jitter)
}

async fn external_signal(rx: &mut Option<oneshot::Receiver<()>>) {
    match rx.as_mut() {
        Some(rx) => {
            // Either leg means the caller wants us gone; a dropped sender
            // is treated the same as an explicit signal.
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}
