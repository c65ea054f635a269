//! Test doubles and helpers for the engine contract tests
//!
//! `MockAgent` is an in-memory stand-in for the discovery agent: it holds
//! the registered inventory, records every call, and can be switched
//! unreachable to simulate an outage. `ScriptedCheck` is a delegated probe
//! with a controllable exit code.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use svcsync_core::traits::{
    AgentCheck, AgentService, CatalogAgent, CheckRegistration, ServiceRegistration, TtlStatus,
};
use svcsync_core::{
    Check, CheckId, CheckKind, CheckResult, CheckSpec, DelegatedCheckFactory, Error, Result,
    Service, ServiceKey,
};

#[derive(Default)]
struct MockInventory {
    services: HashMap<String, AgentService>,
    checks: HashMap<String, AgentCheck>,
}

/// In-memory discovery agent with call recording
pub struct MockAgent {
    inventory: Mutex<MockInventory>,
    reachable: AtomicBool,

    services_calls: AtomicUsize,
    service_register_calls: AtomicUsize,
    service_deregister_calls: AtomicUsize,
    check_register_calls: AtomicUsize,
    check_deregister_calls: AtomicUsize,

    /// Every service ID ever passed to a register call
    registered_service_ids: Mutex<Vec<String>>,
    /// Every check registration ever received
    registered_checks: Mutex<Vec<CheckRegistration>>,
    /// Every TTL update received, as (check_id, output, status)
    ttl_updates: Mutex<Vec<(String, String, TtlStatus)>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self {
            inventory: Mutex::new(MockInventory::default()),
            reachable: AtomicBool::new(true),
            services_calls: AtomicUsize::new(0),
            service_register_calls: AtomicUsize::new(0),
            service_deregister_calls: AtomicUsize::new(0),
            check_register_calls: AtomicUsize::new(0),
            check_deregister_calls: AtomicUsize::new(0),
            registered_service_ids: Mutex::new(Vec::new()),
            registered_checks: Mutex::new(Vec::new()),
            ttl_updates: Mutex::new(Vec::new()),
        }
    }

    /// Simulate an outage (or recovery) of the agent
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::http("connection refused"))
        }
    }

    /// Seed a service as if a previous incarnation had registered it
    pub fn seed_service(&self, id: &str, name: &str, tags: &[&str]) {
        let mut inv = self.inventory.lock().unwrap();
        inv.services.insert(
            id.to_string(),
            AgentService {
                id: id.to_string(),
                service: name.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                address: String::new(),
                port: 0,
                enable_tag_override: false,
            },
        );
    }

    /// Seed a check as if a previous incarnation had registered it
    pub fn seed_check(&self, id: &str, name: &str, service_id: &str) {
        let mut inv = self.inventory.lock().unwrap();
        inv.checks.insert(
            id.to_string(),
            AgentCheck {
                check_id: id.to_string(),
                name: name.to_string(),
                notes: String::new(),
                service_id: service_id.to_string(),
                status: "critical".to_string(),
            },
        );
    }

    /// Rewrite the stored tag order of a service, as external tooling might
    pub fn set_service_tags(&self, id: &str, tags: &[&str]) {
        let mut inv = self.inventory.lock().unwrap();
        if let Some(svc) = inv.services.get_mut(id) {
            svc.tags = tags.iter().map(|t| t.to_string()).collect();
        }
    }

    pub fn service_ids(&self) -> Vec<String> {
        let inv = self.inventory.lock().unwrap();
        let mut ids: Vec<String> = inv.services.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn service(&self, id: &str) -> Option<AgentService> {
        self.inventory.lock().unwrap().services.get(id).cloned()
    }

    pub fn check_ids(&self) -> Vec<String> {
        let inv = self.inventory.lock().unwrap();
        let mut ids: Vec<String> = inv.checks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of full service-list queries served
    pub fn services_calls(&self) -> usize {
        self.services_calls.load(Ordering::SeqCst)
    }

    pub fn service_register_calls(&self) -> usize {
        self.service_register_calls.load(Ordering::SeqCst)
    }

    pub fn service_deregister_calls(&self) -> usize {
        self.service_deregister_calls.load(Ordering::SeqCst)
    }

    pub fn check_register_calls(&self) -> usize {
        self.check_register_calls.load(Ordering::SeqCst)
    }

    pub fn check_deregister_calls(&self) -> usize {
        self.check_deregister_calls.load(Ordering::SeqCst)
    }

    pub fn registered_service_ids(&self) -> Vec<String> {
        self.registered_service_ids.lock().unwrap().clone()
    }

    pub fn registered_checks(&self) -> Vec<CheckRegistration> {
        self.registered_checks.lock().unwrap().clone()
    }

    pub fn ttl_updates(&self) -> Vec<(String, String, TtlStatus)> {
        self.ttl_updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogAgent for MockAgent {
    async fn services(&self) -> Result<HashMap<String, AgentService>> {
        self.ensure_reachable()?;
        self.services_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.inventory.lock().unwrap().services.clone())
    }

    async fn checks(&self) -> Result<HashMap<String, AgentCheck>> {
        self.ensure_reachable()?;
        Ok(self.inventory.lock().unwrap().checks.clone())
    }

    async fn register_service(&self, reg: &ServiceRegistration) -> Result<()> {
        self.ensure_reachable()?;
        self.service_register_calls.fetch_add(1, Ordering::SeqCst);
        self.registered_service_ids
            .lock()
            .unwrap()
            .push(reg.id.clone());
        let mut inv = self.inventory.lock().unwrap();
        inv.services.insert(
            reg.id.clone(),
            AgentService {
                id: reg.id.clone(),
                service: reg.name.clone(),
                tags: reg.tags.clone(),
                address: reg.address.clone().unwrap_or_default(),
                port: reg.port.unwrap_or(0),
                enable_tag_override: reg.enable_tag_override,
            },
        );
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        self.ensure_reachable()?;
        self.service_deregister_calls.fetch_add(1, Ordering::SeqCst);
        let mut inv = self.inventory.lock().unwrap();
        inv.services.remove(service_id);
        // The agent drops a service's checks together with it.
        inv.checks.retain(|_, chk| chk.service_id != service_id);
        Ok(())
    }

    async fn register_check(&self, reg: &CheckRegistration) -> Result<()> {
        self.ensure_reachable()?;
        self.check_register_calls.fetch_add(1, Ordering::SeqCst);
        self.registered_checks.lock().unwrap().push(reg.clone());
        let mut inv = self.inventory.lock().unwrap();
        inv.checks.insert(
            reg.id.clone(),
            AgentCheck {
                check_id: reg.id.clone(),
                name: reg.name.clone(),
                notes: reg.notes.clone(),
                service_id: reg.service_id.clone(),
                status: "critical".to_string(),
            },
        );
        Ok(())
    }

    async fn deregister_check(&self, check_id: &str) -> Result<()> {
        self.ensure_reachable()?;
        self.check_deregister_calls.fetch_add(1, Ordering::SeqCst);
        self.inventory.lock().unwrap().checks.remove(check_id);
        Ok(())
    }

    async fn update_ttl(&self, check_id: &str, output: &str, status: TtlStatus) -> Result<()> {
        self.ensure_reachable()?;
        self.ttl_updates.lock().unwrap().push((
            check_id.to_string(),
            output.to_string(),
            status,
        ));
        let mut inv = self.inventory.lock().unwrap();
        if let Some(chk) = inv.checks.get_mut(check_id) {
            chk.status = status.as_str().to_string();
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_reachable()
    }
}

/// Delegated probe returning a controllable exit code
pub struct ScriptedCheck {
    id: CheckId,
    interval: Duration,
    timeout: Duration,
    exit_code: Arc<AtomicI32>,
    runs: Arc<AtomicUsize>,
}

impl ScriptedCheck {
    pub fn new(
        id: CheckId,
        interval: Duration,
        exit_code: Arc<AtomicI32>,
        runs: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id,
            interval,
            timeout: Duration::from_secs(3),
            exit_code,
            runs,
        }
    }
}

#[async_trait]
impl Check for ScriptedCheck {
    async fn run(&self) -> Result<CheckResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(CheckResult {
            exit_code: self.exit_code.load(Ordering::SeqCst),
            output: "probe output".to_string(),
            duration: Duration::from_millis(1),
        })
    }

    fn id(&self) -> &CheckId {
        &self.id
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Factory handing out `ScriptedCheck`s that share `exit_code` and `runs`
pub fn scripted_check_factory(
    exit_code: Arc<AtomicI32>,
    runs: Arc<AtomicUsize>,
) -> DelegatedCheckFactory {
    Arc::new(move |spec: &CheckSpec, id: &CheckId| {
        Ok(Arc::new(ScriptedCheck::new(
            id.clone(),
            spec.interval,
            Arc::clone(&exit_code),
            Arc::clone(&runs),
        )) as Arc<dyn Check>)
    })
}

/// One service keyed the way producers key them
pub fn keyed(service: Service) -> (ServiceKey, Service) {
    (ServiceKey::for_service(&service), service)
}

/// A script check spec with the given interval
pub fn script_check(name: &str, interval: Duration) -> CheckSpec {
    CheckSpec {
        name: name.to_string(),
        kind: CheckKind::Script,
        interval,
        timeout: Duration::from_secs(3),
        protocol: None,
        path: None,
    }
}
