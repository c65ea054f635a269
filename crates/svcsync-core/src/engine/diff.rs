//! Four-way diff between the local and remote inventories
//!
//! Services and checks are diffed independently. Each diff partitions the
//! union of both views into four disjoint sets:
//!
//! - `missing`: present locally, absent remotely; needs a register call
//! - `equal`: both sides agree under the equality relations below
//! - `changed`: same ID on both sides but diverged content; re-registered
//!   without a prior deregister so TTL windows never lapse
//! - `stale`: present remotely only; deregistered. Remote records that were
//!   never tracked land here too, which is how orphans left by a previous
//!   incarnation get cleaned up.
//!
//! Service equality covers ID, name, port, address, the tag-override flag
//! and the tag multiset (order-insensitive, duplicates counted). Check
//! equality covers ID, name, notes and the owning service only; probe
//! parameters are deliberately excluded so cosmetic changes do not reset
//! TTL windows.

use std::collections::HashMap;

use crate::traits::{AgentCheck, AgentService, CheckRegistration, ServiceRegistration};

/// Partitioned outcome of a service diff
#[derive(Debug, Default)]
pub struct ServiceDiff {
    pub missing: Vec<ServiceRegistration>,
    pub equal: Vec<ServiceRegistration>,
    pub changed: Vec<ServiceRegistration>,
    pub stale: Vec<ServiceRegistration>,
}

/// Partitioned outcome of a check diff
#[derive(Debug, Default)]
pub struct CheckDiff {
    pub missing: Vec<CheckRegistration>,
    pub equal: Vec<CheckRegistration>,
    pub changed: Vec<CheckRegistration>,
    pub stale: Vec<CheckRegistration>,
}

enum DiffState {
    LocalOnly,
    Equal,
    Changed,
    RemoteOnly,
}

/// Diff the flattened local services against the agent's filtered view
pub fn service_diff(
    local: Vec<ServiceRegistration>,
    remote: &HashMap<String, AgentService>,
) -> ServiceDiff {
    let mut merged: HashMap<String, (ServiceRegistration, DiffState)> =
        HashMap::with_capacity(local.len() + remote.len());
    for reg in local {
        merged.insert(reg.id.clone(), (reg, DiffState::LocalOnly));
    }
    for svc in remote.values() {
        match merged.get_mut(&svc.id) {
            Some((reg, state)) => {
                *state = if service_equal(reg, svc) {
                    DiffState::Equal
                } else {
                    DiffState::Changed
                };
            }
            None => {
                // Synthesize a registration for the remote-only record so
                // the caller has an ID to deregister.
                let reg = ServiceRegistration {
                    id: svc.id.clone(),
                    name: svc.service.clone(),
                    tags: svc.tags.clone(),
                    address: Some(svc.address.clone()),
                    port: Some(svc.port),
                    enable_tag_override: svc.enable_tag_override,
                };
                merged.insert(svc.id.clone(), (reg, DiffState::RemoteOnly));
            }
        }
    }

    let mut diff = ServiceDiff::default();
    for (_, (reg, state)) in merged {
        match state {
            DiffState::LocalOnly => diff.missing.push(reg),
            DiffState::Equal => diff.equal.push(reg),
            DiffState::Changed => diff.changed.push(reg),
            DiffState::RemoteOnly => diff.stale.push(reg),
        }
    }
    diff
}

/// Diff the flattened local checks against the agent's filtered view
pub fn check_diff(
    local: Vec<CheckRegistration>,
    remote: &HashMap<String, AgentCheck>,
) -> CheckDiff {
    let mut merged: HashMap<String, (CheckRegistration, DiffState)> =
        HashMap::with_capacity(local.len() + remote.len());
    for reg in local {
        merged.insert(reg.id.clone(), (reg, DiffState::LocalOnly));
    }
    for chk in remote.values() {
        match merged.get_mut(&chk.check_id) {
            Some((reg, state)) => {
                *state = if check_equal(reg, chk) {
                    DiffState::Equal
                } else {
                    DiffState::Changed
                };
            }
            None => {
                let reg = CheckRegistration {
                    id: chk.check_id.clone(),
                    name: chk.name.clone(),
                    notes: chk.notes.clone(),
                    service_id: chk.service_id.clone(),
                    http: None,
                    tcp: None,
                    ttl: None,
                    interval: None,
                    timeout: None,
                };
                merged.insert(chk.check_id.clone(), (reg, DiffState::RemoteOnly));
            }
        }
    }

    let mut diff = CheckDiff::default();
    for (_, (reg, state)) in merged {
        match state {
            DiffState::LocalOnly => diff.missing.push(reg),
            DiffState::Equal => diff.equal.push(reg),
            DiffState::Changed => diff.changed.push(reg),
            DiffState::RemoteOnly => diff.stale.push(reg),
        }
    }
    diff
}

/// Equality between a local registration and the agent's view of it
pub fn service_equal(local: &ServiceRegistration, remote: &AgentService) -> bool {
    local.id == remote.id
        && local.name == remote.service
        && local.port.unwrap_or(0) == remote.port
        && local.address.as_deref().unwrap_or("") == remote.address
        && local.enable_tag_override == remote.enable_tag_override
        && tags_equal(&local.tags, &remote.tags)
}

/// Equality between a local check registration and the agent's view of it.
///
/// Probe parameters are not compared; the most recent registration is
/// treated as authoritative for them.
pub fn check_equal(local: &CheckRegistration, remote: &AgentCheck) -> bool {
    local.id == remote.check_id
        && local.name == remote.name
        && local.notes == remote.notes
        && local.service_id == remote.service_id
}

// Multiset comparison: order-insensitive, duplicates counted.
fn tags_equal(local: &[String], remote: &[String]) -> bool {
    if local.len() != remote.len() {
        return false;
    }
    let mut counts: HashMap<&str, i64> = HashMap::with_capacity(local.len());
    for tag in local {
        *counts.entry(tag.as_str()).or_insert(0) += 1;
    }
    for tag in remote {
        match counts.get_mut(tag.as_str()) {
            Some(count) => *count -= 1,
            None => return false,
        }
    }
    counts.values().all(|count| *count == 0)
}
