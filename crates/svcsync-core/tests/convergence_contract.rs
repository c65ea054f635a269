//! Contract tests: the agent's owned inventory converges to the flattened
//! desired state, and stays put once it has.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::*;
use svcsync_core::{Service, ServiceDomain, ServiceKey, SyncEngine};

fn engine_with_agent() -> (SyncEngine, Arc<MockAgent>) {
    let agent = Arc::new(MockAgent::new());
    let engine = SyncEngine::new(agent.clone());
    engine.set_addr_finder(Arc::new(|label| match label {
        "rpc" => (Some("1.2.3.4".to_string()), Some(4647)),
        "http" => (Some("1.2.3.4".to_string()), Some(4646)),
        _ => (None, None),
    }));
    (engine, agent)
}

#[tokio::test]
async fn first_sync_registers_desired_service() {
    let (engine, agent) = engine_with_agent();

    let mut services = HashMap::new();
    services.extend([keyed(
        Service::new("nomad", "rpc").with_tags(["rpc", "serf"]),
    )]);
    engine
        .set_services(ServiceDomain::Server, services)
        .unwrap();

    engine.sync().await.unwrap();

    assert_eq!(agent.service_ids(), vec!["_nomad-server-nomad-rpc-serf"]);
    let svc = agent.service("_nomad-server-nomad-rpc-serf").unwrap();
    assert_eq!(svc.service, "nomad");
    assert_eq!(svc.address, "1.2.3.4");
    assert_eq!(svc.port, 4647);
    assert_eq!(svc.tags, vec!["rpc", "serf"]);
}

#[tokio::test]
async fn second_sync_is_idempotent() {
    let (engine, agent) = engine_with_agent();

    let mut services = HashMap::new();
    services.extend([keyed(Service::new("web", "http").with_tags(["frontend"]))]);
    engine
        .set_services(ServiceDomain::Server, services)
        .unwrap();

    engine.sync().await.unwrap();
    let registers = agent.service_register_calls();
    let deregisters = agent.service_deregister_calls();

    engine.sync().await.unwrap();
    assert_eq!(agent.service_register_calls(), registers);
    assert_eq!(agent.service_deregister_calls(), deregisters);
}

#[tokio::test]
async fn clearing_a_domain_deregisters_only_its_services() {
    let (engine, agent) = engine_with_agent();

    let mut server = HashMap::new();
    server.extend([keyed(Service::new("nomad", "rpc").with_tags(["rpc", "serf"]))]);
    engine.set_services(ServiceDomain::Server, server).unwrap();

    let mut client = HashMap::new();
    client.extend([keyed(Service::new("web", "http"))]);
    engine.set_services(ServiceDomain::Client, client).unwrap();

    engine.sync().await.unwrap();
    assert_eq!(agent.service_ids().len(), 2);

    engine
        .set_services(ServiceDomain::Server, HashMap::new())
        .unwrap();
    engine.sync().await.unwrap();

    assert_eq!(agent.service_ids(), vec!["_nomad-client-web"]);
}

#[tokio::test]
async fn orphan_from_previous_incarnation_is_reaped() {
    let (engine, agent) = engine_with_agent();
    agent.seed_service("_nomad-server-ghost", "ghost", &[]);

    // The domain is known but empty: the ghost is inside our ownership
    // scope and absent from desired state, so it must go.
    engine
        .set_services(ServiceDomain::Server, HashMap::new())
        .unwrap();
    engine.sync().await.unwrap();

    assert!(agent.service_ids().is_empty());
    assert_eq!(agent.service_deregister_calls(), 1);
}

#[tokio::test]
async fn foreign_records_are_never_touched() {
    let (engine, agent) = engine_with_agent();
    agent.seed_service("postgres", "postgres", &["db"]);
    agent.seed_service("_nomad-client-other", "other", &[]);

    // Only the server domain is known to this engine.
    let mut services = HashMap::new();
    services.extend([keyed(Service::new("nomad", "rpc"))]);
    engine
        .set_services(ServiceDomain::Server, services)
        .unwrap();
    engine.sync().await.unwrap();

    let ids = agent.service_ids();
    assert!(ids.contains(&"postgres".to_string()));
    assert!(ids.contains(&"_nomad-client-other".to_string()));
    assert!(ids.contains(&"_nomad-server-nomad".to_string()));
}

#[tokio::test]
async fn every_registered_id_carries_a_domain_prefix() {
    let (engine, agent) = engine_with_agent();

    let mut server = HashMap::new();
    server.extend([
        keyed(Service::new("nomad", "rpc").with_tags(["rpc", "serf"])),
        keyed(Service::new("nomad", "http").with_tags(["http"])),
    ]);
    engine.set_services(ServiceDomain::Server, server).unwrap();

    let mut exec = HashMap::new();
    exec.extend([keyed(Service::new("web", "http"))]);
    engine
        .set_services(ServiceDomain::executor("a1", "task1"), exec)
        .unwrap();

    engine.sync().await.unwrap();

    let registered = agent.registered_service_ids();
    assert!(!registered.is_empty());
    for id in registered {
        assert!(
            id.starts_with("_nomad-server-") || id.starts_with("_nomad-executor-a1-task1-"),
            "unexpected service ID {:?}",
            id
        );
    }
}

#[tokio::test]
async fn tag_reorder_changes_identity_but_not_content() {
    let (engine, agent) = engine_with_agent();

    let mut services = HashMap::new();
    services.extend([keyed(Service::new("nomad", "rpc").with_tags(["a", "b"]))]);
    engine
        .set_services(ServiceDomain::Server, services)
        .unwrap();
    engine.sync().await.unwrap();
    assert_eq!(agent.service_ids(), vec!["_nomad-server-nomad-a-b"]);

    // Reordering tags derives a different service key, so the old ID is
    // deregistered and the new one registered.
    let mut services = HashMap::new();
    services.extend([keyed(Service::new("nomad", "rpc").with_tags(["b", "a"]))]);
    engine
        .set_services(ServiceDomain::Server, services)
        .unwrap();
    engine.sync().await.unwrap();

    assert_eq!(agent.service_ids(), vec!["_nomad-server-nomad-b-a"]);
    assert_eq!(agent.service_deregister_calls(), 1);
}

#[tokio::test]
async fn remote_tag_order_alone_triggers_no_reregister() {
    let (engine, agent) = engine_with_agent();

    let mut services = HashMap::new();
    services.extend([keyed(Service::new("nomad", "rpc").with_tags(["a", "b"]))]);
    engine
        .set_services(ServiceDomain::Server, services)
        .unwrap();
    engine.sync().await.unwrap();
    let registers = agent.service_register_calls();

    // External tooling reshuffles the tag order at the agent. Content is
    // the same multiset, so the diff must report equality.
    agent.set_service_tags("_nomad-server-nomad-a-b", &["b", "a"]);
    engine.sync().await.unwrap();

    assert_eq!(agent.service_register_calls(), registers);
}

#[tokio::test]
async fn convergence_from_arbitrary_remote_state() {
    let (engine, agent) = engine_with_agent();
    agent.seed_service("_nomad-server-stale-one", "stale-one", &[]);
    agent.seed_service("_nomad-server-nomad-rpc-serf", "nomad", &["wrong"]);
    agent.seed_service("unmanaged", "unmanaged", &[]);

    let mut services = HashMap::new();
    services.extend([
        keyed(Service::new("nomad", "rpc").with_tags(["rpc", "serf"])),
        keyed(Service::new("web", "http")),
    ]);
    engine
        .set_services(ServiceDomain::Server, services)
        .unwrap();

    // One tick is enough with a reachable agent.
    engine.sync().await.unwrap();

    assert_eq!(
        agent.service_ids(),
        vec![
            "_nomad-server-nomad-rpc-serf",
            "_nomad-server-web",
            "unmanaged"
        ]
    );
    let repaired = agent.service("_nomad-server-nomad-rpc-serf").unwrap();
    assert_eq!(repaired.tags, vec!["rpc", "serf"]);
}

#[tokio::test]
async fn reap_unmatched_clears_unknown_domains() {
    let (engine, agent) = engine_with_agent();
    agent.seed_service("_nomad-executor-dead-task-web", "web", &[]);
    agent.seed_service("_nomad-server-nomad", "nomad", &[]);
    agent.seed_service("unmanaged", "unmanaged", &[]);

    engine
        .reap_unmatched(&[ServiceDomain::Server, ServiceDomain::Client])
        .await
        .unwrap();

    assert_eq!(
        agent.service_ids(),
        vec!["_nomad-server-nomad", "unmanaged"]
    );
}

#[tokio::test]
async fn construction_errors_do_not_drop_valid_items() {
    let (engine, agent) = engine_with_agent();

    let bad_check = script_check("broken", std::time::Duration::ZERO);
    let mut services = HashMap::new();
    services.extend([
        keyed(Service::new("web", "http")),
        keyed(Service::new("db", "rpc").with_check(bad_check)),
    ]);

    let err = engine
        .set_services(ServiceDomain::Server, services)
        .unwrap_err();
    assert!(err.to_string().contains("zero interval"));

    // The valid service and the service owning the bad check still apply.
    engine.sync().await.unwrap();
    let ids = agent.service_ids();
    assert!(ids.contains(&"_nomad-server-web".to_string()));
    assert!(ids.contains(&"_nomad-server-db".to_string()));
    assert!(agent.check_ids().is_empty());
}

#[tokio::test]
async fn set_services_keys_are_respected() {
    // Producers may key services under arbitrary stable keys; the engine
    // derives IDs from the key it was given, not from the service name.
    let (engine, agent) = engine_with_agent();

    let mut services = HashMap::new();
    services.insert(ServiceKey::new("custom-key"), Service::new("web", "http"));
    engine
        .set_services(ServiceDomain::Client, services)
        .unwrap();
    engine.sync().await.unwrap();

    assert_eq!(agent.service_ids(), vec!["_nomad-client-custom-key"]);
}
