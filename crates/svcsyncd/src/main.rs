// # svcsyncd - registry sync daemon
//
// Thin integration layer around `svcsync_core::SyncEngine`. The daemon is
// responsible for:
//
// 1. Reading configuration from environment variables
// 2. Initializing logging
// 3. Constructing the HTTP agent client and the engine
// 4. Optionally reaping services from domains that no longer exist
// 5. Running the periodic loop until SIGTERM/SIGINT
//
// No reconciliation logic lives here; producers embed svcsync-core
// directly and this binary only hosts the loop (and the reap tool) for
// deployments that want a standalone process.
//
// ## Configuration
//
// - `SVCSYNC_AGENT_ADDR`: agent address as host:port (default 127.0.0.1:8500)
// - `SVCSYNC_AGENT_TOKEN`: ACL token
// - `SVCSYNC_AGENT_AUTH`: basic auth as `user:pass` or `user`
// - `SVCSYNC_TLS_CA`: CA bundle path; setting any TLS variable enables HTTPS
// - `SVCSYNC_TLS_CERT` / `SVCSYNC_TLS_KEY`: client certificate pair
// - `SVCSYNC_TLS_SKIP_VERIFY`: set to `true` to skip certificate checks
// - `SVCSYNC_KEEP_DOMAINS`: comma-separated domains (`server`, `client`,
//   `executor-{alloc}-{task}` are spelled `executor:{alloc}:{task}`);
//   when set, every owned service outside these domains is deregistered
//   at startup
// - `SVCSYNC_LOG`: log level (default info)

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rand::Rng;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use svcsync_agent_http::HttpCatalogAgent;
use svcsync_core::config::{AgentConfig, TlsConfig};
use svcsync_core::{ServiceDomain, SyncEngine, INITIAL_SYNC_BUFFER, INITIAL_SYNC_DELAY};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit codes following systemd conventions
#[derive(Debug, Clone, Copy)]
enum DaemonExitCode {
    /// Clean shutdown
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
}

impl From<DaemonExitCode> for ExitCode {
    fn from(code: DaemonExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

struct Config {
    agent: AgentConfig,
    keep_domains: Option<Vec<ServiceDomain>>,
    log_level: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        let mut agent = AgentConfig::new(
            env::var("SVCSYNC_AGENT_ADDR").unwrap_or_else(|_| "127.0.0.1:8500".to_string()),
        );
        agent.token = env::var("SVCSYNC_AGENT_TOKEN").ok();
        agent.auth = env::var("SVCSYNC_AGENT_AUTH").ok();

        let ca_file = env::var("SVCSYNC_TLS_CA").ok();
        let cert_file = env::var("SVCSYNC_TLS_CERT").ok();
        let key_file = env::var("SVCSYNC_TLS_KEY").ok();
        let skip_verify = env::var("SVCSYNC_TLS_SKIP_VERIFY")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        if ca_file.is_some() || cert_file.is_some() || key_file.is_some() || skip_verify {
            agent.tls = Some(TlsConfig {
                ca_file,
                cert_file,
                key_file,
                skip_verify,
            });
        }

        let keep_domains = match env::var("SVCSYNC_KEEP_DOMAINS") {
            Ok(raw) => Some(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(parse_domain)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            agent,
            keep_domains,
            log_level: env::var("SVCSYNC_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn parse_domain(raw: &str) -> Result<ServiceDomain> {
    match raw {
        "server" => Ok(ServiceDomain::Server),
        "client" => Ok(ServiceDomain::Client),
        other => {
            let mut parts = other.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("executor"), Some(alloc_id), Some(task_name)) => {
                    Ok(ServiceDomain::executor(alloc_id, task_name))
                }
                _ => bail!("unknown service domain {:?}", raw),
            }
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let level: Level = level.parse().context("invalid SVCSYNC_LOG level")?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("setting logger failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("svcsyncd: {:#}", err);
            return DaemonExitCode::ConfigError.into();
        }
    };

    if let Err(err) = init_logging(&config.log_level) {
        eprintln!("svcsyncd: {:#}", err);
        return DaemonExitCode::ConfigError.into();
    }

    let agent = match HttpCatalogAgent::from_config(&config.agent) {
        Ok(agent) => agent,
        Err(err) => {
            error!(error = %err, "cannot construct agent client");
            return DaemonExitCode::ConfigError.into();
        }
    };
    let engine = SyncEngine::new(Arc::new(agent));

    if let Some(domains) = &config.keep_domains {
        match engine.reap_unmatched(domains).await {
            Ok(()) => info!(domains = domains.len(), "reaped services outside kept domains"),
            Err(err) => warn!(error = %err, "reap of unmatched domains failed"),
        }
    }

    // Stagger the first sync so a fleet restarting together does not slam
    // the agent at the same instant.
    let max_extra = (INITIAL_SYNC_BUFFER - INITIAL_SYNC_DELAY).as_millis() as u64;
    let stagger = INITIAL_SYNC_DELAY
        + std::time::Duration::from_millis(rand::thread_rng().gen_range(0..max_extra));
    info!(stagger_ms = stagger.as_millis() as u64, "delaying initial sync");
    tokio::time::sleep(stagger).await;

    let loop_engine = engine.clone();
    let loop_handle = tokio::spawn(async move { loop_engine.run().await });

    wait_for_signal().await;
    info!("shutdown signal received");

    if let Err(err) = engine.shutdown().await {
        warn!(error = %err, "shutdown completed with errors");
    }
    let _ = loop_handle.await;

    info!("svcsyncd stopped");
    DaemonExitCode::CleanShutdown.into()
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(error = %err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
