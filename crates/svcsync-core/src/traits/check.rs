//! Delegated-check capability
//!
//! Some probe kinds are executed by this engine rather than by the agent.
//! The engine only sees them through the [`Check`] trait; the actual probe
//! implementations (script execution and friends) live with the caller, who
//! supplies a [`DelegatedCheckFactory`] for the kinds it wants delegated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::ids::CheckId;
use crate::service::CheckSpec;

/// Outcome of one probe execution.
///
/// Exit codes translate to TTL statuses: 0 is passing, 1 is warning,
/// anything else is critical. A probe that failed to run at all is the
/// `Err` leg of [`Check::run`] instead.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Probe exit code
    pub exit_code: i32,

    /// Probe stdout, forwarded as the TTL output
    pub output: String,

    /// How long the probe took
    pub duration: Duration,
}

/// A health probe the engine runs on behalf of the agent
#[async_trait]
pub trait Check: Send + Sync {
    /// Execute the probe once
    async fn run(&self) -> Result<CheckResult>;

    /// The check ID this probe reports under
    fn id(&self) -> &CheckId;

    /// Cadence the probe should run at
    fn interval(&self) -> Duration;

    /// How long a single run may take before it is logged as overlong
    fn timeout(&self) -> Duration;
}

/// Constructor for delegated checks, installed via
/// `SyncEngine::set_delegated_checks`
pub type DelegatedCheckFactory =
    Arc<dyn Fn(&CheckSpec, &CheckId) -> Result<Arc<dyn Check>> + Send + Sync>;
