//! Fault-indication collaborator contract

use async_trait::async_trait;
use tracing::error;

/// Structured notification of an operational error, independent of logging.
///
/// Fire-and-forget: implementations must not propagate their own failures
/// back to the caller.
#[async_trait]
pub trait FaultIndicator: Send + Sync {
    async fn produce_fault_indication(&self, fault: &str, description: &str);
}

/// Fault indicator that reports through the log stream only, used when no
/// external fault-management system is wired in.
pub struct LogFaultIndicator;

#[async_trait]
impl FaultIndicator for LogFaultIndicator {
    async fn produce_fault_indication(&self, fault: &str, description: &str) {
        error!("Fault indication [{}]: {}", fault, description);
    }
}
