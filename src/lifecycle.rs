//! Per-VM extension lifecycle: delete, install, then poll until the
//! control plane reports the new extension as `Succeeded`.
//!
//! ```text
//! PendingDelete -> PendingInstall -> Polling -> Converged
//!                                           \-> Failed
//! ```
//!
//! A failed delete is logged and the VM still moves on to install. A failed
//! put marks the VM as failed, but polling still runs unless
//! `poll_after_failed_put` is off, so the final extension state is visible
//! in the logs.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::azure::{ControlPlane, ExtensionDescriptor, Scope};
use crate::error::RotatorError;

const DEFAULT_DELETE_SETTLE: Duration = Duration::from_secs(20);
const DEFAULT_INSTALL_SETTLE: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Wait after the delete call before installing.
    pub delete_settle: Duration,
    /// Wait after the put call before the first status read.
    pub install_settle: Duration,
    pub poll: PollPolicy,
    pub poll_after_failed_put: bool,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            delete_settle: DEFAULT_DELETE_SETTLE,
            install_settle: DEFAULT_INSTALL_SETTLE,
            poll: PollPolicy::default(),
            poll_after_failed_put: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    PendingDelete,
    PendingInstall,
    Polling,
    Converged,
    Failed,
}

impl VmState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Converged | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingDelete => "PendingDelete",
            Self::PendingInstall => "PendingInstall",
            Self::Polling => "Polling",
            Self::Converged => "Converged",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmOutcome {
    Converged,
    Failed { reason: String },
}

impl VmOutcome {
    pub const fn state(&self) -> VmState {
        match self {
            Self::Converged => VmState::Converged,
            Self::Failed { .. } => VmState::Failed,
        }
    }

    pub const fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Converged => None,
            Self::Failed { reason } => Some(reason),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    fn from_poll_error(err: &RotatorError) -> Self {
        match err {
            RotatorError::Cancelled => Self::failed("cancelled"),
            RotatorError::PollTimeout { attempts, .. } => {
                Self::failed(format!("poll timed out after {attempts} attempts"))
            }
            other => Self::failed(format!("poll failed: {other}")),
        }
    }
}

/// Terminal result of one VM's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmReport {
    pub vm_name: String,
    pub outcome: VmOutcome,
    pub poll_attempts: u32,
    /// Set when the delete step failed and install went ahead anyway.
    pub delete_warning: Option<String>,
    pub elapsed: Duration,
}

impl VmReport {
    /// Report for a VM whose lifecycle never started.
    pub fn cancelled(vm_name: &str) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            outcome: VmOutcome::failed("cancelled"),
            poll_attempts: 0,
            delete_warning: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn state(&self) -> VmState {
        self.outcome.state()
    }
}

/// Drives the delete/install/poll sequence for one VM at a time.
#[derive(Clone)]
pub struct ExtensionLifecycle {
    client: Arc<dyn ControlPlane>,
    scope: Scope,
    descriptor: ExtensionDescriptor,
    policy: LifecyclePolicy,
}

impl ExtensionLifecycle {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        scope: Scope,
        descriptor: ExtensionDescriptor,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            client,
            scope,
            descriptor,
            policy,
        }
    }

    pub fn client(&self) -> &Arc<dyn ControlPlane> {
        &self.client
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Run the VM to a terminal state. Never returns early without a report.
    pub async fn run(&self, vm_name: &str, cancel: &CancellationToken) -> VmReport {
        let start_time = Instant::now();
        let mut tracker = StateTracker::new(vm_name);

        if cancel.is_cancelled() {
            tracker.enter(VmState::Failed);
            return VmReport::cancelled(vm_name);
        }

        let delete_warning = self.delete_existing(vm_name).await;
        let finish = |outcome: VmOutcome, poll_attempts: u32, delete_warning: Option<String>| {
            VmReport {
                vm_name: vm_name.to_string(),
                outcome,
                poll_attempts,
                delete_warning,
                elapsed: start_time.elapsed(),
            }
        };

        if settle(self.policy.delete_settle, cancel).await.is_err() {
            tracker.enter(VmState::Failed);
            return finish(VmOutcome::failed("cancelled"), 0, delete_warning);
        }
        tracker.enter(VmState::PendingInstall);

        let put_error = self.install(vm_name).await;
        if put_error.is_some() && !self.policy.poll_after_failed_put {
            tracker.enter(VmState::Failed);
            let outcome = put_failure(put_error.as_ref());
            return finish(outcome, 0, delete_warning);
        }

        if settle(self.policy.install_settle, cancel).await.is_err() {
            tracker.enter(VmState::Failed);
            let outcome = match put_error {
                Some(ref e) => put_failure(Some(e)),
                None => VmOutcome::failed("cancelled"),
            };
            return finish(outcome, 0, delete_warning);
        }
        tracker.enter(VmState::Polling);

        let (poll_attempts, poll_result) = self.poll(vm_name, cancel).await;
        let outcome = match (put_error, poll_result) {
            (Some(e), _) => put_failure(Some(&e)),
            (None, Ok(())) => VmOutcome::Converged,
            (None, Err(e)) => VmOutcome::from_poll_error(&e),
        };
        tracker.enter(outcome.state());

        if let Some(reason) = outcome.reason() {
            error!(
                vm = vm_name,
                reason,
                poll_attempts,
                "Extension lifecycle failed"
            );
        } else {
            info!(
                vm = vm_name,
                poll_attempts,
                elapsed_seconds = format!("{:.1}", start_time.elapsed().as_secs_f64()),
                "Extension lifecycle converged"
            );
        }

        finish(outcome, poll_attempts, delete_warning)
    }

    async fn delete_existing(&self, vm_name: &str) -> Option<String> {
        match self.client.delete_extension(&self.scope, vm_name).await {
            Ok(status) => {
                info!(vm = vm_name, status, "Existing extension removed");
                None
            }
            Err(e) => {
                warn!(
                    vm = vm_name,
                    error = %e,
                    "Failed to delete existing extension, continuing with install"
                );
                Some(e.to_string())
            }
        }
    }

    async fn install(&self, vm_name: &str) -> Option<RotatorError> {
        match self
            .client
            .put_extension(&self.scope, vm_name, &self.descriptor)
            .await
        {
            Ok(response) => {
                info!(
                    vm = vm_name,
                    status = response.status,
                    extension_type = self.descriptor.extension_type(),
                    "Extension install accepted"
                );
                debug!(vm = vm_name, body = %response.body, "Install response body");
                None
            }
            Err(e) => {
                error!(
                    vm = vm_name,
                    error = %e,
                    poll_anyway = self.policy.poll_after_failed_put,
                    "Extension install request failed"
                );
                Some(e)
            }
        }
    }

    /// Read the VM until the extension reports `Succeeded`, at most
    /// `max_attempts` times. Returns the number of reads made.
    async fn poll(
        &self,
        vm_name: &str,
        cancel: &CancellationToken,
    ) -> (u32, Result<(), RotatorError>) {
        let extension_type = self.descriptor.extension_type();
        let max_attempts = self.policy.poll.max_attempts;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return (attempt - 1, Err(RotatorError::Cancelled));
            }

            let record = match self.client.get_extension_status(&self.scope, vm_name).await {
                Ok(record) => record,
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        vm = vm_name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Status read failed, retrying"
                    );
                    if settle(self.policy.poll.interval, cancel).await.is_err() {
                        return (attempt, Err(RotatorError::Cancelled));
                    }
                    continue;
                }
                Err(e) => return (attempt, Err(e)),
            };

            for (sibling_type, state) in record.iter() {
                debug!(
                    vm = vm_name,
                    extension_type = sibling_type,
                    provisioning_state = state,
                    "Extension state"
                );
            }

            if record.is_succeeded(extension_type) {
                return (attempt, Ok(()));
            }

            info!(
                vm = vm_name,
                attempt,
                max_attempts,
                provisioning_state = record.state_of(extension_type).unwrap_or("absent"),
                "Extension not ready yet"
            );

            if attempt < max_attempts && settle(self.policy.poll.interval, cancel).await.is_err() {
                return (attempt, Err(RotatorError::Cancelled));
            }
        }

        (
            max_attempts,
            Err(RotatorError::PollTimeout {
                operation: "get_extension_status".to_string(),
                attempts: max_attempts,
            }),
        )
    }
}

fn put_failure(err: Option<&RotatorError>) -> VmOutcome {
    match err {
        Some(e) => VmOutcome::failed(format!("put failed: {e}")),
        None => VmOutcome::failed("put failed"),
    }
}

/// Sleep unless cancelled first.
async fn settle(duration: Duration, cancel: &CancellationToken) -> Result<(), RotatorError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(RotatorError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

struct StateTracker<'a> {
    vm_name: &'a str,
    state: VmState,
}

impl<'a> StateTracker<'a> {
    fn new(vm_name: &'a str) -> Self {
        debug!(vm = vm_name, state = %VmState::PendingDelete, "VM lifecycle started");
        Self {
            vm_name,
            state: VmState::PendingDelete,
        }
    }

    fn enter(&mut self, next: VmState) {
        debug!(
            vm = self.vm_name,
            from = %self.state,
            to = %next,
            "VM state transition"
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azure::mock::{Call, MockControlPlane};
    use crate::azure::{EXTENSION_TYPE, ExtensionStatusRecord};

    fn fast_policy(max_attempts: u32) -> LifecyclePolicy {
        LifecyclePolicy {
            delete_settle: Duration::ZERO,
            install_settle: Duration::ZERO,
            poll: PollPolicy {
                max_attempts,
                interval: Duration::ZERO,
            },
            poll_after_failed_put: true,
        }
    }

    fn lifecycle(mock: &Arc<MockControlPlane>, policy: LifecyclePolicy) -> ExtensionLifecycle {
        ExtensionLifecycle::new(
            mock.clone(),
            Scope::new("sub", "rg"),
            ExtensionDescriptor::vm_access("westeurope", "azureuser", "ssh-rsa AAAA"),
            policy,
        )
    }

    #[test]
    fn test_default_policy_matches_original_delays() {
        let policy = LifecyclePolicy::default();
        assert_eq!(policy.delete_settle, Duration::from_secs(20));
        assert_eq!(policy.install_settle, Duration::from_secs(10));
        assert!(policy.poll.max_attempts > 0);
        assert!(policy.poll_after_failed_put);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!VmState::PendingDelete.is_terminal());
        assert!(!VmState::PendingInstall.is_terminal());
        assert!(!VmState::Polling.is_terminal());
        assert!(VmState::Converged.is_terminal());
        assert!(VmState::Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_delete_happens_before_put_before_poll() {
        let mock = Arc::new(MockControlPlane::with_vms(&["vm0"]).with_states("vm0", &["Succeeded"]));
        let report = lifecycle(&mock, fast_policy(5))
            .run("vm0", &CancellationToken::new())
            .await;

        assert_eq!(report.outcome, VmOutcome::Converged);
        assert_eq!(
            mock.calls_for("vm0"),
            vec![
                Call::Delete("vm0".to_string()),
                Call::Put("vm0".to_string()),
                Call::Get("vm0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_converges_on_third_read() {
        let mock = Arc::new(
            MockControlPlane::with_vms(&["vm0"])
                .with_states("vm0", &["Creating", "Updating", "Succeeded"]),
        );
        let report = lifecycle(&mock, fast_policy(10))
            .run("vm0", &CancellationToken::new())
            .await;

        assert_eq!(report.outcome, VmOutcome::Converged);
        assert_eq!(report.poll_attempts, 3);
        assert_eq!(mock.status_reads("vm0"), 3);
    }

    #[tokio::test]
    async fn test_poll_budget_is_bounded() {
        let mock = Arc::new(MockControlPlane::with_vms(&["vm0"]).with_states("vm0", &["InProgress"]));
        let report = lifecycle(&mock, fast_policy(4))
            .run("vm0", &CancellationToken::new())
            .await;

        assert_eq!(report.state(), VmState::Failed);
        assert_eq!(report.poll_attempts, 4);
        assert_eq!(mock.status_reads("vm0"), 4);
        assert_eq!(report.outcome.reason(), Some("poll timed out after 4 attempts"));
    }

    #[tokio::test]
    async fn test_sibling_extension_success_does_not_converge() {
        let sibling: ExtensionStatusRecord = [("CustomScript", "Succeeded"), (EXTENSION_TYPE, "Creating")]
            .into_iter()
            .collect();
        let mock = Arc::new(MockControlPlane::with_vms(&["vm0"]).on_status("vm0", Ok(sibling)));
        let report = lifecycle(&mock, fast_policy(2))
            .run("vm0", &CancellationToken::new())
            .await;

        assert_eq!(report.state(), VmState::Failed);
        assert_eq!(mock.status_reads("vm0"), 2);
    }

    #[tokio::test]
    async fn test_delete_failure_does_not_block_install() {
        let mock = Arc::new(
            MockControlPlane::with_vms(&["vm0"])
                .on_delete("vm0", Err(RotatorError::transport("delete_extension", "connection reset")))
                .with_states("vm0", &["Succeeded"]),
        );
        let report = lifecycle(&mock, fast_policy(3))
            .run("vm0", &CancellationToken::new())
            .await;

        assert_eq!(report.outcome, VmOutcome::Converged);
        assert!(report.delete_warning.unwrap().contains("connection reset"));
        assert!(mock.calls_for("vm0").contains(&Call::Put("vm0".to_string())));
    }

    #[tokio::test]
    async fn test_put_failure_still_polls_but_fails() {
        let mock = Arc::new(
            MockControlPlane::with_vms(&["vm0"])
                .on_put("vm0", Err(RotatorError::transport("put_extension", "timed out")))
                .with_states("vm0", &["Succeeded"]),
        );
        let report = lifecycle(&mock, fast_policy(3))
            .run("vm0", &CancellationToken::new())
            .await;

        assert_eq!(report.state(), VmState::Failed);
        assert!(report.outcome.reason().unwrap().starts_with("put failed"));
        assert_eq!(mock.status_reads("vm0"), 1);
    }

    #[tokio::test]
    async fn test_put_failure_skips_poll_when_disabled() {
        let mock = Arc::new(
            MockControlPlane::with_vms(&["vm0"])
                .on_put("vm0", Err(RotatorError::api("put_extension", 400, "BadRequest"))),
        );
        let policy = LifecyclePolicy {
            poll_after_failed_put: false,
            ..fast_policy(3)
        };
        let report = lifecycle(&mock, policy)
            .run("vm0", &CancellationToken::new())
            .await;

        assert!(report.outcome.reason().unwrap().starts_with("put failed"));
        assert_eq!(mock.status_reads("vm0"), 0);
    }

    #[tokio::test]
    async fn test_status_read_error_is_terminal() {
        let mock = Arc::new(
            MockControlPlane::with_vms(&["vm0"])
                .on_status("vm0", Err(RotatorError::decode("get_extension_status", "expected value"))),
        );
        let report = lifecycle(&mock, fast_policy(5))
            .run("vm0", &CancellationToken::new())
            .await;

        assert!(report.outcome.reason().unwrap().starts_with("poll failed"));
        assert_eq!(mock.status_reads("vm0"), 1);
    }

    #[tokio::test]
    async fn test_transient_status_read_error_is_retried() {
        let record = [(EXTENSION_TYPE, "Succeeded")].into_iter().collect();
        let mock = Arc::new(
            MockControlPlane::with_vms(&["vm0"])
                .on_status("vm0", Err(RotatorError::api("get_extension_status", 503, "ServerBusy")))
                .on_status("vm0", Ok(record)),
        );
        let report = lifecycle(&mock, fast_policy(30))
            .run("vm0", &CancellationToken::new())
            .await;

        assert_eq!(report.outcome, VmOutcome::Converged);
        assert_eq!(report.poll_attempts, 2);
        assert_eq!(mock.status_reads("vm0"), 2);
    }

    #[tokio::test]
    async fn test_transient_error_on_last_attempt_fails() {
        let mock = Arc::new(
            MockControlPlane::with_vms(&["vm0"])
                .on_status("vm0", Err(RotatorError::transport("get_extension_status", "timed out"))),
        );
        let report = lifecycle(&mock, fast_policy(3))
            .run("vm0", &CancellationToken::new())
            .await;

        assert!(report.outcome.reason().unwrap().starts_with("poll failed"));
        assert_eq!(report.poll_attempts, 3);
        assert_eq!(mock.status_reads("vm0"), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_makes_no_calls() {
        let mock = Arc::new(MockControlPlane::with_vms(&["vm0"]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = lifecycle(&mock, fast_policy(3)).run("vm0", &cancel).await;

        assert_eq!(report.outcome.reason(), Some("cancelled"));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_polling_between_attempts() {
        let mock = Arc::new(MockControlPlane::with_vms(&["vm0"]));
        let policy = LifecyclePolicy {
            poll: PollPolicy {
                max_attempts: 10_000,
                interval: Duration::from_millis(20),
            },
            ..fast_policy(0)
        };
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let report = lifecycle(&mock, policy).run("vm0", &cancel).await;

        assert_eq!(report.outcome.reason(), Some("cancelled"));
        assert!(mock.status_reads("vm0") < 10_000);
        assert!(mock.status_reads("vm0") >= 1);
    }
}
