use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RotatorError;
use crate::lifecycle::{ExtensionLifecycle, VmOutcome, VmReport};

/// Outcome of one pass over the resource group.
#[derive(Debug, Clone)]
pub struct FleetResult {
    vm_names: Vec<String>,
    reports: Vec<VmReport>,
    elapsed: Duration,
}

impl FleetResult {
    pub fn new(vm_names: Vec<String>, reports: Vec<VmReport>, elapsed: Duration) -> Self {
        Self {
            vm_names,
            reports,
            elapsed,
        }
    }

    /// Reports in listing order.
    pub fn reports(&self) -> &[VmReport] {
        &self.reports
    }

    pub fn vm_names(&self) -> &[String] {
        &self.vm_names
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn outcome_of(&self, vm_name: &str) -> Option<&VmOutcome> {
        self.reports
            .iter()
            .find(|r| r.vm_name == vm_name)
            .map(|r| &r.outcome)
    }

    /// True once every listed VM has a terminal report.
    pub fn all_done(&self) -> bool {
        self.vm_names.iter().all(|vm| {
            self.reports
                .iter()
                .any(|r| &r.vm_name == vm && r.state().is_terminal())
        })
    }

    pub fn converged_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome.is_converged())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.reports.len() - self.converged_count()
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed_count() == 0 && self.all_done() {
            0
        } else {
            1
        }
    }
}

enum Slot {
    Running(JoinHandle<VmReport>),
    Skipped,
}

/// Lists the resource group once and drives every VM through its lifecycle.
pub struct FleetDriver {
    lifecycle: Arc<ExtensionLifecycle>,
    concurrency: usize,
}

impl FleetDriver {
    pub fn new(lifecycle: ExtensionLifecycle, concurrency: usize) -> Self {
        Self {
            lifecycle: Arc::new(lifecycle),
            concurrency: concurrency.max(1),
        }
    }

    /// Run one pass. Only a failed listing is an error; per-VM failures are
    /// reported in the result.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<FleetResult, RotatorError> {
        let start_time = Instant::now();
        let scope = self.lifecycle.scope();

        let vm_names = self.lifecycle.client().list_vms(scope).await?;
        if vm_names.is_empty() {
            warn!(
                subscription_id = %scope.subscription_id,
                resource_group = %scope.resource_group,
                "No virtual machines found in resource group, nothing to do"
            );
            return Ok(FleetResult::new(vm_names, Vec::new(), start_time.elapsed()));
        }

        info!(
            vm_count = vm_names.len(),
            concurrency = self.concurrency,
            "Starting fleet pass"
        );

        // Permits are taken in listing order so concurrency 1 processes VMs
        // strictly one after another.
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut slots = Vec::with_capacity(vm_names.len());

        for vm_name in &vm_names {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };

            let Some(permit) = permit else {
                debug!(vm = %vm_name, "Skipping VM, fleet pass cancelled");
                slots.push(Slot::Skipped);
                continue;
            };

            let lifecycle = Arc::clone(&self.lifecycle);
            let cancel = cancel.clone();
            let vm_name = vm_name.clone();
            slots.push(Slot::Running(tokio::spawn(async move {
                let report = lifecycle.run(&vm_name, &cancel).await;
                drop(permit);
                report
            })));
        }

        let mut reports = Vec::with_capacity(vm_names.len());
        for (vm_name, slot) in vm_names.iter().zip(slots) {
            let report = match slot {
                Slot::Skipped => VmReport::cancelled(vm_name),
                Slot::Running(handle) => match handle.await {
                    Ok(report) => report,
                    Err(e) => {
                        error!(vm = %vm_name, error = %e, "VM worker task failed");
                        VmReport {
                            vm_name: vm_name.clone(),
                            outcome: VmOutcome::Failed {
                                reason: format!("worker task failed: {e}"),
                            },
                            poll_attempts: 0,
                            delete_warning: None,
                            elapsed: Duration::ZERO,
                        }
                    }
                },
            };
            reports.push(report);
        }

        let result = FleetResult::new(vm_names, reports, start_time.elapsed());
        info!(
            vm_count = result.vm_names().len(),
            converged = result.converged_count(),
            failed = result.failed_count(),
            elapsed_seconds = format!("{:.1}", result.elapsed().as_secs_f64()),
            "Fleet pass complete"
        );

        Ok(result)
    }
}
