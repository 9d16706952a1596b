//! End-of-run outcome table.

use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::fleet::FleetResult;
use crate::lifecycle::VmReport;

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "ATTEMPTS")]
    attempts: String,
    #[tabled(rename = "DURATION")]
    duration: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

impl From<&VmReport> for OutcomeRow {
    fn from(report: &VmReport) -> Self {
        let reason = match (report.outcome.reason(), &report.delete_warning) {
            (Some(reason), _) => reason.to_string(),
            (None, Some(warning)) => format!("converged (delete warning: {warning})"),
            (None, None) => "-".to_string(),
        };

        Self {
            vm: report.vm_name.clone(),
            state: report.state().to_string(),
            attempts: report.poll_attempts.to_string(),
            duration: format!("{:.1}s", report.elapsed.as_secs_f64()),
            reason,
        }
    }
}

/// Render the per-VM outcome table followed by a one-line summary.
pub fn render(result: &FleetResult) -> String {
    let summary = format!(
        "Summary: {}/{} VMs converged in {:.1}s.",
        result.converged_count(),
        result.vm_names().len(),
        result.elapsed().as_secs_f64()
    );

    if result.reports().is_empty() {
        return format!("No virtual machines processed.\n{summary}");
    }

    let rows: Vec<OutcomeRow> = result.reports().iter().map(OutcomeRow::from).collect();
    let table = Table::new(rows).with(Style::sharp()).to_string();

    format!("{table}\n\n{summary}")
}
