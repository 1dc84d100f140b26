use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::error::AppError;
use crate::orchestrator::Orchestrator;
use crate::registry::params::PlanRunParams;
use crate::registry::MethodOutput;
use crate::state::BridgeState;

/// Run a plan in-process. Steps go through the same [`Dispatcher`] external
/// callers use, so they contend for project locks like any other call. A
/// failed step is reported in the result, not as a call error.
pub async fn run(state: &Arc<BridgeState>, p: PlanRunParams) -> Result<MethodOutput, AppError> {
    let mut plan = p.plan;
    if let Some(dry_run) = p.dry_run {
        plan.options.dry_run = dry_run;
    }
    if let Some(rollback) = p.rollback_on_fail {
        plan.options.rollback_on_fail = rollback;
    }
    let orchestrator = Orchestrator::new(Arc::new(Dispatcher::new(Arc::clone(state))));
    let report = orchestrator.run(plan).await?;
    let message = match (&report.failed_step, report.dry_run) {
        (Some(index), _) => format!("plan aborted at step {index}"),
        (None, true) => format!("dry run resolved {} steps", report.step_results.len()),
        (None, false) => format!("plan completed {} steps", report.step_results.len()),
    };
    MethodOutput::json(message, &report)
}
