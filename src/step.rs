//! Worker-side step driver and the collaborator interfaces it consumes.
//!
//! Matchmaking and the collective exchange are external collaborators; this
//! module defines the narrow traits they implement and the lifecycle glue
//! that drives a [`StepControl`] from `LookingForGroup` through `Finished`,
//! bounding each phase by the handle's remaining deadline budget and
//! resolving the handle with the final outcome.

use std::time::Duration;

use async_trait::async_trait;

use crate::control::{GroupInfo, StepControl};
use crate::error::{ControlError, Result};
use crate::stage::AveragingStage;

/// Discovers a compatible peer group for one step.
#[async_trait]
pub trait Matchmaking: Send + Sync {
    /// Attempts to assemble a group. The driver bounds the call by the
    /// handle's remaining budget; implementations should also check
    /// [`StepControl::get_timeout`] when waiting internally.
    async fn look_for_group(&self, control: &StepControl) -> Result<GroupInfo>;
}

/// Runs the collective exchange once a group is assembled and the trigger
/// has been resolved.
#[async_trait]
pub trait AllReduce: Send + Sync {
    /// Exchanges with the group using the handle's gather payload, returning
    /// the group enriched with the binaries gathered from peers.
    async fn run_allreduce(&self, control: &StepControl, group: GroupInfo) -> Result<GroupInfo>;
}

/// Drives one full step on the worker side and resolves the handle.
///
/// Stage transitions: `LookingForGroup` while matchmaking (retried on
/// failure when the handle allows retries and budget remains),
/// `AwaitingTrigger` until the controller calls `allow_allreduce`,
/// `RunningAllreduce` during the exchange, then `Finished`.
///
/// Step-level failures (timeout, peer failure, cancellation) are delivered
/// through the handle's resolved outcome; the same result is returned to the
/// immediate caller for convenience.
pub async fn run_step(
    control: &StepControl,
    matchmaking: &dyn Matchmaking,
    allreduce: &dyn AllReduce,
) -> Result<GroupInfo> {
    let result = drive(control, matchmaking, allreduce).await;
    control.set_stage(AveragingStage::Finished);
    match &result {
        Ok(group) => {
            control.complete(group.clone());
        }
        Err(err) => {
            // no-op if the handle already resolved, e.g. by cancellation
            control.fail(err.clone());
        }
    }
    result
}

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// A budget too large for `Duration` (an infinite deadline in particular)
/// means the phase is effectively unbounded.
fn representable_budget(budget: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(budget).ok()
}

async fn with_budget<T>(
    budget: f64,
    message: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match representable_budget(budget) {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::timeout(message)),
        },
        None => fut.await,
    }
}

async fn drive(
    control: &StepControl,
    matchmaking: &dyn Matchmaking,
    allreduce: &dyn AllReduce,
) -> Result<GroupInfo> {
    control.set_stage(AveragingStage::LookingForGroup);
    let mut retry_delay = INITIAL_RETRY_DELAY;
    let group = loop {
        let budget = control.get_timeout();
        if budget <= 0.0 {
            return Err(ControlError::timeout(
                "no group was assembled before the deadline",
            ));
        }

        let attempt = with_budget(
            budget,
            "no group was assembled before the deadline",
            matchmaking.look_for_group(control),
        )
        .await;

        match attempt {
            Ok(group) => break group,
            Err(err @ (ControlError::Cancelled | ControlError::Timeout { .. })) => {
                return Err(err)
            }
            Err(err) if control.allow_retries() && !control.done() => {
                tracing::warn!(error = %err, "matchmaking failed, retrying");
                let remaining =
                    representable_budget(control.get_timeout()).unwrap_or(MAX_RETRY_DELAY);
                tokio::time::sleep(retry_delay.min(remaining)).await;
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
            }
            Err(err) => return Err(err),
        }
    };

    control.set_stage(AveragingStage::AwaitingTrigger);
    control.wait_for_trigger().await?;

    control.set_stage(AveragingStage::RunningAllreduce);
    control.set_began_allreduce(true);

    let budget = control.get_timeout();
    if budget <= 0.0 {
        return Err(ControlError::timeout(
            "deadline expired before the exchange could start",
        ));
    }

    with_budget(
        budget,
        "the exchange did not finish before the deadline",
        allreduce.run_allreduce(control, group),
    )
    .await
}
