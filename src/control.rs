//! Step control handle: the controller-facing, asynchronously resolved view
//! of a single averaging step.
//!
//! The controller constructs a [`StepControl`], wires a trigger with
//! [`attach_trigger`](StepControl::attach_trigger), and hands the handle to
//! the worker side. The worker polls the shared schedule fields, advances
//! [`stage`](StepControl::stage), blocks on
//! [`wait_for_trigger`](StepControl::wait_for_trigger) before the exchange,
//! and posts the final outcome with [`complete`](StepControl::complete) or
//! [`fail`](StepControl::fail). The controller mutates scheduling fields,
//! resolves the trigger with
//! [`allow_allreduce`](StepControl::allow_allreduce), and awaits the handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::{ControlError, Result};
use crate::promise::{Outcome, Promise};
use crate::shm::{SharedScheduleBlock, DEFAULT_SHM_PREFIX};
use crate::stage::AveragingStage;

/// Final result of a successful step: the assembled group and the binaries
/// gathered from its peers. The payloads are opaque to this crate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInfo {
    /// Identifier of the assembled group.
    pub group_id: String,
    /// Ordered peer identifiers, including this peer.
    pub peer_ids: Vec<String>,
    /// One gathered binary per peer, in `peer_ids` order.
    pub gathered: Vec<Vec<u8>>,
}

/// Cross-process handle controlling one averaging step.
pub struct StepControl {
    future: Promise<GroupInfo>,
    block: SharedScheduleBlock,
    trigger: Option<Promise<()>>,
    can_modify: AtomicBool,
    deadline: f64,
    allow_retries: bool,
    gather_payload: Vec<u8>,
}

impl StepControl {
    /// Creates a handle for a new step.
    ///
    /// * `scheduled_time` - shared-clock time the step aims to start at
    /// * `deadline` - absolute shared-clock expiry for the whole step
    /// * `allow_retries` - whether failed matchmaking may be retried
    /// * `weight` - this peer's averaging weight, finite and non-negative
    /// * `gather_payload` - opaque bytes broadcast to and gathered from peers
    ///
    /// # Errors
    ///
    /// Fails with a precondition violation for an invalid weight, or a shared
    /// memory error if the schedule block cannot be allocated.
    pub fn new(
        scheduled_time: f64,
        deadline: f64,
        allow_retries: bool,
        weight: f64,
        gather_payload: Vec<u8>,
    ) -> Result<Self> {
        Self::with_shm_prefix(
            DEFAULT_SHM_PREFIX,
            scheduled_time,
            deadline,
            allow_retries,
            weight,
            gather_payload,
        )
    }

    /// Like [`new`](Self::new), with an explicit shared-memory name prefix.
    pub fn with_shm_prefix(
        prefix: &str,
        scheduled_time: f64,
        deadline: f64,
        allow_retries: bool,
        weight: f64,
        gather_payload: Vec<u8>,
    ) -> Result<Self> {
        let block = SharedScheduleBlock::create_with_prefix(prefix)?;
        block.set_weight(weight)?;

        let control = Self {
            future: Promise::new(),
            block,
            trigger: None,
            can_modify: AtomicBool::new(true),
            deadline,
            allow_retries,
            gather_payload,
        };
        control.set_scheduled_time(scheduled_time);
        Ok(control)
    }

    /// Binds the trigger gate. One-time wiring performed by whatever
    /// constructs the handle.
    ///
    /// # Errors
    ///
    /// Fails with a precondition violation if a trigger is already attached.
    pub fn attach_trigger(&mut self, trigger: Promise<()>) -> Result<()> {
        if self.trigger.is_some() {
            return Err(ControlError::precondition(
                "a trigger is already attached to this step control",
            ));
        }
        self.trigger = Some(trigger);
        Ok(())
    }

    fn trigger(&self) -> Result<&Promise<()>> {
        self.trigger.as_ref().ok_or_else(|| {
            ControlError::precondition(
                "step control has no attached trigger (not properly initialized)",
            )
        })
    }

    /// Allows the worker to begin allreduce once it has found a group.
    ///
    /// Resolving an already-set trigger is a benign no-op that only logs a
    /// warning.
    ///
    /// # Errors
    ///
    /// Fails with a precondition violation if no trigger is attached.
    pub fn allow_allreduce(&self) -> Result<()> {
        let trigger = self.trigger()?;
        if !trigger.complete(()) {
            tracing::warn!("allreduce trigger is already set");
        }
        Ok(())
    }

    /// Suspends until the controller resolves the trigger. Resumes
    /// immediately if it is already resolved; any number of tasks may wait
    /// concurrently.
    ///
    /// # Errors
    ///
    /// A missing trigger is a precondition violation; a cancelled trigger
    /// surfaces as [`ControlError::Cancelled`] and a failed trigger
    /// propagates its error.
    pub async fn wait_for_trigger(&self) -> Result<()> {
        let trigger = self.trigger()?;
        trigger.wait().await.into_result()
    }

    pub fn scheduled_time(&self) -> f64 {
        self.block.scheduled_time()
    }

    /// Moves the step's target start time. Advisory warnings, never errors:
    /// mutating after allreduce began has no effect on the running step, and
    /// scheduling at or past the deadline will likely end in a timeout.
    pub fn set_scheduled_time(&self, scheduled_time: f64) {
        if self.began_allreduce() {
            tracing::warn!("changing scheduled time has no effect after allreduce has started");
        }
        if scheduled_time >= self.deadline {
            tracing::warn!(
                scheduled_time,
                deadline = self.deadline,
                "scheduled time is at or past the deadline, the step will likely time out"
            );
        }
        self.block.set_scheduled_time(scheduled_time);
    }

    pub fn weight(&self) -> f64 {
        self.block.weight()
    }

    /// Updates this peer's averaging weight.
    ///
    /// # Errors
    ///
    /// A negative or non-finite weight is rejected and the stored value is
    /// unchanged. A late update (after allreduce began) still succeeds but
    /// has no effect on the running step; a warning is the only feedback.
    pub fn set_weight(&self, weight: f64) -> Result<()> {
        if self.began_allreduce() {
            tracing::warn!("changing weight has no effect after allreduce has started");
        }
        self.block.set_weight(weight)
    }

    /// Current lifecycle stage.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the shared stage byte is corrupt.
    pub fn stage(&self) -> Result<AveragingStage> {
        self.block.stage()
    }

    /// Advances the lifecycle stage (worker side). Reaching
    /// [`AveragingStage::RunningAllreduce`] freezes the handle's local
    /// schedule-mutation flag; the shared block itself stays writable.
    pub fn set_stage(&self, stage: AveragingStage) {
        if stage == AveragingStage::RunningAllreduce {
            self.can_modify.store(false, Ordering::Release);
        }
        self.block.set_stage(stage);
    }

    pub fn began_allreduce(&self) -> bool {
        self.block.began_allreduce()
    }

    /// Latches the began-allreduce flag. The flag is monotonic: an attempt
    /// to reset it is ignored with a warning.
    pub fn set_began_allreduce(&self, value: bool) {
        if !value && self.block.began_allreduce() {
            tracing::warn!("began_allreduce is monotonic and cannot be reset");
            return;
        }
        self.block.set_began_allreduce(value);
    }

    /// Whether scheduling fields may still meaningfully change. Cleared once
    /// the stage reaches allreduce; purely advisory on this handle's side.
    pub fn can_modify(&self) -> bool {
        self.can_modify.load(Ordering::Acquire)
    }

    pub fn gather_payload(&self) -> &[u8] {
        &self.gather_payload
    }

    pub fn deadline(&self) -> f64 {
        self.deadline
    }

    pub fn allow_retries(&self) -> bool {
        self.allow_retries
    }

    /// Remaining deadline budget in seconds, never negative. Advisory: the
    /// matchmaking and exchange collaborators enforce the deadline.
    pub fn get_timeout(&self) -> f64 {
        (self.deadline - clock::now()).max(0.0)
    }

    /// Posts the step's successful outcome (worker side). Returns `false` if
    /// the handle is already resolved.
    pub fn complete(&self, group: GroupInfo) -> bool {
        self.future.complete(group)
    }

    /// Posts a step-level failure (worker side). Returns `false` if the
    /// handle is already resolved.
    pub fn fail(&self, err: ControlError) -> bool {
        self.future.fail(err)
    }

    /// Whether the handle's own future has resolved.
    pub fn done(&self) -> bool {
        self.future.done()
    }

    /// Suspends until the step finishes, returning the raw outcome.
    pub async fn outcome(&self) -> Outcome<GroupInfo> {
        self.future.wait().await
    }

    /// Suspends until the step finishes, converting failure and cancellation
    /// into errors.
    pub async fn wait(&self) -> Result<GroupInfo> {
        self.future.wait().await.into_result()
    }

    /// Cancels the step: the attached trigger first (so no trigger waiter is
    /// left pending), then the handle's own future. Idempotent; returns
    /// whether this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        if let Some(trigger) = &self.trigger {
            trigger.cancel();
        }
        self.future.cancel()
    }

    /// Compact serializable form for crossing a process boundary.
    pub fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            shm_id: self.block.os_id().to_string(),
            deadline: self.deadline,
            allow_retries: self.allow_retries,
            gather_payload: self.gather_payload.clone(),
        }
    }

    /// Reattaches a handle over the shared allocation named by `descriptor`.
    ///
    /// The returned handle observes and mutates the same schedule block as
    /// the originating process. It carries fresh (unattached) trigger and
    /// result futures: wiring those across the process boundary is the
    /// embedding transport's job.
    ///
    /// # Errors
    ///
    /// Fails with a shared memory error if the segment cannot be attached.
    pub fn from_descriptor(descriptor: &StepDescriptor) -> Result<Self> {
        let block = SharedScheduleBlock::attach(&descriptor.shm_id)?;
        let can_modify = !block.began_allreduce();
        Ok(Self {
            future: Promise::new(),
            block,
            trigger: None,
            can_modify: AtomicBool::new(can_modify),
            deadline: descriptor.deadline,
            allow_retries: descriptor.allow_retries,
            gather_payload: descriptor.gather_payload.clone(),
        })
    }
}

impl fmt::Debug for StepControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepControl")
            .field("shm_id", &self.block.os_id())
            .field("deadline", &self.deadline)
            .field("allow_retries", &self.allow_retries)
            .field("trigger_attached", &self.trigger.is_some())
            .field("done", &self.done())
            .finish()
    }
}

/// Serializable identity of a step: the shared block's OS id plus the
/// immutable parameters fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub shm_id: String,
    pub deadline: f64,
    pub allow_retries: bool,
    pub gather_payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_control(deadline_offset: f64) -> StepControl {
        let now = clock::now();
        StepControl::new(now + 1.0, now + deadline_offset, true, 1.0, vec![1, 2, 3]).unwrap()
    }

    #[test]
    fn test_initial_state() {
        let control = new_control(10.0);
        assert_eq!(control.stage().unwrap(), AveragingStage::Idle);
        assert!(!control.began_allreduce());
        assert!(control.can_modify());
        assert_eq!(control.weight(), 1.0);
        assert_eq!(control.gather_payload(), &[1, 2, 3]);
        assert!(control.allow_retries());
        assert!(!control.done());
    }

    #[test]
    fn test_invalid_weight_construction() {
        let now = clock::now();
        let err = StepControl::new(now, now + 10.0, false, -1.0, Vec::new()).unwrap_err();
        assert!(matches!(err, ControlError::Precondition { .. }));
    }

    #[test]
    fn test_weight_update_validation() {
        let control = new_control(10.0);
        control.set_weight(2.5).unwrap();
        assert_eq!(control.weight(), 2.5);

        let err = control.set_weight(f64::NAN).unwrap_err();
        assert!(matches!(err, ControlError::Precondition { .. }));
        assert_eq!(control.weight(), 2.5);
    }

    #[test]
    fn test_attach_trigger_twice() {
        let mut control = new_control(10.0);
        control.attach_trigger(Promise::new()).unwrap();

        let err = control.attach_trigger(Promise::new()).unwrap_err();
        assert!(matches!(err, ControlError::Precondition { .. }));
    }

    #[test]
    fn test_allow_allreduce_without_trigger() {
        let control = new_control(10.0);
        let err = control.allow_allreduce().unwrap_err();
        assert!(matches!(err, ControlError::Precondition { .. }));
    }

    #[tokio::test]
    async fn test_wait_without_trigger() {
        let control = new_control(10.0);
        let err = control.wait_for_trigger().await.unwrap_err();
        assert!(matches!(err, ControlError::Precondition { .. }));
    }

    #[tokio::test]
    async fn test_allow_allreduce_twice_and_late_waiter() {
        let mut control = new_control(10.0);
        control.attach_trigger(Promise::new()).unwrap();

        // resolving before any waiter exists, twice, must not raise
        control.allow_allreduce().unwrap();
        control.allow_allreduce().unwrap();

        // a late waiter resumes immediately
        control.wait_for_trigger().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_trigger_propagates_error() {
        let mut control = new_control(10.0);
        let trigger = Promise::new();
        control.attach_trigger(trigger.clone()).unwrap();

        trigger.fail(ControlError::shared_memory("trigger transport dropped"));

        let err = control.wait_for_trigger().await.unwrap_err();
        assert!(matches!(err, ControlError::SharedMemory { .. }));
    }

    #[test]
    fn test_running_allreduce_freezes_schedule() {
        let control = new_control(10.0);
        assert!(control.can_modify());

        control.set_stage(AveragingStage::RunningAllreduce);
        assert!(!control.can_modify());

        // the shared block stays writable: the write lands, a warning is the
        // only feedback
        control.set_began_allreduce(true);
        control.set_scheduled_time(clock::now() + 2.0);
        control.set_weight(4.0).unwrap();
        assert_eq!(control.weight(), 4.0);
    }

    #[test]
    fn test_began_allreduce_is_monotonic() {
        let control = new_control(10.0);
        control.set_began_allreduce(true);
        control.set_began_allreduce(false);
        assert!(control.began_allreduce());
    }

    #[test]
    fn test_schedule_past_deadline_warns_only() {
        let control = new_control(10.0);
        // at or past the deadline: the write must still succeed
        let past = control.deadline() + 5.0;
        control.set_scheduled_time(past);
        assert_eq!(control.scheduled_time(), past);
    }

    #[test]
    fn test_get_timeout_non_negative_and_non_increasing() {
        let control = new_control(2.0);
        let first = control.get_timeout();
        let second = control.get_timeout();
        assert!(first > 0.0 && first <= 2.0);
        assert!(second <= first);

        let expired = new_control(-5.0);
        assert_eq!(expired.get_timeout(), 0.0);
    }

    #[tokio::test]
    async fn test_cancel_propagates_and_is_idempotent() {
        let mut control = new_control(10.0);
        let trigger = Promise::new();
        control.attach_trigger(trigger.clone()).unwrap();

        assert!(control.cancel());
        assert!(trigger.done());
        assert!(control.done());

        // second call is a no-op, neither raises nor hangs
        assert!(!control.cancel());

        assert!(control.outcome().await.is_cancelled());
        assert!(matches!(
            control.wait_for_trigger().await,
            Err(ControlError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_complete_resolves_waiters() {
        let control = std::sync::Arc::new(new_control(10.0));
        let waiter = control.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        let group = GroupInfo {
            group_id: "g1".to_string(),
            peer_ids: vec!["a".to_string(), "b".to_string()],
            gathered: vec![vec![1], vec![2]],
        };
        assert!(control.complete(group.clone()));
        assert!(!control.complete(group.clone()));

        assert_eq!(task.await.unwrap().unwrap(), group);
    }

    #[test]
    fn test_descriptor_reattaches_same_block() {
        let control = new_control(10.0);
        let descriptor = control.descriptor();

        let remote = StepControl::from_descriptor(&descriptor).unwrap();
        assert_eq!(remote.deadline(), control.deadline());
        assert_eq!(remote.gather_payload(), control.gather_payload());

        remote.set_stage(AveragingStage::LookingForGroup);
        control.set_weight(0.5).unwrap();

        assert_eq!(control.stage().unwrap(), AveragingStage::LookingForGroup);
        assert_eq!(remote.weight(), 0.5);
    }

    #[test]
    fn test_descriptor_serde() {
        let control = new_control(10.0);
        let text = toml::to_string(&control.descriptor()).unwrap();
        let decoded: StepDescriptor = toml::from_str(&text).unwrap();
        assert_eq!(decoded.shm_id, control.descriptor().shm_id);

        let remote = StepControl::from_descriptor(&decoded).unwrap();
        remote.set_began_allreduce(true);
        assert!(control.began_allreduce());
    }
}
