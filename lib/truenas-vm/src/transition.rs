// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives a VM's power state toward a desired state.
//!
//! A reconciliation pass samples the VM's state and, if it differs from the
//! desired state, dispatches the operation (or short sequence of operations)
//! that moves between the two, then polls until the VM reports the desired
//! state. Dispatch-and-poll is attempted a bounded number of times with a
//! fixed backoff between attempts.
//!
//! Power operations against a live hypervisor are best-effort. Other than a
//! malformed desired state, which is rejected before any request is made,
//! nothing here fails the caller: failures to converge are reported as
//! [`Warning`]s and the VM is left in whatever state it reached.
//!
//! The engine does no locking of its own. Two passes racing against the same
//! VM, whether in this process or another, will interleave their operations
//! in undefined ways, and only the middleware's own serialization of VM jobs
//! stands between them. Callers must not run concurrent passes against one
//! VM.

use std::sync::Arc;
use std::time::Duration;

use slog::{debug, info, o, warn, Logger};
use thiserror::Error;
use truenas_client::api::PowerAction;
use truenas_client::{Gateway, TrueNasApi};

use crate::clock::{Clock, TokioClock};
use crate::state::{InvalidDesiredState, PowerState, TransitionRequest};
use crate::status::{StatusError, StatusReader};
use crate::Warning;

/// Timing and retry bounds for a reconciliation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionPolicy {
    /// Dispatch-and-poll attempts before giving up.
    pub max_attempts: u32,

    /// Pause before every attempt after the first.
    pub retry_delay: Duration,

    /// Pause between the steps of a multi-step transition, and before
    /// falling back from a graceful stop to a power-off.
    pub settle_delay: Duration,

    /// Interval between state samples while waiting to converge.
    pub poll_interval: Duration,

    /// How long one attempt waits to observe the desired state.
    pub poll_timeout: Duration,
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// The operation sequence that moves a VM between two power states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// `start`
    Start,
    /// `resume`
    Resume,
    /// `stop`, falling back to `poweroff` if the graceful stop is refused.
    Shutdown,
    /// `resume`, then a [`Transition::Shutdown`].
    ResumeThenShutdown,
    /// `suspend`
    Suspend,
    /// `start`, then `suspend`.
    StartThenSuspend,
}

impl Transition {
    /// Returns the transition from `current` to `desired`, or `None` if
    /// there is no direct way between them (including `current ==
    /// desired`).
    pub fn between(current: PowerState, desired: PowerState) -> Option<Self> {
        use PowerState::*;
        match (current, desired) {
            (Stopped, Running) => Some(Self::Start),
            (Suspended, Running) => Some(Self::Resume),
            (Running, Stopped) => Some(Self::Shutdown),
            (Suspended, Stopped) => Some(Self::ResumeThenShutdown),
            (Running, Suspended) => Some(Self::Suspend),
            (Stopped, Suspended) => Some(Self::StartThenSuspend),
            _ => None,
        }
    }
}

/// Why a single dispatch-and-poll attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("{action} failed: {source}")]
    Dispatch {
        action: PowerAction,
        #[source]
        source: truenas_client::Error,
    },

    #[error("timeout waiting for VM to reach {0} state")]
    Timeout(PowerState),
}

/// How a reconciliation pass ended.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The VM was already in the desired state; nothing was dispatched.
    AlreadyInState,

    /// The desired state was observed during the given (1-based) attempt.
    Converged { attempts: u32 },

    /// The pass stopped early without trying every attempt; see the
    /// report's warnings.
    Abandoned,

    /// Every attempt failed. The VM is left as it is.
    Exhausted { attempts: u32, last_error: Option<AttemptError> },
}

#[derive(Debug)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub warnings: Vec<Warning>,
}

impl ReconcileReport {
    fn new(outcome: ReconcileOutcome) -> Self {
        Self { outcome, warnings: Vec::new() }
    }

    fn with_warning(mut self, warning: Warning) -> Self {
        self.warnings.push(warning);
        self
    }

    /// Whether the VM is known to be in the desired state.
    pub fn is_converged(&self) -> bool {
        matches!(
            self.outcome,
            ReconcileOutcome::AlreadyInState
                | ReconcileOutcome::Converged { .. }
        )
    }
}

/// Reconciles VM power states.
pub struct TransitionEngine {
    gateway: Arc<dyn Gateway>,
    reader: StatusReader,
    clock: Arc<dyn Clock>,
    policy: TransitionPolicy,
    log: Logger,
}

impl TransitionEngine {
    pub fn new(gateway: Arc<dyn Gateway>, log: Logger) -> Self {
        Self {
            reader: StatusReader::new(gateway.clone()),
            gateway,
            clock: Arc::new(TokioClock),
            policy: TransitionPolicy::default(),
            log,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validates `desired` and drives `vm_id` toward it.
    ///
    /// Only an invalid desired state is an error, and in that case no
    /// request is sent.
    pub async fn reconcile(
        &self,
        vm_id: u64,
        desired: &str,
    ) -> Result<ReconcileReport, InvalidDesiredState> {
        let request = TransitionRequest::new(vm_id, desired)?;
        Ok(self.apply(&request).await)
    }

    /// Drives the VM named by `request` toward its desired state.
    pub async fn apply(&self, request: &TransitionRequest) -> ReconcileReport {
        let TransitionRequest { vm_id, desired } = *request;
        let log = self
            .log
            .new(o!("vm_id" => vm_id, "desired" => desired.to_string()));

        let current = match self.reader.current_state(vm_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(log, "unable to check current VM state"; "error" => %e);
                return ReconcileReport::new(ReconcileOutcome::Abandoned)
                    .with_warning(Warning::new(
                        "VM State Check Warning",
                        format!("Unable to check current VM state: {}", e),
                    ));
            }
        };

        if current == desired {
            debug!(log, "VM already in desired state");
            return ReconcileReport::new(ReconcileOutcome::AlreadyInState);
        }

        info!(log, "reconciling VM power state"; "current" => %current);

        let mut last_error = None;
        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                self.clock.sleep(self.policy.retry_delay).await;
            }

            // The state may have moved since the last sample, either from a
            // previous attempt that converged late or from another actor.
            let current = match self.reader.current_state(vm_id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(log, "state check failed"; "attempt" => attempt,
                          "error" => %e);
                    last_error = Some(AttemptError::from(e));
                    continue;
                }
            };
            if current == desired {
                info!(log, "VM reached desired state"; "attempt" => attempt);
                return ReconcileReport::new(ReconcileOutcome::Converged {
                    attempts: attempt,
                });
            }

            let Some(transition) = Transition::between(current, desired) else {
                warn!(log, "unsupported state transition";
                      "current" => %current);
                return ReconcileReport::new(ReconcileOutcome::Abandoned)
                    .with_warning(Warning::new(
                        "Unsupported State Transition",
                        format!(
                            "Cannot transition from {} to {}",
                            current, desired
                        ),
                    ));
            };

            info!(log, "dispatching transition";
                  "attempt" => attempt,
                  "current" => %current,
                  "transition" => ?transition);
            let dispatched = self.dispatch(&log, vm_id, transition).await;
            if let Err(e) = &dispatched {
                // The operation may still have taken effect (e.g. the
                // response was lost), so poll regardless.
                warn!(log, "transition dispatch failed"; "error" => %e);
            }

            match self.await_state(&log, vm_id, desired).await {
                Ok(()) => {
                    info!(log, "VM reached desired state";
                          "attempt" => attempt);
                    return ReconcileReport::new(
                        ReconcileOutcome::Converged { attempts: attempt },
                    );
                }
                Err(timeout) => {
                    warn!(log, "VM did not converge"; "attempt" => attempt);
                    last_error = Some(dispatched.err().unwrap_or(timeout));
                }
            }
        }

        let attempts = self.policy.max_attempts;
        let reason = last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "no attempts were made".to_string());
        warn!(log, "giving up on VM state transition";
              "attempts" => attempts, "error" => &reason);
        ReconcileReport::new(ReconcileOutcome::Exhausted {
            attempts,
            last_error,
        })
        .with_warning(Warning::new(
            "VM State Transition Warning",
            format!(
                "Unable to transition VM to {} state after {} attempts: {}. \
                 You may need to manually manage the VM state.",
                desired, attempts, reason
            ),
        ))
    }

    /// Issues the operations for one transition. Multi-step transitions stop
    /// at the first failing step.
    async fn dispatch(
        &self,
        log: &Logger,
        vm_id: u64,
        transition: Transition,
    ) -> Result<(), AttemptError> {
        match transition {
            Transition::Start => {
                self.invoke(log, vm_id, PowerAction::Start).await
            }
            Transition::Resume => {
                self.invoke(log, vm_id, PowerAction::Resume).await
            }
            Transition::Shutdown => self.shutdown(log, vm_id).await,
            Transition::ResumeThenShutdown => {
                self.invoke(log, vm_id, PowerAction::Resume).await?;
                self.clock.sleep(self.policy.settle_delay).await;
                self.shutdown(log, vm_id).await
            }
            Transition::Suspend => {
                self.invoke(log, vm_id, PowerAction::Suspend).await
            }
            Transition::StartThenSuspend => {
                self.invoke(log, vm_id, PowerAction::Start).await?;
                self.clock.sleep(self.policy.settle_delay).await;
                self.invoke(log, vm_id, PowerAction::Suspend).await
            }
        }
    }

    /// Graceful stop, then a forced power-off if the stop is refused.
    async fn shutdown(
        &self,
        log: &Logger,
        vm_id: u64,
    ) -> Result<(), AttemptError> {
        if let Err(e) = self.invoke(log, vm_id, PowerAction::Stop).await {
            warn!(log, "graceful stop failed, forcing power-off";
                  "error" => %e);
            self.clock.sleep(self.policy.settle_delay).await;
            return self.invoke(log, vm_id, PowerAction::PowerOff).await;
        }
        Ok(())
    }

    async fn invoke(
        &self,
        log: &Logger,
        vm_id: u64,
        action: PowerAction,
    ) -> Result<(), AttemptError> {
        debug!(log, "issuing power operation"; "action" => %action);
        self.gateway
            .vm_power(vm_id, action)
            .await
            .map_err(|source| AttemptError::Dispatch { action, source })
    }

    /// Polls until the VM reports `desired` or the poll window closes.
    /// Failed samples are skipped.
    async fn await_state(
        &self,
        log: &Logger,
        vm_id: u64,
        desired: PowerState,
    ) -> Result<(), AttemptError> {
        let start = self.clock.now();
        while self.clock.now().duration_since(start) < self.policy.poll_timeout
        {
            self.clock.sleep(self.policy.poll_interval).await;

            match self.reader.current_state(vm_id).await {
                Ok(state) if state == desired => return Ok(()),
                Ok(state) => {
                    debug!(log, "waiting for VM state"; "current" => %state)
                }
                Err(e) => debug!(log, "state poll failed"; "error" => %e),
            }
        }

        Err(AttemptError::Timeout(desired))
    }
}
