//! Idempotent schema reconciliation as a bounded polling state machine.
//!
//! ```text
//!            live ⊇ desired
//!   Check ──────────────────────▶ done
//!     │  update accepted     ▲  ▲
//!     ├────────▶ WaitingOnOwn ┘  │ (operation finished)
//!     │  SchemaConflict          │
//!     └────────▶ WaitingOnOther ─┘ (after one poll interval)
//! ```
//!
//! An update is only issued from `Check`, so the reconciler never starts a
//! second update while its own is pending. Every step spent in a waiting
//! state consumes one poll from [`PollPolicy::max_polls`]; running out
//! fails with [`PipelineError::SchemaConflict`].

use std::time::Duration;

use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::index::{IndexSchema, Operation, SearchIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    AlreadyCurrent,
    Updated,
}

#[derive(Debug)]
enum State {
    Check,
    WaitingOnOther,
    WaitingOnOwn(Operation),
}

pub struct SchemaReconciler<'a> {
    index: &'a dyn SearchIndex,
    policy: PollPolicy,
}

impl<'a> SchemaReconciler<'a> {
    pub fn new(index: &'a dyn SearchIndex, policy: PollPolicy) -> Self {
        Self { index, policy }
    }

    pub async fn reconcile(&self, desired: &IndexSchema) -> Result<ReconcileOutcome> {
        let mut state = State::Check;
        let mut polls = 0u32;
        let mut updated = false;

        loop {
            state = match state {
                State::Check => {
                    let live = self.index.get_schema().await?;
                    if live.is_some_and(|live| live.satisfies(desired)) {
                        return Ok(if updated {
                            ReconcileOutcome::Updated
                        } else {
                            ReconcileOutcome::AlreadyCurrent
                        });
                    }
                    match self.index.update_schema(desired).await {
                        Ok(op) => {
                            info!(operation = %op.name, "schema update issued");
                            updated = true;
                            State::WaitingOnOwn(op)
                        }
                        Err(PipelineError::SchemaConflict(message)) => {
                            debug!(%message, "schema update already in progress");
                            State::WaitingOnOther
                        }
                        Err(e) => return Err(e),
                    }
                }
                State::WaitingOnOther => {
                    self.spend_poll(&mut polls)?;
                    tokio::time::sleep(self.policy.interval).await;
                    State::Check
                }
                State::WaitingOnOwn(op) => {
                    self.spend_poll(&mut polls)?;
                    if op.done {
                        op.check()?;
                        State::Check
                    } else {
                        tokio::time::sleep(self.policy.interval).await;
                        State::WaitingOnOwn(self.index.get_operation(&op.name).await?)
                    }
                }
            };
        }
    }

    fn spend_poll(&self, polls: &mut u32) -> Result<()> {
        if *polls >= self.policy.max_polls {
            return Err(PipelineError::SchemaConflict(format!(
                "schema not reconciled after {} polls",
                self.policy.max_polls
            )));
        }
        *polls += 1;
        Ok(())
    }
}

/// Poll `op` until it finishes, within the same bound the reconciler uses.
pub async fn wait_for_operation(
    index: &dyn SearchIndex,
    mut op: Operation,
    policy: &PollPolicy,
) -> Result<Operation> {
    let mut polls = 0u32;
    while !op.done {
        if polls >= policy.max_polls {
            return Err(PipelineError::OperationFailed {
                name: op.name,
                message: format!("not finished after {} polls", policy.max_polls),
            });
        }
        polls += 1;
        tokio::time::sleep(policy.interval).await;
        op = index.get_operation(&op.name).await?;
    }
    op.check()?;
    Ok(op)
}
