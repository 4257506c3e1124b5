//! Segment handoff ledger.
//!
//! A [`Handoff`] is one process's record of where the shared segment is in
//! its lifecycle:
//!
//! ```text
//!   Uncreated -> Created -> Published -> Attached -> Populated -> Read
//!                (sched)                  (aggr)       (aggr)     (sched)
//! ```
//!
//! Alongside the linear stage it tracks which roles still hold a mapping.
//! `Create` makes the scheduler a holder, `Attach` makes the aggregator one,
//! and [`Handoff::release`] drops a holder when its mapping is gone (an
//! explicit detach, or the holding process having exited). Destruction is
//! only accepted once nobody holds the segment, and only once.

use crate::error::Role;

/// Lifecycle stage of the shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Uncreated,
    Created,
    Published,
    Attached,
    Populated,
    Read,
}

/// One forward step of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffStep {
    /// Scheduler created and mapped the segment.
    Create,
    /// Scheduler sent the name over the control channel.
    Publish,
    /// Aggregator mapped the segment.
    Attach,
    /// Aggregator wrote every slot.
    Populate,
    /// Scheduler read every slot back.
    Read,
}

impl HandoffStep {
    fn from_stage(self) -> Stage {
        match self {
            HandoffStep::Create => Stage::Uncreated,
            HandoffStep::Publish => Stage::Created,
            HandoffStep::Attach => Stage::Published,
            HandoffStep::Populate => Stage::Attached,
            HandoffStep::Read => Stage::Populated,
        }
    }

    fn to_stage(self) -> Stage {
        match self {
            HandoffStep::Create => Stage::Created,
            HandoffStep::Publish => Stage::Published,
            HandoffStep::Attach => Stage::Attached,
            HandoffStep::Populate => Stage::Populated,
            HandoffStep::Read => Stage::Read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandoffError {
    #[error("handoff step {step:?} is not allowed at stage {stage:?}")]
    OutOfOrder { step: HandoffStep, stage: Stage },

    #[error("handoff step {step:?} after the segment was destroyed")]
    AfterDestroy { step: HandoffStep },

    #[error("read attempted while the aggregator still holds the segment")]
    ReadBeforeRelease,

    #[error("destroy attempted while {holder} is still attached")]
    DestroyBeforeDetach { holder: Role },

    #[error("segment destroyed twice")]
    DoubleDestroy,

    #[error("destroy attempted before the segment was created")]
    NeverCreated,

    #[error("{role} released a segment it does not hold")]
    NotHeld { role: Role },
}

#[derive(Debug, Clone)]
pub struct Handoff {
    stage: Stage,
    aggregator_attached: bool,
    scheduler_attached: bool,
    destroyed: bool,
}

impl Default for Handoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Handoff {
    pub fn new() -> Self {
        Self {
            stage: Stage::Uncreated,
            aggregator_attached: false,
            scheduler_attached: false,
            destroyed: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Roles that still hold a mapping.
    pub fn holders(&self) -> Vec<Role> {
        let mut holders = Vec::new();
        if self.aggregator_attached {
            holders.push(Role::Aggregator);
        }
        if self.scheduler_attached {
            holders.push(Role::Scheduler);
        }
        holders
    }

    /// Advance by one step.
    pub fn record(&mut self, step: HandoffStep) -> Result<Stage, HandoffError> {
        if self.destroyed {
            return Err(HandoffError::AfterDestroy { step });
        }
        if self.stage != step.from_stage() {
            return Err(HandoffError::OutOfOrder {
                step,
                stage: self.stage,
            });
        }
        match step {
            HandoffStep::Create => self.scheduler_attached = true,
            HandoffStep::Attach => self.aggregator_attached = true,
            HandoffStep::Read if self.aggregator_attached => {
                return Err(HandoffError::ReadBeforeRelease)
            }
            _ => {}
        }
        self.stage = step.to_stage();
        Ok(self.stage)
    }

    /// Drop `role`'s mapping.
    pub fn release(&mut self, role: Role) -> Result<(), HandoffError> {
        let held = match role {
            Role::Aggregator => &mut self.aggregator_attached,
            Role::Scheduler => &mut self.scheduler_attached,
            Role::Worker(_) | Role::Orchestrator => return Err(HandoffError::NotHeld { role }),
        };
        if !*held {
            return Err(HandoffError::NotHeld { role });
        }
        *held = false;
        Ok(())
    }

    /// Accept the single destroy of the segment.
    pub fn destroy(&mut self) -> Result<(), HandoffError> {
        if self.destroyed {
            return Err(HandoffError::DoubleDestroy);
        }
        if self.stage == Stage::Uncreated {
            return Err(HandoffError::NeverCreated);
        }
        if let Some(&holder) = self.holders().first() {
            return Err(HandoffError::DestroyBeforeDetach { holder });
        }
        self.destroyed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> Handoff {
        let mut h = Handoff::new();
        for step in [
            HandoffStep::Create,
            HandoffStep::Publish,
            HandoffStep::Attach,
            HandoffStep::Populate,
        ] {
            h.record(step).unwrap();
        }
        h
    }

    #[test]
    fn test_full_protocol() {
        let mut h = populated();
        h.release(Role::Aggregator).unwrap();
        assert_eq!(h.record(HandoffStep::Read).unwrap(), Stage::Read);
        h.release(Role::Scheduler).unwrap();
        h.destroy().unwrap();
        assert!(h.is_destroyed());
    }

    #[test]
    fn test_attach_before_publish_is_rejected() {
        let mut h = Handoff::new();
        h.record(HandoffStep::Create).unwrap();
        assert_eq!(
            h.record(HandoffStep::Attach),
            Err(HandoffError::OutOfOrder {
                step: HandoffStep::Attach,
                stage: Stage::Created
            })
        );
    }

    #[test]
    fn test_read_while_aggregator_attached_is_rejected() {
        let mut h = populated();
        assert_eq!(
            h.record(HandoffStep::Read),
            Err(HandoffError::ReadBeforeRelease)
        );
        assert_eq!(h.stage(), Stage::Populated);
    }

    #[test]
    fn test_destroy_before_detach_is_rejected() {
        let mut h = populated();
        assert_eq!(
            h.destroy(),
            Err(HandoffError::DestroyBeforeDetach {
                holder: Role::Aggregator
            })
        );
        h.release(Role::Aggregator).unwrap();
        assert_eq!(
            h.destroy(),
            Err(HandoffError::DestroyBeforeDetach {
                holder: Role::Scheduler
            })
        );
        assert!(!h.is_destroyed());
    }

    #[test]
    fn test_double_destroy_is_rejected() {
        let mut h = populated();
        h.release(Role::Aggregator).unwrap();
        h.release(Role::Scheduler).unwrap();
        h.destroy().unwrap();
        assert_eq!(h.destroy(), Err(HandoffError::DoubleDestroy));
        assert_eq!(
            h.record(HandoffStep::Read),
            Err(HandoffError::AfterDestroy {
                step: HandoffStep::Read
            })
        );
    }

    #[test]
    fn test_destroy_after_abandoned_handoff() {
        // Scheduler exited right after publishing; nobody else attached.
        let mut h = Handoff::new();
        h.record(HandoffStep::Create).unwrap();
        h.record(HandoffStep::Publish).unwrap();
        h.release(Role::Scheduler).unwrap();
        h.destroy().unwrap();
    }

    #[test]
    fn test_never_created_and_not_held() {
        let mut h = Handoff::new();
        assert_eq!(h.destroy(), Err(HandoffError::NeverCreated));
        assert_eq!(
            h.release(Role::Aggregator),
            Err(HandoffError::NotHeld {
                role: Role::Aggregator
            })
        );
        assert_eq!(
            h.release(Role::Worker(0)),
            Err(HandoffError::NotHeld {
                role: Role::Worker(0)
            })
        );
    }
}
