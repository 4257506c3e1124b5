//! Reference model of the segment handoff ledger.
//!
//! The model keeps a history-style representation (how many protocol steps
//! have happened, which roles hold a mapping, how many destroys were
//! accepted) and derives its answers from that. [`execute_and_verify`]
//! drives the real [`Handoff`] and the model with the same operations and
//! requires identical answers, plus the lifecycle invariants below.
//!
//! Invariants:
//! - the segment is destroyed at most once
//! - nobody holds a mapping at the moment it is destroyed
//! - a read is accepted only after population and after the aggregator
//!   released its mapping
//! - the stage never moves backwards

use tiersort_core::{Handoff, HandoffError, HandoffStep, Role, Stage};

const STEPS: [HandoffStep; 5] = [
    HandoffStep::Create,
    HandoffStep::Publish,
    HandoffStep::Attach,
    HandoffStep::Populate,
    HandoffStep::Read,
];

const STAGES: [Stage; 6] = [
    Stage::Uncreated,
    Stage::Created,
    Stage::Published,
    Stage::Attached,
    Stage::Populated,
    Stage::Read,
];

/// One operation against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffOp {
    Record(HandoffStep),
    Release(Role),
    Destroy,
}

/// Independent model of [`Handoff`].
#[derive(Debug, Default)]
pub struct HandoffModel {
    /// Protocol steps accepted so far, in order.
    done: usize,
    holders: Vec<Role>,
    destroys: u32,
}

impl HandoffModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> Stage {
        STAGES[self.done]
    }

    pub fn holds(&self, role: Role) -> bool {
        self.holders.contains(&role)
    }

    pub fn destroys(&self) -> u32 {
        self.destroys
    }

    pub fn apply(&mut self, op: HandoffOp) -> Result<(), HandoffError> {
        match op {
            HandoffOp::Record(step) => self.record(step),
            HandoffOp::Release(role) => self.release(role),
            HandoffOp::Destroy => self.destroy(),
        }
    }

    fn record(&mut self, step: HandoffStep) -> Result<(), HandoffError> {
        if self.destroys > 0 {
            return Err(HandoffError::AfterDestroy { step });
        }
        let expected = STEPS.get(self.done).copied();
        if expected != Some(step) {
            return Err(HandoffError::OutOfOrder {
                step,
                stage: self.stage(),
            });
        }
        match step {
            HandoffStep::Create => self.holders.push(Role::Scheduler),
            HandoffStep::Attach => self.holders.push(Role::Aggregator),
            HandoffStep::Read if self.holds(Role::Aggregator) => {
                return Err(HandoffError::ReadBeforeRelease)
            }
            _ => {}
        }
        self.done += 1;
        Ok(())
    }

    fn release(&mut self, role: Role) -> Result<(), HandoffError> {
        match self.holders.iter().position(|&r| r == role) {
            Some(i) => {
                self.holders.remove(i);
                Ok(())
            }
            None => Err(HandoffError::NotHeld { role }),
        }
    }

    fn destroy(&mut self) -> Result<(), HandoffError> {
        if self.destroys > 0 {
            return Err(HandoffError::DoubleDestroy);
        }
        if self.done == 0 {
            return Err(HandoffError::NeverCreated);
        }
        // The real ledger reports the aggregator first when both hold.
        for role in [Role::Aggregator, Role::Scheduler] {
            if self.holds(role) {
                return Err(HandoffError::DestroyBeforeDetach { holder: role });
            }
        }
        self.destroys += 1;
        Ok(())
    }
}

/// Run `ops` against both the real ledger and the model.
pub fn execute_and_verify(ops: &[HandoffOp]) -> Result<(), String> {
    let mut real = Handoff::new();
    let mut model = HandoffModel::new();

    for (i, &op) in ops.iter().enumerate() {
        let stage_before = real.stage();
        let populated_before = stage_before >= Stage::Populated;
        let aggregator_held_before = real.holders().contains(&Role::Aggregator);
        let holders_before = real.holders();

        let got = match op {
            HandoffOp::Record(step) => real.record(step).map(|_| ()),
            HandoffOp::Release(role) => real.release(role),
            HandoffOp::Destroy => real.destroy(),
        };
        let want = model.apply(op);

        if got != want {
            return Err(format!(
                "op {}: {:?} gave {:?}, model expected {:?}",
                i, op, got, want
            ));
        }

        // INVARIANT: stage never moves backwards
        if real.stage() < stage_before {
            return Err(format!(
                "op {}: stage went backwards {:?} -> {:?}",
                i,
                stage_before,
                real.stage()
            ));
        }
        if real.stage() != model.stage() {
            return Err(format!(
                "op {}: stage {:?}, model {:?}",
                i,
                real.stage(),
                model.stage()
            ));
        }

        match (op, &got) {
            // INVARIANT: destroy happens once, with no holders
            (HandoffOp::Destroy, Ok(())) => {
                if !holders_before.is_empty() {
                    return Err(format!(
                        "op {}: destroy accepted while {:?} attached",
                        i, holders_before
                    ));
                }
                if model.destroys() != 1 {
                    return Err(format!("op {}: destroy accepted twice", i));
                }
            }
            // INVARIANT: read only after population and aggregator release
            (HandoffOp::Record(HandoffStep::Read), Ok(())) => {
                if !populated_before || aggregator_held_before {
                    return Err(format!(
                        "op {}: read accepted at {:?} with aggregator held = {}",
                        i, stage_before, aggregator_held_before
                    ));
                }
            }
            _ => {}
        }

        if real.is_destroyed() != (model.destroys() == 1) {
            return Err(format!("op {}: destroyed flag diverged from model", i));
        }
        for role in [Role::Aggregator, Role::Scheduler] {
            if real.holders().contains(&role) != model.holds(role) {
                return Err(format!("op {}: holder {} diverged from model", i, role));
            }
        }
    }

    Ok(())
}

/// The sequence a successful run produces, in the orchestrator's view.
pub fn complete_run() -> Vec<HandoffOp> {
    vec![
        HandoffOp::Record(HandoffStep::Create),
        HandoffOp::Record(HandoffStep::Publish),
        HandoffOp::Record(HandoffStep::Attach),
        HandoffOp::Record(HandoffStep::Populate),
        HandoffOp::Release(Role::Aggregator),
        HandoffOp::Record(HandoffStep::Read),
        HandoffOp::Release(Role::Scheduler),
        HandoffOp::Destroy,
    ]
}
