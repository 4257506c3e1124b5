//! Property harnesses for tiersort's pure components.
//!
//! These run against in-memory models only: no processes, no pipes, no
//! shared memory. The segment lifecycle ledger is checked against an
//! independent reference model, and the wire framing against its
//! canonical-form properties.

pub mod framing_model;
pub mod handoff_model;
