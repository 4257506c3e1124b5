//! tiersort-core: types shared by every tiersort process role.
//!
//! This crate has no OS dependencies. It defines what travels between the
//! roles and the rules for when it may travel:
//!
//! - [`Value`] and the fixed-width framing used on worker channels
//! - [`SegmentName`] / [`RunId`] and the 128-byte control frame
//! - [`Error`], the single error taxonomy, with per-role exit codes
//! - [`PipelineConfig`], threaded explicitly into every role
//! - [`Handoff`], the ledger that enforces the segment lifecycle order
//!
//! # Wire formats
//!
//! ```text
//! worker -> aggregator    [u32 LE]                      4 bytes, no header
//! scheduler -> aggregator [name bytes][NUL padding]     128 bytes
//! shared segment          [slot 0][slot 1]...[slot N-1] N * 4 bytes, LE
//! scheduler -> orchestr.  [u32 LE] * N                  sorted result
//! ```

mod config;
mod error;
mod handoff;
mod name;
mod value;

pub use config::{
    DestroyAuthority, Fault, PipelineConfig, ValuePlan, DEFAULT_IO_TIMEOUT, DEFAULT_WORKERS,
    MAX_WORKERS,
};
pub use error::{Error, Phase, Result, Role};
pub use handoff::{Handoff, HandoffError, HandoffStep, Stage};
pub use name::{
    decode_segment_name, encode_segment_name, RunId, SegmentName, MAX_SEGMENT_NAME_LEN,
    SEGMENT_NAME_PREFIX,
};
pub use value::{decode_value, Value, VALUE_BOUND, VALUE_WIDTH};
