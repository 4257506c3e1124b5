//! Error taxonomy shared by all roles.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::handoff::HandoffError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A process role in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Worker(usize),
    Aggregator,
    Scheduler,
    Orchestrator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Worker(i) => write!(f, "worker {i}"),
            Role::Aggregator => f.write_str("aggregator"),
            Role::Scheduler => f.write_str("scheduler"),
            Role::Orchestrator => f.write_str("orchestrator"),
        }
    }
}

/// The step of the protocol a role was executing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configure,
    Spawn,
    Generate,
    Send,
    Collect { worker: usize },
    ReceiveName,
    Attach,
    Populate,
    Detach,
    Signal,
    Create,
    Publish,
    AwaitPopulated,
    ReadBack,
    Report,
    Join,
    Destroy,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Configure => f.write_str("configure"),
            Phase::Spawn => f.write_str("spawn"),
            Phase::Generate => f.write_str("generate"),
            Phase::Send => f.write_str("send"),
            Phase::Collect { worker } => write!(f, "collect from worker {worker}"),
            Phase::ReceiveName => f.write_str("receive segment name"),
            Phase::Attach => f.write_str("attach"),
            Phase::Populate => f.write_str("populate"),
            Phase::Detach => f.write_str("detach"),
            Phase::Signal => f.write_str("signal completion"),
            Phase::Create => f.write_str("create segment"),
            Phase::Publish => f.write_str("publish segment name"),
            Phase::AwaitPopulated => f.write_str("await population"),
            Phase::ReadBack => f.write_str("read back"),
            Phase::Report => f.write_str("report result"),
            Phase::Join => f.write_str("join"),
            Phase::Destroy => f.write_str("destroy segment"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("truncated message: expected {expected} bytes, stream ended after {got}")]
    TruncatedMessage { expected: usize, got: usize },

    #[error("shared segment {name} does not exist")]
    SegmentNotFound { name: String },

    #[error("segment name is {len} bytes, the limit is {max}")]
    SegmentNameTooLong { len: usize, max: usize },

    #[error("invalid segment name {name:?}: {reason}")]
    InvalidSegmentName { name: String, reason: &'static str },

    #[error("{role} {}", exit_detail(.code, .signal))]
    ChildProcessFailed {
        role: Role,
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("shared segment {name} was already destroyed")]
    DoubleDestroy { name: String },

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },

    #[error("{what} closed by peer")]
    PeerClosed { what: &'static str },

    #[error("slot {index} is outside a segment of {slots} slots")]
    SlotOutOfBounds { index: usize, slots: usize },

    #[error("shared segment {name} is {found} bytes, expected {expected}")]
    SegmentSizeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{role} failed during {phase}: {source}")]
    Role {
        role: Role,
        phase: Phase,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Adapter for `map_err` on raw OS calls.
    pub fn io(context: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Io { context, source }
    }

    /// Tag an error with the role and phase it surfaced in.
    ///
    /// The innermost tag wins: an error that already carries a role is
    /// returned unchanged.
    pub fn during(self, role: Role, phase: Phase) -> Error {
        match self {
            tagged @ Error::Role { .. } => tagged,
            other => Error::Role {
                role,
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any role tags removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Role { source, .. } => source.root(),
            other => other,
        }
    }

    /// Process exit status a role reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            Error::TruncatedMessage { .. } => 2,
            Error::SegmentNotFound { .. } => 3,
            Error::SegmentNameTooLong { .. } | Error::InvalidSegmentName { .. } => 4,
            Error::DoubleDestroy { .. } | Error::Handoff(_) => 5,
            Error::Timeout { .. } => 6,
            Error::PeerClosed { .. } => 7,
            Error::ChildProcessFailed { .. } => 8,
            Error::InvalidConfig(_) => 9,
            _ => 1,
        }
    }
}

/// Reverse of [`Error::exit_code`], used to describe a failed child.
pub(crate) fn describe_exit_code(code: i32) -> &'static str {
    match code {
        0 => "success",
        2 => "truncated message",
        3 => "segment not found",
        4 => "bad segment name",
        5 => "segment lifecycle violation",
        6 => "timeout",
        7 => "peer closed",
        8 => "child process failed",
        9 => "invalid configuration",
        _ => "I/O error",
    }
}

fn exit_detail(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("exited with status {code} ({})", describe_exit_code(*code)),
        (None, Some(signal)) => format!("was killed by signal {signal}"),
        (None, None) => "exited abnormally".to_string(),
    }
}
