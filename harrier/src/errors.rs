use std::fmt;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::precondition::{PreconditionKind, Requirement, UserSelector};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("required binary `{0}` not available to context")]
    MissingBin(String),
    #[error("missing required env var: {0}")]
    MissingEnv(String),

    #[error("{0}")]
    IO(io::Error),

    #[error("invalid env var {0} ({1})")]
    InvalidEnv(String, String),

    #[error("command failed with status {0}: {1}")]
    CommandError(i32, String),

    #[error("command `{0}` timed out after {1}s")]
    CommandTimeout(String, u64),

    #[error("failed to get basedirs")]
    NoBaseDirs,

    #[error("no adb device connected")]
    NoAdbDevice,
    #[error("adb device {0} not found")]
    AdbDeviceNotFound(String),
    #[error("adb disabled by configuration file")]
    AdbDisabled,

    #[error("generic error: {0}")]
    Generic(String),

    #[error("invalid config {0}: {1}")]
    InvalidConfig(String, String),

    #[error("file {0} doesn't exist")]
    MissingFile(String),

    #[error("path {0} is not valid UTF-8")]
    InvalidPath(String),

    #[error("no handler registered for precondition kind {0}")]
    UnknownPrecondition(PreconditionKind),

    #[error("precondition kind {0} is already registered")]
    DuplicateKind(PreconditionKind),

    #[error("precondition kind {0} cannot be required {1}")]
    UnsupportedRequirement(PreconditionKind, Requirement),

    #[error("cyclic precondition dependencies: {}", .0.join(" -> "))]
    CyclicPrecondition(Vec<String>),

    #[error("contradictory preconditions for {kind} on {target}: {reason}")]
    ContradictoryPrecondition {
        kind: PreconditionKind,
        target: UserSelector,
        reason: String,
    },

    #[error("precondition depends on undeclared id `{0}`")]
    UnknownDependency(String),

    #[error("no test app matches query {0}")]
    NoMatchingTestApp(String),

    #[error("transient failure during `{operation}`: {message}")]
    TransientProvisioning { operation: String, message: String },

    #[error("failure during `{operation}`: {message}")]
    FatalProvisioning { operation: String, message: String },

    #[error("failed to apply {kind} for {target}: {source}")]
    SetupFailed {
        kind: PreconditionKind,
        target: UserSelector,
        #[source]
        source: Box<Error>,
        unwind_failures: Vec<UndoFailure>,
        /// The failing request asked for the test to be skipped instead
        skip: bool,
    },

    #[error("teardown failed: {}", UndoFailures(.0))]
    Teardown(Vec<UndoFailure>),

    #[error("test skipped: {0}")]
    Skipped(String),

    #[error("test app catalog restored without a snapshot")]
    CatalogNotSnapshotted,

    #[error("invalid test app index: {0}")]
    InvalidIndex(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("no {0} user on device")]
    NoSuchUser(UserSelector),
}

/// A single failed undo, collected during teardown or during the unwind of a
/// failed setup.
#[derive(Debug)]
pub struct UndoFailure {
    pub kind: PreconditionKind,
    pub target: UserSelector,
    pub action: String,
    pub error: Error,
}

impl fmt::Display for UndoFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "undo of {} ({} on {}) failed: {}",
            self.action, self.kind, self.target, self.error
        )
    }
}

struct UndoFailures<'a>(&'a [UndoFailure]);

impl fmt::Display for UndoFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, it) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", it)?;
        }
        Ok(())
    }
}

impl Error {
    pub fn new_generic<S: ToString + ?Sized>(s: &S) -> Self {
        Self::Generic(s.to_string())
    }

    pub fn new_cfg<S: ToString + ?Sized>(path: &Path, s: &S) -> Self {
        Self::InvalidConfig(path.to_string_lossy().into_owned(), s.to_string())
    }

    pub fn new_plan<S: ToString + ?Sized>(s: &S) -> Self {
        Self::InvalidPlan(s.to_string())
    }

    /// Whether retrying the operation that produced this error may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientProvisioning { .. })
    }

    /// Whether this error should turn into a skipped test rather than a
    /// failure
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped(_) | Self::SetupFailed { skip: true, .. })
    }

    /// Undo failures hidden inside this error, if any
    pub fn undo_failures(&self) -> &[UndoFailure] {
        match self {
            Self::SetupFailed {
                unwind_failures, ..
            } => unwind_failures,
            Self::Teardown(failures) => failures,
            _ => &[],
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(value: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Generic(value.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::IO(err)
    }
}

impl From<protobuf::Error> for Error {
    fn from(err: protobuf::Error) -> Self {
        Self::InvalidIndex(err.to_string())
    }
}
