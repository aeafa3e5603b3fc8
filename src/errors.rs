//! Error taxonomy for the orchestrator.
//!
//! Mirrors the seven error kinds of the run lifecycle (configuration,
//! connection, protocol, runner-exit, per-entity, timeout/cancellation,
//! termination) with a numbered code per kind so failures are diagnosable
//! from logs and reporter payloads alone.

use std::fmt;

/// A numbered, banded error code: `{kind}xxx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const INVALID_SHARD_RANGE: ErrorCode = ErrorCode(1001);
    pub const UNKNOWN_BUNDLE: ErrorCode = ErrorCode(1002);
    pub const MALFORMED_ARTIFACT_URL: ErrorCode = ErrorCode(1003);
    pub const BAD_VAR_ASSIGNMENT: ErrorCode = ErrorCode(1004);

    pub const SSH_DIAL_FAILED: ErrorCode = ErrorCode(2001);
    pub const SSH_RECONNECT_FAILED: ErrorCode = ErrorCode(2002);
    pub const WIRING_RPC_FAILED: ErrorCode = ErrorCode(2003);

    pub const MISSING_RUN_START: ErrorCode = ErrorCode(3001);
    pub const DUPLICATE_RUN_START: ErrorCode = ErrorCode(3002);
    pub const UNMATCHED_ENTITY_ERROR: ErrorCode = ErrorCode(3003);
    pub const UNKNOWN_MESSAGE_KIND: ErrorCode = ErrorCode(3004);
    pub const MISSING_RUN_END: ErrorCode = ErrorCode(3005);

    pub const NON_ZERO_EXIT: ErrorCode = ErrorCode(4001);
    pub const RUNNER_SPAWN_FAILED: ErrorCode = ErrorCode(4002);

    pub const ENTITY_REPORTED_ERROR: ErrorCode = ErrorCode(5001);

    pub const MESSAGE_READ_TIMEOUT: ErrorCode = ErrorCode(6001);
    pub const RUNNER_WAIT_TIMEOUT: ErrorCode = ErrorCode(6002);
    pub const CANCELLED: ErrorCode = ErrorCode(6003);

    pub const REPORTER_TERMINATED: ErrorCode = ErrorCode(7001);
    pub const MAX_FAILURES_REACHED: ErrorCode = ErrorCode(7002);

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Configuration,
            2 => ErrorCategory::Connection,
            3 => ErrorCategory::Protocol,
            4 => ErrorCategory::RunnerExit,
            5 => ErrorCategory::PerEntity,
            6 => ErrorCategory::TimeoutCancellation,
            7 => ErrorCategory::Termination,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Protocol,
    RunnerExit,
    PerEntity,
    TimeoutCancellation,
    Termination,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::RunnerExit => "runner-exit",
            ErrorCategory::PerEntity => "per-entity",
            ErrorCategory::TimeoutCancellation => "timeout-cancellation",
            ErrorCategory::Termination => "termination",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Configuration errors (kind 1). Fatal before connect; `FailedBeforeRun=true`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("shard index {index} out of range for total_shards {total}")]
    InvalidShardRange { index: u32, total: u32 },
    #[error("unknown bundle {bundle:?} and no workspace given")]
    UnknownBundle { bundle: String },
    #[error("artifact url {url:?} is malformed: {reason}")]
    MalformedArtifactUrl { url: String, reason: String },
    #[error("invalid --var assignment {raw:?}, expected name=value")]
    BadVarAssignment { raw: String },
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConfigError::InvalidShardRange { .. } => ErrorCode::INVALID_SHARD_RANGE,
            ConfigError::UnknownBundle { .. } => ErrorCode::UNKNOWN_BUNDLE,
            ConfigError::MalformedArtifactUrl { .. } => ErrorCode::MALFORMED_ARTIFACT_URL,
            ConfigError::BadVarAssignment { .. } => ErrorCode::BAD_VAR_ASSIGNMENT,
        }
    }
}

/// Connection errors (kind 2). Fatal unless a run is already in progress.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("ssh dial to {target} failed: {reason}")]
    DialFailed { target: String, reason: String },
    #[error("ssh reconnect to {target} failed after {attempts} attempts: {reason}")]
    ReconnectFailed {
        target: String,
        attempts: u32,
        reason: String,
    },
    #[error("wiring service rpc {rpc} failed: {reason}")]
    WiringRpcFailed { rpc: String, reason: String },
}

impl ConnectionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConnectionError::DialFailed { .. } => ErrorCode::SSH_DIAL_FAILED,
            ConnectionError::ReconnectFailed { .. } => ErrorCode::SSH_RECONNECT_FAILED,
            ConnectionError::WiringRpcFailed { .. } => ErrorCode::WIRING_RPC_FAILED,
        }
    }
}

/// Protocol errors (kind 3). Fatal for the current invocation; may be
/// retried by the retry loop if `unstarted` is returned.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("control stream did not start with RunStart")]
    MissingRunStart,
    #[error("duplicate RunStart received")]
    DuplicateRunStart,
    #[error("EntityError for {name:?} has no matching EntityStart")]
    UnmatchedEntityError { name: String },
    #[error("unknown control message kind {kind:?}")]
    UnknownMessageKind { kind: String },
    #[error("control stream ended without RunEnd")]
    MissingRunEnd,
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::MissingRunStart => ErrorCode::MISSING_RUN_START,
            ProtocolError::DuplicateRunStart => ErrorCode::DUPLICATE_RUN_START,
            ProtocolError::UnmatchedEntityError { .. } => ErrorCode::UNMATCHED_ENTITY_ERROR,
            ProtocolError::UnknownMessageKind { .. } => ErrorCode::UNKNOWN_MESSAGE_KIND,
            ProtocolError::MissingRunEnd => ErrorCode::MISSING_RUN_END,
        }
    }
}

/// Runner-exit errors (kind 4).
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("runner exited with status {status}: {first_stderr_line}")]
    NonZeroExit {
        status: i32,
        first_stderr_line: String,
    },
    #[error("failed to spawn runner command: {reason}")]
    SpawnFailed { reason: String },
}

impl RunnerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RunnerError::NonZeroExit { .. } => ErrorCode::NON_ZERO_EXIT,
            RunnerError::SpawnFailed { .. } => ErrorCode::RUNNER_SPAWN_FAILED,
        }
    }
}

/// Timeout/cancellation errors (kind 6). Fatal for the invocation.
#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("timed out waiting {secs}s for the next control message")]
    MessageRead { secs: u64 },
    #[error("timed out waiting {secs}s for the runner process to exit")]
    RunnerWait { secs: u64 },
    #[error("run cancelled")]
    Cancelled,
}

impl TimeoutError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TimeoutError::MessageRead { .. } => ErrorCode::MESSAGE_READ_TIMEOUT,
            TimeoutError::RunnerWait { .. } => ErrorCode::RUNNER_WAIT_TIMEOUT,
            TimeoutError::Cancelled => ErrorCode::CANCELLED,
        }
    }
}

/// Termination signals (kind 7). The caller treats these as a clean but
/// unsuccessful exit, never as a crash.
#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("reporter requested termination")]
    ReporterTerminated,
    #[error("max test failures ({limit}) reached")]
    MaxFailuresReached { limit: u32 },
}

impl TerminateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TerminateError::ReporterTerminated => ErrorCode::REPORTER_TERMINATED,
            TerminateError::MaxFailuresReached { .. } => ErrorCode::MAX_FAILURES_REACHED,
        }
    }
}

/// Top-level error returned by `Run`, aggregating one variant per kind.
/// Per-entity errors (kind 5) never appear here: they are accumulated into
/// `EntityResult` and are never fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Terminate(#[from] TerminateError),
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::Config(e) => e.code(),
            OrchestratorError::Connection(e) => e.code(),
            OrchestratorError::Protocol(e) => e.code(),
            OrchestratorError::Runner(e) => e.code(),
            OrchestratorError::Timeout(e) => e.code(),
            OrchestratorError::Terminate(e) => e.code(),
        }
    }

    /// Whether a `FailedBeforeRun` flag should be set for this error, i.e.
    /// runner invocation was never reached.
    pub fn failed_before_run(&self, runner_invocation_reached: bool) -> bool {
        match self {
            OrchestratorError::Config(_) => true,
            OrchestratorError::Connection(_) => !runner_invocation_reached,
            _ => false,
        }
    }

    /// True for kind 7 terminate errors: a clean but unsuccessful exit.
    pub fn is_terminate(&self) -> bool {
        matches!(self, OrchestratorError::Terminate(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_formatted_with_leading_zeros() {
        assert_eq!(ErrorCode::INVALID_SHARD_RANGE.formatted(), "E1001");
        assert_eq!(ErrorCode::MAX_FAILURES_REACHED.formatted(), "E7002");
    }

    #[test]
    fn category_is_derived_from_band() {
        assert_eq!(ErrorCode::SSH_DIAL_FAILED.category(), ErrorCategory::Connection);
        assert_eq!(ErrorCode::MISSING_RUN_START.category(), ErrorCategory::Protocol);
        assert_eq!(
            ErrorCode::REPORTER_TERMINATED.category(),
            ErrorCategory::Termination
        );
    }

    #[test]
    fn terminate_error_is_flagged() {
        let err = OrchestratorError::Terminate(TerminateError::MaxFailuresReached { limit: 1 });
        assert!(err.is_terminate());
        assert!(!err.failed_before_run(true));
    }

    #[test]
    fn config_error_is_always_failed_before_run() {
        let err = OrchestratorError::Config(ConfigError::UnknownBundle {
            bundle: "x".into(),
        });
        assert!(err.failed_before_run(true));
        assert!(err.failed_before_run(false));
    }

    #[test]
    fn connection_error_depends_on_run_progress() {
        let err = OrchestratorError::Connection(ConnectionError::DialFailed {
            target: "dut".into(),
            reason: "refused".into(),
        });
        assert!(err.failed_before_run(false));
        assert!(!err.failed_before_run(true));
    }
}
