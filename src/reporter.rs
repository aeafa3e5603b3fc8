//! Reporter Client (C11): optional streaming RPC for live progress —
//! per-line log streaming and per-test result reporting — surfacing a
//! server-initiated termination flag.
//!
//! Concrete transports (gRPC or otherwise) are out of scope per §1; this
//! module defines the trait seam plus a couple of small, real
//! implementations (no-op, and an in-memory recorder used by tests and by
//! callers that only want local JSONL/JUnit output).

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::entity::{EntityError, EntityResult};

#[derive(Debug, Clone)]
pub struct LogStreamRequest {
    pub test: String,
    pub log_path: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReportResultRequest {
    pub name: String,
    pub skip_reason: Option<String>,
    pub errors: Vec<EntityError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportResultResponse {
    /// If true, the engine raises a terminate error after handling the
    /// current message (§4.10).
    pub terminate: bool,
}

/// The two-RPC seam a real reporter client implements.
#[async_trait]
pub trait ReporterClient: Send + Sync {
    /// Client-streaming; opened once before any runner invocation.
    async fn log_stream_send(&self, request: LogStreamRequest) -> anyhow::Result<()>;
    /// Half-closes the log stream after the last message.
    async fn log_stream_close(&self) -> anyhow::Result<()>;
    /// Unary; one call per finished test.
    async fn report_result(&self, request: ReportResultRequest) -> anyhow::Result<ReportResultResponse>;
}

/// Used when no `--reports_server` is configured.
pub struct NoopReporter;

#[async_trait]
impl ReporterClient for NoopReporter {
    async fn log_stream_send(&self, _request: LogStreamRequest) -> anyhow::Result<()> {
        Ok(())
    }

    async fn log_stream_close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn report_result(&self, _request: ReportResultRequest) -> anyhow::Result<ReportResultResponse> {
        Ok(ReportResultResponse { terminate: false })
    }
}

/// In-memory recorder, serializing writes through a mutex per §5 (the
/// reporter log stream is owned by the engine but written to from each
/// entity's sink set; writes are serialized through a per-sender mutex).
#[derive(Default)]
pub struct RecordingReporter {
    inner: Mutex<RecordingState>,
}

#[derive(Default)]
struct RecordingState {
    log_lines: Vec<LogStreamRequest>,
    results: Vec<ReportResultRequest>,
    closed: bool,
    terminate_after: Option<usize>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/integration helper: makes the Nth `report_result` call (0
    /// indexed) respond with `terminate=true`.
    pub async fn terminate_after_nth_result(&self, n: usize) {
        self.inner.lock().await.terminate_after = Some(n);
    }

    pub async fn log_lines(&self) -> Vec<LogStreamRequest> {
        self.inner.lock().await.log_lines.clone()
    }

    pub async fn results(&self) -> Vec<ReportResultRequest> {
        self.inner.lock().await.results.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }
}

#[async_trait]
impl ReporterClient for RecordingReporter {
    async fn log_stream_send(&self, request: LogStreamRequest) -> anyhow::Result<()> {
        self.inner.lock().await.log_lines.push(request);
        Ok(())
    }

    async fn log_stream_close(&self) -> anyhow::Result<()> {
        self.inner.lock().await.closed = true;
        Ok(())
    }

    async fn report_result(&self, request: ReportResultRequest) -> anyhow::Result<ReportResultResponse> {
        let mut state = self.inner.lock().await;
        let index = state.results.len();
        state.results.push(request);
        let terminate = state.terminate_after == Some(index);
        Ok(ReportResultResponse { terminate })
    }
}

/// Builds a [`ReportResultRequest`] from a finished [`EntityResult`].
pub fn report_request_for(result: &EntityResult) -> ReportResultRequest {
    ReportResultRequest {
        name: result.entity.name.clone(),
        skip_reason: result.skip_reason.clone(),
        errors: result.errors.clone(),
    }
}
