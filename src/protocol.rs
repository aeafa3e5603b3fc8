//! Wire protocol: the runner request record (stdin) and the control
//! message stream (stdout), framed with length-delimited records over
//! `tokio_util::codec`.

use bytes::{BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

use crate::entity::{Entity, EntityError};
use crate::errors::ProtocolError;

/// Download mode for the *run tests* request (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    Batch,
    Lazy,
}

/// Arguments carried by the *run tests* request sub-record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTestsArgs {
    pub bundle_glob: String,
    pub data_dir: String,
    pub out_dir: String,
    pub key_file: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub test_vars: HashMap<String, String>,
    #[serde(default)]
    pub devservers: Vec<String>,
    #[serde(default)]
    pub tlw_address: Option<String>,
    #[serde(default)]
    pub build_artifact_url: Option<String>,
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub feature_args: Vec<String>,
    pub download_mode: DownloadMode,
}

/// JSON on stdin: `{mode, runTests?, listTests?, ...}`. Exactly one of the
/// optional sub-records is populated per request, selected by `mode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerRequest {
    pub mode: RequestMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_tests: Option<RunTestsArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_tests: Option<ListTestsArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get_dut_info: Option<GetDutInfoArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get_sys_info_state: Option<GetSysInfoStateArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collect_sys_info: Option<CollectSysInfoArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_private_bundles: Option<DownloadPrivateBundlesArgs>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestMode {
    RunTests,
    ListTests,
    GetDutInfo,
    GetSysInfoState,
    CollectSysInfo,
    DownloadPrivateBundles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTestsArgs {
    pub bundle_glob: String,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDutInfoArgs {
    pub extra_use_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSysInfoStateArgs {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectSysInfoArgs {
    pub initial_state: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadPrivateBundlesArgs {
    pub dut_out_dir: String,
}

/// The nine-shape control-message sum type emitted on the runner's stdout.
/// Unknown tags are a protocol error (`ProtocolError::UnknownMessageKind`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    RunStart {
        time: i64,
        #[serde(default)]
        test_names: Vec<String>,
        #[serde(default)]
        num_tests: u32,
    },
    RunLog {
        time: i64,
        text: String,
    },
    RunError {
        time: i64,
        error: String,
    },
    RunEnd {
        time: i64,
        #[serde(default)]
        out_dir: String,
    },
    EntityStart {
        time: i64,
        info: Entity,
        out_dir: String,
    },
    EntityLog {
        time: i64,
        name: String,
        text: String,
    },
    EntityError {
        time: i64,
        name: String,
        error: EntityError,
    },
    EntityEnd {
        time: i64,
        name: String,
        #[serde(default)]
        skip_reasons: Vec<String>,
        #[serde(default)]
        timing_log: Option<String>,
    },
    Heartbeat {
        time: i64,
    },
}

impl ControlMessage {
    /// The expected test count carried by a `RunStart` message: length of
    /// `test_names` if non-empty, else the legacy `num_tests` field.
    pub fn expected_test_count(test_names: &[String], num_tests: u32) -> usize {
        if !test_names.is_empty() {
            test_names.len()
        } else {
            num_tests as usize
        }
    }
}

fn encode_length_delimited(value: &impl Serialize) -> Result<BytesMut, serde_json::Error> {
    let payload = serde_json::to_vec(value)?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf)
}

/// Serializes a runner request for writing to the child's stdin.
pub fn encode_request(request: &RunnerRequest) -> Result<BytesMut, serde_json::Error> {
    encode_length_delimited(request)
}

fn decode_payload(payload: Bytes) -> Result<ControlMessage, ProtocolError> {
    serde_json::from_slice(&payload).map_err(|e| ProtocolError::UnknownMessageKind {
        kind: e.to_string(),
    })
}

/// Lazily decodes length-delimited JSON records from a runner's stdout into
/// a typed [`ControlMessage`] stream. Built on `LengthDelimitedCodec` so the
/// framing matches the same big-endian u32-length-prefix convention used by
/// [`encode_request`] for the request side of the pipe.
pub fn decode_stream<R>(reader: R) -> Pin<Box<dyn Stream<Item = Result<ControlMessage, ProtocolError>> + Send>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .new_codec();
    let framed = FramedRead::new(reader, codec);
    let mapped = framed.map(|frame| match frame {
        Ok(bytes) => decode_payload(bytes.freeze()),
        Err(e) => Err(ProtocolError::UnknownMessageKind {
            kind: format!("framing error: {e}"),
        }),
    });
    Box::pin(mapped)
}

/// Validates the `RunStart`/`RunEnd` ordering constraint incrementally as
/// messages are consumed; see §4.5.
#[derive(Default)]
pub struct StreamGuard {
    seen_run_start: bool,
    seen_run_end: bool,
}

impl StreamGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, msg: &ControlMessage) -> Result<(), ProtocolError> {
        match msg {
            ControlMessage::RunStart { .. } => {
                if self.seen_run_start {
                    return Err(ProtocolError::DuplicateRunStart);
                }
                self.seen_run_start = true;
            }
            ControlMessage::RunEnd { .. } => {
                if !self.seen_run_start {
                    return Err(ProtocolError::MissingRunStart);
                }
                self.seen_run_end = true;
            }
            _ => {
                if !self.seen_run_start {
                    return Err(ProtocolError::MissingRunStart);
                }
            }
        }
        Ok(())
    }

    /// Called when the stream ends (EOF on stdout); an incomplete stream
    /// without `RunEnd` is a protocol error that the caller may choose to
    /// treat as retryable if `unstarted` is available from the runner.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if !self.seen_run_end {
            return Err(ProtocolError::MissingRunEnd);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run_start(names: &[&str]) -> ControlMessage {
        ControlMessage::RunStart {
            time: 1,
            test_names: names.iter().map(|s| s.to_string()).collect(),
            num_tests: 0,
        }
    }

    #[test]
    fn expected_test_count_prefers_names() {
        assert_eq!(
            ControlMessage::expected_test_count(&["a".into(), "b".into()], 9),
            2
        );
        assert_eq!(ControlMessage::expected_test_count(&[], 9), 9);
    }

    #[test]
    fn stream_guard_rejects_message_before_run_start() {
        let mut guard = StreamGuard::new();
        let msg = ControlMessage::Heartbeat { time: 1 };
        assert!(matches!(
            guard.observe(&msg),
            Err(ProtocolError::MissingRunStart)
        ));
    }

    #[test]
    fn stream_guard_rejects_duplicate_run_start() {
        let mut guard = StreamGuard::new();
        guard.observe(&run_start(&["pkg.A"])).unwrap();
        assert!(matches!(
            guard.observe(&run_start(&["pkg.A"])),
            Err(ProtocolError::DuplicateRunStart)
        ));
    }

    #[test]
    fn stream_guard_finish_requires_run_end() {
        let mut guard = StreamGuard::new();
        guard.observe(&run_start(&["pkg.A"])).unwrap();
        assert!(matches!(guard.finish(), Err(ProtocolError::MissingRunEnd)));
        guard
            .observe(&ControlMessage::RunEnd {
                time: 2,
                out_dir: String::new(),
            })
            .unwrap();
        assert!(guard.finish().is_ok());
    }

    #[tokio::test]
    async fn decode_stream_round_trips_a_message() {
        let msg = run_start(&["pkg.A", "pkg.B"]);
        let payload = serde_json::to_vec(&msg).unwrap();
        let mut framed = BytesMut::new();
        framed.put_u32(payload.len() as u32);
        framed.put_slice(&payload);

        let reader = Cursor::new(framed.to_vec());
        let mut stream = decode_stream(reader);
        let decoded = stream.next().await.unwrap().unwrap();
        match decoded {
            ControlMessage::RunStart { test_names, .. } => {
                assert_eq!(test_names, vec!["pkg.A", "pkg.B"]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let bad = br#"{"type":"NotARealMessage","time":1}"#;
        let err = decode_payload(Bytes::from_static(bad)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageKind { .. }));
    }
}
