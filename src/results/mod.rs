//! Results Engine (C7): consumes the control-message stream, maintains
//! per-entity state, and materializes the streaming JSONL file, the final
//! `results.json` array, the JUnit XML report, and reporter RPCs.
//!
//! Ordering and concurrency follow §5: message handling is serial (this
//! type is driven by a single caller), while output pulling runs on a
//! `tokio::task::JoinSet` "wait group" that the engine joins before
//! finishing.

pub mod jsonl;
pub mod junit;

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::entity::{Entity, EntityError, EntityResult, EntityState, FixtureNameAllocator};
use crate::errors::{OrchestratorError, ProtocolError, TerminateError};
use crate::protocol::ControlMessage;
use crate::reporter::{report_request_for, LogStreamRequest, ReporterClient};

use jsonl::JsonlWriter;

/// Summary returned once a run's stream has been fully consumed.
pub struct RunSummary {
    pub results: Vec<EntityResult>,
    pub results_json_path: PathBuf,
    pub jsonl_path: PathBuf,
    pub junit_path: PathBuf,
}

pub struct ResultsEngine {
    results_dir: PathBuf,
    jsonl: JsonlWriter,
    entities: HashMap<String, EntityState>,
    finished_tests: Vec<EntityResult>,
    fixture_allocator: FixtureNameAllocator,
    output_pullers: JoinSet<(String, std::io::Result<()>)>,
    reporter: Arc<dyn ReporterClient>,
    max_test_failures: Option<u32>,
    accumulated_failures: u32,
    global_log: File,
    last_started_out_dir: Option<PathBuf>,
}

impl ResultsEngine {
    pub fn new(
        results_dir: PathBuf,
        max_test_failures: Option<u32>,
        reporter: Arc<dyn ReporterClient>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&results_dir)?;
        let jsonl = JsonlWriter::create(&results_dir.join("streamed_results.jsonl"))?;
        let global_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(results_dir.join("run.log"))?;

        Ok(ResultsEngine {
            results_dir,
            jsonl,
            entities: HashMap::new(),
            finished_tests: Vec::new(),
            fixture_allocator: FixtureNameAllocator::new(),
            output_pullers: JoinSet::new(),
            reporter,
            max_test_failures,
            accumulated_failures: 0,
            global_log,
            last_started_out_dir: None,
        })
    }

    /// The most-recently-started entity's final output directory, for the
    /// diagnose callback invoked on abnormal stream termination (§4.7).
    pub fn most_recently_started_out_dir(&self) -> Option<&Path> {
        self.last_started_out_dir.as_deref()
    }

    /// Names of every entity that has been started (live or finished) so
    /// far this run; used by the retry loop (C10) to compute the
    /// `unstarted` pattern set after an abnormal stream termination.
    pub fn attempted_names(&self) -> std::collections::HashSet<String> {
        let mut names: std::collections::HashSet<String> =
            self.entities.keys().cloned().collect();
        names.extend(self.finished_tests.iter().map(|r| r.entity.name.clone()));
        names
    }

    fn final_out_dir_for(&mut self, entity: &Entity) -> PathBuf {
        if entity.variant.is_fixture() {
            let base = self.results_dir.join("fixtures").join(&entity.name);
            self.fixture_allocator.allocate(base)
        } else {
            self.results_dir.join("tests").join(&entity.name)
        }
    }

    fn log_to_global(&mut self, line: &str) {
        let _ = writeln!(self.global_log, "{line}");
        info!(target: "runner", "{line}");
    }

    /// Handles one decoded control message, updating entity state and
    /// writing the streaming artifacts. Returns a terminate error if the
    /// reporter or the failure cap requested the run stop.
    #[instrument(skip(self, msg))]
    pub async fn handle_message(&mut self, msg: ControlMessage) -> Result<(), OrchestratorError> {
        match msg {
            ControlMessage::RunStart { time, test_names, num_tests } => {
                let count = ControlMessage::expected_test_count(&test_names, num_tests);
                self.log_to_global(&format!("[{time}] run started, {count} tests expected"));
            }
            ControlMessage::RunLog { time, text } => {
                self.log_to_global(&format!("[{time}] {text}"));
            }
            ControlMessage::RunError { time, error } => {
                warn!("[{time}] run error: {error}");
                self.log_to_global(&format!("[{time}] RUN ERROR: {error}"));
            }
            ControlMessage::RunEnd { time, .. } => {
                self.log_to_global(&format!("[{time}] run ended"));
            }
            ControlMessage::Heartbeat { .. } => {}
            ControlMessage::EntityStart { time, info, out_dir } => {
                self.start_entity(time, info, out_dir)?;
            }
            ControlMessage::EntityLog { time, name, text } => {
                self.entity_log(time, &name, &text).await?;
            }
            ControlMessage::EntityError { time, name, error } => {
                self.entity_error(time, &name, error)?;
            }
            ControlMessage::EntityEnd { time, name, skip_reasons, .. } => {
                self.end_entity(time, &name, skip_reasons).await?;
            }
        }
        Ok(())
    }

    fn start_entity(
        &mut self,
        time: i64,
        entity: Entity,
        dut_out_dir: String,
    ) -> Result<(), OrchestratorError> {
        let final_out_dir = self.final_out_dir_for(&entity);
        std::fs::create_dir_all(&final_out_dir).map_err(io_to_protocol)?;

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(final_out_dir.join("log.txt"))
            .ok();

        let result = EntityResult::new(entity.clone(), time, final_out_dir.clone());
        self.jsonl.write(&result).map_err(io_to_protocol)?;

        self.last_started_out_dir = Some(final_out_dir.clone());
        let mut state = EntityState::new(result, PathBuf::from(dut_out_dir), final_out_dir);
        state.log_file = log_file;
        state.reporter_open = true;
        self.entities.insert(entity.name.clone(), state);
        Ok(())
    }

    async fn entity_log(&mut self, _time: i64, name: &str, text: &str) -> Result<(), OrchestratorError> {
        let state = self
            .entities
            .get_mut(name)
            .ok_or_else(|| ProtocolError::UnmatchedEntityError { name: name.to_string() })?;

        if let Some(file) = state.log_file.as_mut() {
            let _ = writeln!(file, "{text}");
        }
        info!(target: "entity", entity = name, "{text}");

        if state.reporter_open {
            let _ = self
                .reporter
                .log_stream_send(LogStreamRequest {
                    test: name.to_string(),
                    log_path: "log.txt".to_string(),
                    data: text.as_bytes().to_vec(),
                })
                .await;
        }
        Ok(())
    }

    fn entity_error(&mut self, time: i64, name: &str, error: EntityError) -> Result<(), OrchestratorError> {
        let state = self
            .entities
            .get_mut(name)
            .ok_or_else(|| ProtocolError::UnmatchedEntityError { name: name.to_string() })?;

        let _ = time;
        state.result.errors.push(error);
        self.jsonl.write(&state.result).map_err(io_to_protocol)?;
        Ok(())
    }

    async fn end_entity(
        &mut self,
        time: i64,
        name: &str,
        skip_reasons: Vec<String>,
    ) -> Result<(), OrchestratorError> {
        let mut state = self
            .entities
            .remove(name)
            .ok_or_else(|| ProtocolError::UnmatchedEntityError { name: name.to_string() })?;

        state.result.end = time;
        if let Some(reason) = skip_reasons.into_iter().next() {
            state.result.skip_reason = Some(reason);
        }
        state.reporter_open = false;
        self.jsonl.write(&state.result).map_err(io_to_protocol)?;

        if !state.dut_out_dir.as_os_str().is_empty() {
            let dut_dir = state.dut_out_dir.clone();
            let final_dir = state.final_out_dir.clone();
            let entity_name = name.to_string();
            self.output_pullers.spawn(async move {
                let outcome =
                    tokio::task::spawn_blocking(move || copy_dir_with_collisions(&dut_dir, &final_dir))
                        .await
                        .unwrap_or_else(|e| Err(std::io::Error::other(e)));
                (entity_name, outcome)
            });
        }

        let is_test = !state.result.entity.variant.is_fixture();
        if is_test {
            let is_failure = state.result.is_failure();
            self.finished_tests.push(state.result.clone());
            if is_failure {
                self.accumulated_failures += 1;
            }

            let response = self
                .reporter
                .report_result(report_request_for(&state.result))
                .await
                .map_err(|e| ProtocolError::UnknownMessageKind { kind: e.to_string() })?;

            if response.terminate {
                return Err(OrchestratorError::Terminate(TerminateError::ReporterTerminated));
            }

            if let Some(limit) = self.max_test_failures {
                if self.accumulated_failures >= limit {
                    return Err(OrchestratorError::Terminate(TerminateError::MaxFailuresReached { limit }));
                }
            }
        }

        Ok(())
    }

    /// Marks any still-live entities as unfinished, re-reports them, joins
    /// the output-puller wait group, and writes the final artifacts.
    #[instrument(skip(self))]
    pub async fn finalize(mut self, termination_time: i64) -> Result<RunSummary, OrchestratorError> {
        let live_names: Vec<String> = self.entities.keys().cloned().collect();
        for name in live_names {
            if let Some(mut state) = self.entities.remove(&name) {
                state.result.end = termination_time;
                state.result.errors.push(EntityError::did_not_finish(termination_time));
                self.jsonl.write(&state.result).map_err(io_to_protocol)?;

                if !state.result.entity.variant.is_fixture() {
                    self.finished_tests.push(state.result.clone());
                    let _ = self
                        .reporter
                        .report_result(report_request_for(&state.result))
                        .await;
                }
            }
        }

        while let Some(joined) = self.output_pullers.join_next().await {
            match joined {
                Ok((name, Err(e))) => warn!("output pull for {name} failed: {e}"),
                Ok((_, Ok(()))) => {}
                Err(e) => warn!("output puller task panicked: {e}"),
            }
        }

        let _ = self.reporter.log_stream_close().await;

        let results_json_path = self.results_dir.join("results.json");
        let json = serde_json::to_string_pretty(&self.finished_tests).map_err(io_to_protocol_json)?;
        std::fs::write(&results_json_path, json).map_err(io_to_protocol)?;

        let junit_path = self.results_dir.join("results.xml");
        let xml = junit::render(&self.finished_tests)
            .map_err(|e| ProtocolError::UnknownMessageKind { kind: e.to_string() })?;
        std::fs::write(&junit_path, xml).map_err(io_to_protocol)?;

        self.log_to_global(&format!("Results saved to {}", self.results_dir.display()));

        let jsonl_path = self.results_dir.join("streamed_results.jsonl");
        Ok(RunSummary {
            results: self.finished_tests,
            results_json_path,
            jsonl_path,
            junit_path,
        })
    }
}

fn copy_dir_with_collisions(src: &Path, dst: &Path) -> std::io::Result<()> {
    if !src.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            let target = if target.exists() {
                let mut os = target.clone().into_os_string();
                os.push(".from_test");
                PathBuf::from(os)
            } else {
                target
            };
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn io_to_protocol(e: std::io::Error) -> OrchestratorError {
    OrchestratorError::Protocol(ProtocolError::UnknownMessageKind { kind: e.to_string() })
}

fn io_to_protocol_json(e: serde_json::Error) -> OrchestratorError {
    OrchestratorError::Protocol(ProtocolError::UnknownMessageKind { kind: e.to_string() })
}
