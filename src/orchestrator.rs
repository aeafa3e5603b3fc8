//! Top-level wiring: resolves the target, acquires an SSH connection,
//! invokes the runner, drives the control-message stream through the
//! results engine, and retries on recoverable failures (§5).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{Config, RunState};
use crate::connection::{ConnectionCache, SshDialer};
use crate::dutinfo::{self, Diagnoser, DutInfoError, DutInfoGuard, LocalDiagnoser};
use crate::entity::Entity;
use crate::errors::{OrchestratorError, RunnerError, TimeoutError};
use crate::protocol::{decode_stream, ControlMessage, DownloadMode as WireDownloadMode, RequestMode, RunTestsArgs, RunnerRequest, StreamGuard};
use crate::reporter::ReporterClient;
use crate::resolver::{TargetResolver, WiringClient};
use crate::results::{ResultsEngine, RunSummary};
use crate::retry::{decide_retry, AlwaysRetry, BeforeRetryHook, InvocationOutcome, RetryOutcome};
use crate::runner::{RunnerInvoker, Target};
use crate::shard;

/// External collaborators this crate depends on only through trait seams
/// (no concrete SSH/gRPC/wiring implementation ships here, per scope).
pub struct Dependencies {
    pub ssh_dialer: Arc<dyn SshDialer>,
    pub wiring: Option<Box<dyn WiringClient>>,
    pub reporter: Arc<dyn ReporterClient>,
}

/// Runs one full orchestration: resolves the target, connects, invokes the
/// runner against `catalog` (already discovered by a prior `ListTests`
/// call or supplied by the caller), and drives it to completion.
#[instrument(skip(config, catalog, deps, cancellation))]
pub async fn run(
    config: Config,
    catalog: Vec<Entity>,
    deps: Dependencies,
    cancellation: CancellationToken,
) -> Result<RunSummary, OrchestratorError> {
    let resolver = TargetResolver::new(deps.wiring);
    let resolved = resolver
        .resolve(&config.target)
        .await
        .map_err(OrchestratorError::Connection)?;

    let connection = Arc::new(ConnectionCache::new(
        resolved.to_string_addr(),
        config.key_file.clone(),
        deps.ssh_dialer,
        config.ssh_retries,
        Duration::from_secs(config.ssh_retry_interval_secs),
        Duration::from_secs(config.ssh_connect_timeout_secs),
    ));
    let session = connection.acquire().await.map_err(OrchestratorError::Connection)?;

    let mut run_state = RunState::new(config.devservers.clone());
    let target = runner_target(&config);
    let invoker = RunnerInvoker::new(Duration::from_secs(config.runner_wait_timeout_secs));

    if let Ok(output) = session.run_command("file -b -L /sbin/init").await {
        run_state.target_arch = Some(dutinfo::parse_arch(&String::from_utf8_lossy(&output.stdout)));
    }

    if config.check_test_deps {
        let info = dutinfo::query_dut_info(&invoker, &target, config.extra_use_flags.clone())
            .await
            .map_err(OrchestratorError::Runner)?;
        let mut guard = DutInfoGuard::new();
        let info = guard
            .record_query(info, config.check_test_deps)
            .map_err(dut_info_error_to_runner)
            .map_err(OrchestratorError::Runner)?;
        run_state.os_version = Some(info.os_version.clone());
        run_state.available_software_features = info.available_software_features.clone();
        run_state.unavailable_software_features = info.unavailable_software_features.clone();
        run_state.dut_info_queried = true;
        write_device_config(&config.results_dir, &info.hardware_features);
    }

    let initial_sys_info = if config.collect_sys_info {
        dutinfo::query_initial_sys_info(&invoker, &target).await.ok()
    } else {
        None
    };

    let partition = shard::shard(&catalog, config.shard_index, config.total_shards);
    let patterns: Vec<String> = if !config.patterns.is_empty() {
        config.patterns.clone()
    } else {
        partition.included.iter().map(|e| e.name.clone()).collect()
    };

    let diagnoser: Arc<dyn Diagnoser> = Arc::new(LocalDiagnoser::new(connection.clone()));

    let mut engine = ResultsEngine::new(config.results_dir.clone(), config.max_test_failures, deps.reporter)
        .map_err(|e| OrchestratorError::Connection(crate::errors::ConnectionError::WiringRpcFailed {
            rpc: "results-dir-init".to_string(),
            reason: e.to_string(),
        }))?;

    let hook = AlwaysRetry;

    let mut current_patterns = patterns;
    let catalog_size = catalog.len().max(1);
    let mut terminate_error: Option<OrchestratorError> = None;

    for attempt in 0..=(catalog_size as u32) {
        let outcome = invoke_once(
            &config,
            &current_patterns,
            &invoker,
            &mut engine,
            diagnoser.clone(),
            &cancellation,
        )
        .await;

        match outcome {
            Ok(()) => break,
            Err(OrchestratorError::Terminate(terminate)) => {
                terminate_error = Some(OrchestratorError::Terminate(terminate));
                break;
            }
            Err(other) => {
                let unstarted: Vec<String> = current_patterns
                    .iter()
                    .filter(|name| !engine.attempted_names().contains(*name))
                    .cloned()
                    .collect();
                let invocation_outcome = InvocationOutcome {
                    succeeded: false,
                    unstarted: Some(unstarted),
                };
                let decision = decide_retry(
                    &invocation_outcome,
                    config.continue_after_failure,
                    &current_patterns,
                    &hook,
                    attempt,
                )
                .await;
                match decision {
                    RetryOutcome::Done => break,
                    RetryOutcome::GiveUp => {
                        terminate_error = Some(other);
                        break;
                    }
                    RetryOutcome::RetryWith(next) => {
                        warn!(attempt, remaining = next.len(), "retrying runner invocation");
                        current_patterns = next;
                    }
                }
            }
        }
    }

    let termination_time = chrono::Utc::now().timestamp();
    let summary = engine.finalize(termination_time).await?;

    if let Some(initial) = initial_sys_info {
        if let Ok(diff_paths) = dutinfo::query_sys_info_diff(&invoker, &target, &initial).await {
            if let Err(e) = dutinfo::pull_sys_info_diff(&connection, &diff_paths, &config.results_dir).await {
                warn!(error = %e, "failed to pull sys-info diff");
            }
        }
    }

    run_state.terminated = terminate_error.is_some();
    if let Some(err) = terminate_error {
        if err.is_terminate() {
            return Err(err);
        }
    }

    Ok(summary)
}

/// Resolves the target the runner is invoked against: local binary when no
/// devserver/remote runner is configured, otherwise SSH-wrapped remote
/// invocation (§4.4).
fn runner_target(config: &Config) -> Target {
    if config.devservers.is_empty() && config.remote_runner.as_os_str().is_empty() {
        Target::Local { runner_path: config.local_runner.clone() }
    } else {
        Target::Remote {
            runner_path: config.remote_runner.clone(),
            ssh_target: config.target.clone(),
            key_file: config.key_file.clone(),
        }
    }
}

/// `GetDUTInfo`'s guard errors (called-twice, empty feature lists) surface
/// as runner-exit errors (kind 4): they originate from the runner's
/// response, not from the connection or protocol layer.
fn dut_info_error_to_runner(err: DutInfoError) -> RunnerError {
    RunnerError::SpawnFailed { reason: err.to_string() }
}

/// Writes the optional textual hardware-config dump (§6); best-effort, a
/// failure here never fails the run.
fn write_device_config(results_dir: &std::path::Path, hardware_features: &std::collections::HashMap<String, String>) {
    if hardware_features.is_empty() {
        return;
    }
    let mut contents = String::new();
    for (key, value) in hardware_features {
        contents.push_str(&format!("{key}={value}\n"));
    }
    if let Err(e) = std::fs::create_dir_all(results_dir) {
        warn!(error = %e, "failed to create results dir for device-config.txt");
        return;
    }
    if let Err(e) = std::fs::write(results_dir.join("device-config.txt"), contents) {
        warn!(error = %e, "failed to write device-config.txt");
    }
}

async fn invoke_once(
    config: &Config,
    patterns: &[String],
    invoker: &RunnerInvoker,
    engine: &mut ResultsEngine,
    diagnoser: Arc<dyn Diagnoser>,
    cancellation: &CancellationToken,
) -> Result<(), OrchestratorError> {
    let target = runner_target(config);

    let request = RunnerRequest {
        mode: RequestMode::RunTests,
        run_tests: Some(RunTestsArgs {
            bundle_glob: "*".to_string(),
            data_dir: config.remote_data_dir.to_string_lossy().into_owned(),
            out_dir: PathBuf::new().to_string_lossy().into_owned(),
            key_file: config.key_file.to_string_lossy().into_owned(),
            patterns: patterns.to_vec(),
            test_vars: config.test_vars.clone(),
            devservers: config.devservers.clone(),
            tlw_address: config.tlw_server.clone(),
            build_artifact_url: config.build_artifacts_url.clone(),
            heartbeat_interval_secs: 10,
            feature_args: Vec::new(),
            download_mode: match config.download_mode {
                crate::config::DownloadMode::Batch => WireDownloadMode::Batch,
                crate::config::DownloadMode::Lazy => WireDownloadMode::Lazy,
            },
        }),
        list_tests: None,
        get_dut_info: None,
        get_sys_info_state: None,
        collect_sys_info: None,
        download_private_bundles: None,
    };

    let mut process = invoker.invoke(&target, &request).await.map_err(OrchestratorError::Runner)?;
    let mut guard = StreamGuard::new();
    let mut stream = decode_stream(process.stdout);

    let message_timeout = Duration::from_secs(config.message_read_timeout_secs);

    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                invoker.abort(&mut process).await;
                return Err(OrchestratorError::Timeout(TimeoutError::Cancelled));
            }
            next = tokio::time::timeout(message_timeout, stream.next()) => {
                let frame = match next {
                    Err(_) => {
                        invoker.abort(&mut process).await;
                        return Err(OrchestratorError::Timeout(TimeoutError::MessageRead {
                            secs: config.message_read_timeout_secs,
                        }));
                    }
                    Ok(None) => break,
                    Ok(Some(frame)) => frame,
                };

                let msg = frame.map_err(OrchestratorError::Protocol)?;
                guard.observe(&msg).map_err(OrchestratorError::Protocol)?;
                let is_run_end = matches!(msg, ControlMessage::RunEnd { .. });
                engine.handle_message(msg).await?;
                if is_run_end {
                    continue;
                }
            }
        }
    }

    if guard.finish().is_err() {
        if let Some(out_dir) = engine.most_recently_started_out_dir() {
            if let Some(reason) = diagnoser.diagnose(out_dir).await {
                info!(reason, "diagnosed abnormal stream termination");
            }
        }
    }

    invoker.wait(&mut process).await.map_err(OrchestratorError::Runner)?;
    Ok(())
}
