//! CLI entry point: parses flags, initializes telemetry, and dispatches to
//! the library's `orchestrator::run` (or a raw `ListTests` probe for the
//! `list` subcommand).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use uuid::Uuid;

use dut_orchestrator::config::ConfigBuilder;
use dut_orchestrator::connection::{ConnectionCache, SshDialer, SshSession};
use dut_orchestrator::entity::Entity;
use dut_orchestrator::errors::ConnectionError;
use dut_orchestrator::orchestrator::{self, Dependencies};
use dut_orchestrator::protocol::{encode_request, ListTestsArgs, RequestMode, RunnerRequest};
use dut_orchestrator::reporter::NoopReporter;
use dut_orchestrator::resolver::NoopResolver;
use dut_orchestrator::runner::{RunnerInvoker, Target};
use dut_orchestrator::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Distributed integration-test driver orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// OTLP collector endpoint; enables OpenTelemetry export when set.
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    /// Silent mode: only critical errors on stderr.
    #[arg(long, short = 's', global = true, default_value = "false")]
    silent: bool,

    /// Verbose mode: debug-level logs.
    #[arg(long, short = 'v', global = true, default_value = "false")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs tests against a target DUT.
    Run {
        /// `user@host[:port]` of the device under test.
        #[arg(long)]
        target: String,

        #[arg(long)]
        key_file: PathBuf,

        /// Test name/glob patterns; if empty, the full shard of the
        /// resolved catalog is used.
        #[arg(long)]
        pattern: Vec<String>,

        /// Optional JSON file containing the pre-resolved test catalog
        /// (an array of entities), used for sharding.
        #[arg(long)]
        catalog_file: Option<PathBuf>,

        #[arg(long)]
        results_dir: Option<PathBuf>,

        #[arg(long, default_value = "0")]
        shard_index: u32,

        #[arg(long, default_value = "1")]
        total_shards: u32,

        #[arg(long)]
        max_test_failures: Option<u32>,

        #[arg(long, default_value = "false")]
        continue_after_failure: bool,
    },
    /// Lists tests available from the runner without executing them.
    List {
        #[arg(long)]
        target: String,

        #[arg(long)]
        key_file: PathBuf,

        #[arg(long, default_value = "*")]
        bundle_glob: String,

        #[arg(long)]
        pattern: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.log_level = if cli.silent {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if let Some(endpoint) = &cli.otel_endpoint {
        telemetry_config.otlp_endpoint = Some(endpoint.clone());
    }

    if let Err(e) = init_telemetry(telemetry_config) {
        if !cli.silent {
            eprintln!("warning: failed to initialize telemetry: {e}");
        }
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    let exit_code = match cli.command {
        Commands::Run {
            target,
            key_file,
            pattern,
            catalog_file,
            results_dir,
            shard_index,
            total_shards,
            max_test_failures,
            continue_after_failure,
        } => run_command(
            target,
            key_file,
            pattern,
            catalog_file,
            results_dir,
            shard_index,
            total_shards,
            max_test_failures,
            continue_after_failure,
        )
        .await,
        Commands::List { target, key_file, bundle_glob, pattern } => {
            list_command(target, key_file, bundle_glob, pattern).await
        }
    };

    shutdown_telemetry();
    std::process::exit(exit_code);
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    target: String,
    key_file: PathBuf,
    pattern: Vec<String>,
    catalog_file: Option<PathBuf>,
    results_dir: Option<PathBuf>,
    shard_index: u32,
    total_shards: u32,
    max_test_failures: Option<u32>,
    continue_after_failure: bool,
) -> i32 {
    let mut builder = ConfigBuilder::new(target);
    builder.key_file = key_file;
    builder.patterns = pattern;
    builder.results_dir = results_dir;
    builder.shard_index = shard_index;
    builder.total_shards = total_shards;
    builder.max_test_failures = max_test_failures;
    builder.continue_after_failure = continue_after_failure;

    let config = match builder.build() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return 1;
        }
    };

    let catalog: Vec<Entity> = match catalog_file {
        Some(path) => match std::fs::read_to_string(&path).and_then(|s| {
            serde_json::from_str(&s).map_err(|e| std::io::Error::other(e))
        }) {
            Ok(entities) => entities,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to read catalog file");
                return 1;
            }
        },
        None => Vec::new(),
    };

    let execution_id = Uuid::new_v4().to_string();
    info!(execution_id = %execution_id, "starting run");

    let deps = Dependencies {
        ssh_dialer: Arc::new(RealSshDialer),
        wiring: Some(Box::new(NoopResolver)),
        reporter: Arc::new(NoopReporter),
    };

    match orchestrator::run(config, catalog, deps, CancellationToken::new()).await {
        Ok(summary) => {
            info!(results = summary.results.len(), "run finished");
            if summary.results.iter().any(|r| r.is_failure()) {
                1
            } else {
                0
            }
        }
        Err(e) => {
            let failed_before_run = e.failed_before_run(false);
            error!(error = %e, code = %e.code(), failed_before_run, "run failed");
            if e.is_terminate() {
                2
            } else {
                1
            }
        }
    }
}

async fn list_command(target: String, key_file: PathBuf, bundle_glob: String, pattern: Vec<String>) -> i32 {
    let connection = ConnectionCache::new(
        target.clone(),
        key_file.clone(),
        Arc::new(RealSshDialer),
        0,
        std::time::Duration::from_secs(5),
        std::time::Duration::from_secs(10),
    );
    if let Err(e) = connection.acquire().await {
        error!(error = %e, "failed to connect for list");
        return 1;
    }

    let invoker = RunnerInvoker::new(std::time::Duration::from_secs(10));
    let request = RunnerRequest {
        mode: RequestMode::ListTests,
        run_tests: None,
        list_tests: Some(ListTestsArgs { bundle_glob, patterns: pattern }),
        get_dut_info: None,
        get_sys_info_state: None,
        collect_sys_info: None,
        download_private_bundles: None,
    };
    let _ = encode_request(&request);

    let target_spec = Target::Remote {
        runner_path: PathBuf::from("/usr/bin/remote_test_runner"),
        ssh_target: target,
        key_file,
    };

    match invoker.invoke(&target_spec, &request).await {
        Ok(mut process) => {
            use tokio::io::AsyncReadExt;
            let mut out = Vec::new();
            let _ = process.stdout.read_to_end(&mut out).await;
            print!("{}", String::from_utf8_lossy(&out));
            match invoker.wait(&mut process).await {
                Ok(_) => 0,
                Err(e) => {
                    error!(error = %e, "list invocation failed");
                    1
                }
            }
        }
        Err(e) => {
            error!(error = %e, "failed to invoke runner for list");
            1
        }
    }
}

/// Placeholder `SshDialer`: this crate depends only on the trait (§1 scopes
/// out a concrete SSH implementation); a real deployment substitutes its
/// own dialer here.
struct RealSshDialer;

#[async_trait::async_trait]
impl SshDialer for RealSshDialer {
    async fn dial(
        &self,
        target: &str,
        _key_file: &std::path::Path,
        _connect_timeout: std::time::Duration,
    ) -> Result<Arc<dyn SshSession>, ConnectionError> {
        Err(ConnectionError::DialFailed {
            target: target.to_string(),
            reason: "no concrete SSH transport is linked into this build".to_string(),
        })
    }
}
