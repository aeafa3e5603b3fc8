//! Configuration & State (C1): immutable run parameters, plus the mutable
//! per-run accumulator threaded through the rest of the orchestrator.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    List,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Built,
    Prebuilt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    Batch,
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Env,
    None,
}

/// Immutable run parameters, derived once from CLI flags / environment
/// overrides (§AMBIENT-7.3) and never mutated afterward.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: RunMode,
    pub build_mode: BuildMode,
    pub target: String,
    pub key_file: PathBuf,
    pub key_dir: Option<PathBuf>,
    pub patterns: Vec<String>,
    pub results_dir: PathBuf,
    pub shard_index: u32,
    pub total_shards: u32,
    pub continue_after_failure: bool,
    pub ssh_retries: u32,
    pub ssh_retry_interval_secs: u64,
    pub ssh_connect_timeout_secs: u64,
    pub max_test_failures: Option<u32>,
    pub message_read_timeout_secs: u64,
    pub runner_wait_timeout_secs: u64,
    pub devservers: Vec<String>,
    pub ephemeral_devserver: bool,
    pub extra_allowed_buckets: Vec<String>,
    pub build_artifacts_url: Option<String>,
    pub download_private_bundles: bool,
    pub download_mode: DownloadMode,
    pub tlw_server: Option<String>,
    pub reports_server: Option<String>,
    pub local_runner: PathBuf,
    pub local_bundle_dir: PathBuf,
    pub local_data_dir: PathBuf,
    pub local_out_dir: PathBuf,
    pub remote_runner: PathBuf,
    pub remote_bundle_dir: PathBuf,
    pub remote_data_dir: PathBuf,
    pub collect_sys_info: bool,
    pub wait_until_ready: bool,
    pub check_test_deps: bool,
    pub extra_use_flags: Vec<String>,
    pub test_vars: HashMap<String, String>,
    pub proxy: ProxyMode,
}

pub struct ConfigBuilder {
    pub mode: RunMode,
    pub build_mode: BuildMode,
    pub target: String,
    pub key_file: PathBuf,
    pub key_dir: Option<PathBuf>,
    pub patterns: Vec<String>,
    pub results_dir: Option<PathBuf>,
    pub shard_index: u32,
    pub total_shards: u32,
    pub continue_after_failure: bool,
    pub ssh_retries: u32,
    pub max_test_failures: Option<u32>,
    pub devservers: Vec<String>,
    pub ephemeral_devserver: bool,
    pub build_artifacts_url: Option<String>,
    pub tlw_server: Option<String>,
    pub reports_server: Option<String>,
    pub var_assignments: Vec<String>,
    pub vars_files: Vec<PathBuf>,
    pub default_vars_dirs: Vec<PathBuf>,
    pub bundle: Option<String>,
    pub workspace: Option<PathBuf>,
}

impl ConfigBuilder {
    pub fn new(target: impl Into<String>) -> Self {
        ConfigBuilder {
            mode: RunMode::Execute,
            build_mode: BuildMode::Prebuilt,
            target: target.into(),
            key_file: PathBuf::new(),
            key_dir: None,
            patterns: Vec::new(),
            results_dir: None,
            shard_index: 0,
            total_shards: 1,
            continue_after_failure: false,
            ssh_retries: 0,
            max_test_failures: None,
            devservers: Vec::new(),
            ephemeral_devserver: true,
            build_artifacts_url: None,
            tlw_server: None,
            reports_server: None,
            var_assignments: Vec::new(),
            vars_files: Vec::new(),
            default_vars_dirs: Vec::new(),
            bundle: None,
            workspace: None,
        }
    }

    /// Derives a complete, validated [`Config`], applying the same
    /// environment-variable overrides as `from_env` style components
    /// elsewhere in this crate (§AMBIENT-7.3), then the structural
    /// validations from §4.1.
    pub fn build(self) -> Result<Config, ConfigError> {
        if self.shard_index >= self.total_shards {
            return Err(ConfigError::InvalidShardRange {
                index: self.shard_index,
                total: self.total_shards,
            });
        }

        if self.build_mode == BuildMode::Built && self.bundle.is_none() && self.workspace.is_none()
        {
            return Err(ConfigError::UnknownBundle {
                bundle: self.bundle.unwrap_or_default(),
            });
        }

        if let Some(url) = &self.build_artifacts_url {
            validate_artifact_url(url)?;
        }

        let test_vars = merge_test_vars(&self.var_assignments, &self.vars_files, &self.default_vars_dirs)?;

        let results_dir = self
            .results_dir
            .unwrap_or_else(|| default_results_dir(Utc::now().format("%Y%m%d-%H%M%S").to_string()));

        let max_test_failures = match std::env::var("ORCHESTRATOR_MAX_TEST_FAILURES") {
            Ok(v) => v.parse().ok(),
            Err(_) => self.max_test_failures,
        };
        let ssh_retries = match std::env::var("ORCHESTRATOR_SSH_RETRIES") {
            Ok(v) => v.parse().unwrap_or(self.ssh_retries),
            Err(_) => self.ssh_retries,
        };
        let target = std::env::var("ORCHESTRATOR_TARGET").unwrap_or(self.target);
        let results_dir = match std::env::var("ORCHESTRATOR_RESULTS_DIR") {
            Ok(v) => PathBuf::from(v),
            Err(_) => results_dir,
        };

        Ok(Config {
            mode: self.mode,
            build_mode: self.build_mode,
            target,
            key_file: self.key_file,
            key_dir: self.key_dir,
            patterns: self.patterns,
            results_dir,
            shard_index: self.shard_index,
            total_shards: self.total_shards,
            continue_after_failure: self.continue_after_failure,
            ssh_retries,
            ssh_retry_interval_secs: 5,
            ssh_connect_timeout_secs: 10,
            max_test_failures,
            message_read_timeout_secs: 60,
            runner_wait_timeout_secs: 10,
            devservers: self.devservers,
            ephemeral_devserver: self.ephemeral_devserver,
            extra_allowed_buckets: Vec::new(),
            build_artifacts_url: self.build_artifacts_url,
            download_private_bundles: false,
            download_mode: DownloadMode::Batch,
            tlw_server: self.tlw_server,
            reports_server: self.reports_server,
            local_runner: PathBuf::from("/usr/local/libexec/runner/local_test_runner"),
            local_bundle_dir: PathBuf::from("/usr/local/libexec/runner/bundles/local"),
            local_data_dir: PathBuf::from("/usr/local/share/runner/data"),
            local_out_dir: PathBuf::new(),
            remote_runner: PathBuf::from("/usr/bin/remote_test_runner"),
            remote_bundle_dir: PathBuf::from("/usr/libexec/runner/bundles/remote"),
            remote_data_dir: PathBuf::from("/usr/share/runner/data"),
            collect_sys_info: true,
            wait_until_ready: true,
            check_test_deps: true,
            extra_use_flags: Vec::new(),
            test_vars,
            proxy: ProxyMode::Env,
        })
    }
}

fn default_results_dir(timestamp: String) -> PathBuf {
    PathBuf::from(format!("/tmp/orchestrator_results/{timestamp}"))
}

fn validate_artifact_url(url: &str) -> Result<(), ConfigError> {
    if !url.ends_with('/') {
        return Err(ConfigError::MalformedArtifactUrl {
            url: url.to_string(),
            reason: "missing trailing slash".to_string(),
        });
    }
    let expected_schemes = ["gs://", "http://", "https://"];
    if !expected_schemes.iter().any(|s| url.starts_with(s)) {
        return Err(ConfigError::MalformedArtifactUrl {
            url: url.to_string(),
            reason: "unexpected scheme".to_string(),
        });
    }
    Ok(())
}

/// Merges `--var`, `--varsfile`, and default-vars-directory sources with
/// first-wins precedence: explicit `--var` beats `--varsfile` beats
/// default directories (§4.1).
fn merge_test_vars(
    assignments: &[String],
    vars_files: &[PathBuf],
    default_vars_dirs: &[PathBuf],
) -> Result<HashMap<String, String>, ConfigError> {
    let mut merged = HashMap::new();

    for dir in default_vars_dirs {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if let Ok(contents) = std::fs::read_to_string(entry.path()) {
                    for (k, v) in parse_vars_file(&contents) {
                        merged.entry(k).or_insert(v);
                    }
                }
            }
        }
    }

    for file in vars_files {
        if let Ok(contents) = std::fs::read_to_string(file) {
            for (k, v) in parse_vars_file(&contents) {
                merged.insert(k, v);
            }
        }
    }

    for raw in assignments {
        let (k, v) = raw.split_once('=').ok_or_else(|| ConfigError::BadVarAssignment {
            raw: raw.clone(),
        })?;
        merged.insert(k.to_string(), v.to_string());
    }

    Ok(merged)
}

fn parse_vars_file(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Mutable accumulator for one `Run` call; owned by the orchestrator and
/// threaded through C2–C11.
pub struct RunState {
    pub target_arch: Option<String>,
    pub initial_boot_id: Option<String>,
    pub os_version: Option<String>,
    pub available_software_features: Vec<String>,
    pub unavailable_software_features: Vec<String>,
    pub accumulated_failures: u32,
    pub devservers: Vec<String>,
    pub runner_invocation_reached: bool,
    pub dut_info_queried: bool,
    pub terminated: bool,
}

impl RunState {
    pub fn new(devservers: Vec<String>) -> Self {
        RunState {
            target_arch: None,
            initial_boot_id: None,
            os_version: None,
            available_software_features: Vec::new(),
            unavailable_software_features: Vec::new(),
            accumulated_failures: 0,
            devservers,
            runner_invocation_reached: false,
            dut_info_queried: false,
            terminated: false,
        }
    }
}
