//! DUT Info & Sys-Info (C8): software/hardware feature queries, sys-info
//! snapshot/diff, and the diagnose callback invoked on abnormal stream
//! termination.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::ConnectionCache;
use crate::errors::RunnerError;
use crate::protocol::{
    CollectSysInfoArgs, GetDutInfoArgs, GetSysInfoStateArgs, RequestMode, RunnerRequest,
};
use crate::runner::{RunnerInvoker, Target};

#[derive(Debug, Error)]
pub enum DutInfoError {
    #[error("GetDUTInfo called twice in the same run")]
    CalledTwice,
    #[error("no software features reported by the DUT")]
    NoSoftwareFeatures,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DutInfo {
    #[serde(default)]
    pub available_software_features: Vec<String>,
    #[serde(default)]
    pub unavailable_software_features: Vec<String>,
    #[serde(default)]
    pub hardware_features: HashMap<String, String>,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub default_artifact_url: Option<String>,
}

/// Tracks whether `GetDUTInfo` has already been called this run; calling it
/// twice is an error (§4.7).
#[derive(Default)]
pub struct DutInfoGuard {
    queried: bool,
}

impl DutInfoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(
        &mut self,
        info: DutInfo,
        check_features: bool,
    ) -> Result<DutInfo, DutInfoError> {
        if self.queried {
            return Err(DutInfoError::CalledTwice);
        }
        self.queried = true;

        if check_features
            && info.available_software_features.is_empty()
            && info.unavailable_software_features.is_empty()
        {
            return Err(DutInfoError::NoSoftwareFeatures);
        }

        Ok(info)
    }
}

/// Opaque snapshot of system state: a log inode+size table and a minidump
/// path list (§4.7).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysInfoSnapshot {
    #[serde(default)]
    pub log_inodes: HashMap<PathBuf, (u64, u64)>,
    #[serde(default)]
    pub minidumps: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct SysInfoDiff {
    pub new_or_grown_logs: Vec<PathBuf>,
    pub new_minidumps: Vec<PathBuf>,
}

/// Sends the *get DUT info* request and decodes the runner's JSON response
/// (§4.5, §4.7). Unlike the *run tests* stream, this and the other
/// single-shot request variants return one JSON document on stdout rather
/// than a length-delimited control-message sequence.
pub async fn query_dut_info(
    invoker: &RunnerInvoker,
    target: &Target,
    extra_use_flags: Vec<String>,
) -> Result<DutInfo, RunnerError> {
    let request = RunnerRequest {
        mode: RequestMode::GetDutInfo,
        run_tests: None,
        list_tests: None,
        get_dut_info: Some(GetDutInfoArgs { extra_use_flags }),
        get_sys_info_state: None,
        collect_sys_info: None,
        download_private_bundles: None,
    };
    invoke_and_decode(invoker, target, &request).await
}

/// Sends the *get sys-info state* request, returning the opaque initial
/// snapshot (§4.7).
pub async fn query_initial_sys_info(
    invoker: &RunnerInvoker,
    target: &Target,
) -> Result<SysInfoSnapshot, RunnerError> {
    let request = RunnerRequest {
        mode: RequestMode::GetSysInfoState,
        run_tests: None,
        list_tests: None,
        get_dut_info: None,
        get_sys_info_state: Some(GetSysInfoStateArgs {}),
        collect_sys_info: None,
        download_private_bundles: None,
    };
    invoke_and_decode(invoker, target, &request).await
}

/// Sends the *collect sys-info* request with the prior snapshot, returning
/// the paths of the diff (§4.7).
pub async fn query_sys_info_diff(
    invoker: &RunnerInvoker,
    target: &Target,
    initial: &SysInfoSnapshot,
) -> Result<SysInfoDiffPaths, RunnerError> {
    let initial_state = serde_json::to_value(initial).map_err(|e| RunnerError::SpawnFailed {
        reason: format!("encoding initial sys-info snapshot: {e}"),
    })?;
    let request = RunnerRequest {
        mode: RequestMode::CollectSysInfo,
        run_tests: None,
        list_tests: None,
        get_dut_info: None,
        get_sys_info_state: None,
        collect_sys_info: Some(CollectSysInfoArgs { initial_state }),
        download_private_bundles: None,
    };
    invoke_and_decode(invoker, target, &request).await
}

/// DUT-side paths the runner reports as changed; these are pulled into the
/// result directory's `system_logs/` and `crashes/` subdirectories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysInfoDiffPaths {
    #[serde(default)]
    pub log_paths: Vec<PathBuf>,
    #[serde(default)]
    pub minidump_paths: Vec<PathBuf>,
}

async fn invoke_and_decode<T: for<'de> Deserialize<'de>>(
    invoker: &RunnerInvoker,
    target: &Target,
    request: &RunnerRequest,
) -> Result<T, RunnerError> {
    use tokio::io::AsyncReadExt;

    let mut process = invoker.invoke(target, request).await?;
    let mut out = Vec::new();
    process
        .stdout
        .read_to_end(&mut out)
        .await
        .map_err(|e| RunnerError::SpawnFailed {
            reason: format!("reading runner response: {e}"),
        })?;
    invoker.wait(&mut process).await?;
    serde_json::from_slice(&out).map_err(|e| RunnerError::SpawnFailed {
        reason: format!("decoding runner response: {e}"),
    })
}

/// Pulls the diffed sys-info paths into `results_dir/system_logs/` and
/// `results_dir/crashes/` (§6 files produced under the result directory).
pub async fn pull_sys_info_diff(
    connection: &ConnectionCache,
    diff: &SysInfoDiffPaths,
    results_dir: &Path,
) -> std::io::Result<()> {
    let logs_dir = results_dir.join("system_logs");
    let crashes_dir = results_dir.join("crashes");
    std::fs::create_dir_all(&logs_dir)?;
    std::fs::create_dir_all(&crashes_dir)?;

    for remote in &diff.log_paths {
        if let Some(name) = remote.file_name() {
            let local = logs_dir.join(name);
            let _ = connection.pull_file(remote, &local).await;
        }
    }
    for remote in &diff.minidump_paths {
        if let Some(name) = remote.file_name() {
            let local = crashes_dir.join(name);
            let _ = connection.pull_file(remote, &local).await;
        }
    }
    Ok(())
}

/// Computes the diff between an initial and a final snapshot: logs that
/// are new or have grown, and minidumps that are new.
pub fn diff_snapshots(initial: &SysInfoSnapshot, current: &SysInfoSnapshot) -> SysInfoDiff {
    let mut new_or_grown_logs = Vec::new();
    for (path, (inode, size)) in &current.log_inodes {
        match initial.log_inodes.get(path) {
            None => new_or_grown_logs.push(path.clone()),
            Some((prev_inode, prev_size)) => {
                if prev_inode != inode || size > prev_size {
                    new_or_grown_logs.push(path.clone());
                }
            }
        }
    }

    let initial_minidumps: std::collections::HashSet<_> = initial.minidumps.iter().collect();
    let new_minidumps = current
        .minidumps
        .iter()
        .filter(|p| !initial_minidumps.contains(p))
        .cloned()
        .collect();

    SysInfoDiff {
        new_or_grown_logs,
        new_minidumps,
    }
}

/// Invoked when the control-message stream terminates abnormally, with the
/// most-recently-started entity's output directory. Returns `None` to let
/// the generic message stand.
#[async_trait]
pub trait Diagnoser: Send + Sync {
    async fn diagnose(&self, entity_out_dir: &std::path::Path) -> Option<String>;
}

/// The local diagnoser: pings the cached SSH connection and reports a
/// "lost connection" reason if the ping fails (§4.7).
pub struct LocalDiagnoser {
    connection: std::sync::Arc<ConnectionCache>,
}

impl LocalDiagnoser {
    pub fn new(connection: std::sync::Arc<ConnectionCache>) -> Self {
        LocalDiagnoser { connection }
    }
}

#[async_trait]
impl Diagnoser for LocalDiagnoser {
    async fn diagnose(&self, _entity_out_dir: &std::path::Path) -> Option<String> {
        if !self.connection.ping().await {
            Some("Lost SSH connection: ping failed".to_string())
        } else {
            None
        }
    }
}

/// Parses the `file -b -L /sbin/init` probe output into a normalized arch
/// string (§6 DUT probes).
pub fn parse_arch(file_output: &str) -> String {
    if file_output.contains("x86-64") {
        "x86_64".to_string()
    } else if file_output.contains("ELF 64-bit") {
        "aarch64".to_string()
    } else {
        "armv7l".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::connection::{ConnectionCache, RemoteCommandOutput, SshDialer, SshSession};
    use crate::errors::ConnectionError;

    #[tokio::test]
    async fn query_dut_info_decodes_the_runners_json_response() {
        let invoker = RunnerInvoker::new(std::time::Duration::from_secs(5));
        // Stands in for a runner that drains the framed request on stdin
        // and replies with a single unframed JSON document, per the
        // single-shot request contract (§4.7).
        let (_dir, script) = stub_runner_script();
        let target = Target::Local { runner_path: script };

        let info = query_dut_info(&invoker, &target, vec!["extra_use_flag".to_string()])
            .await
            .unwrap();
        assert_eq!(info.available_software_features, vec!["feat_a".to_string()]);
        assert_eq!(info.os_version, "15.0");
    }

    /// Writes a throwaway shell script that drains stdin then emits a fixed
    /// `DutInfo` JSON document, standing in for a real runner binary. The
    /// returned `TempDir` must outlive the script's use.
    fn stub_runner_script() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub_runner.sh");
        std::fs::write(
            &path,
            "#!/bin/sh\ncat >/dev/null\nprintf '{\"available_software_features\":[\"feat_a\"],\"unavailable_software_features\":[],\"hardware_features\":{},\"os_version\":\"15.0\",\"default_artifact_url\":null}'\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    }

    struct FakePullSession;

    #[async_trait]
    impl SshSession for FakePullSession {
        async fn ping(&self) -> bool {
            true
        }
        async fn run_command(&self, _command: &str) -> Result<RemoteCommandOutput, ConnectionError> {
            Ok(RemoteCommandOutput { status: 0, stdout: vec![], stderr: vec![] })
        }
        async fn reverse_forward(&self, _wiring_addr: &str) -> Result<String, ConnectionError> {
            Ok("127.0.0.1:1".to_string())
        }
        async fn pull_file(&self, remote: &Path, local: &Path) -> Result<(), ConnectionError> {
            std::fs::write(local, format!("contents of {}", remote.display())).unwrap();
            Ok(())
        }
        async fn close(&self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    struct FakePullDialer;

    #[async_trait]
    impl SshDialer for FakePullDialer {
        async fn dial(
            &self,
            _target: &str,
            _key_file: &Path,
            _connect_timeout: std::time::Duration,
        ) -> Result<std::sync::Arc<dyn SshSession>, ConnectionError> {
            Ok(std::sync::Arc::new(FakePullSession))
        }
    }

    #[tokio::test]
    async fn pull_sys_info_diff_writes_into_system_logs_and_crashes() {
        let dir = tempfile::tempdir().unwrap();
        let connection = ConnectionCache::new(
            "dut1",
            PathBuf::from("/tmp/key"),
            std::sync::Arc::new(FakePullDialer),
            0,
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(10),
        );
        connection.acquire().await.unwrap();

        let diff = SysInfoDiffPaths {
            log_paths: vec![PathBuf::from("/var/log/net.log")],
            minidump_paths: vec![PathBuf::from("/var/spool/crash/a.dmp")],
        };
        pull_sys_info_diff(&connection, &diff, dir.path()).await.unwrap();

        assert!(dir.path().join("system_logs/net.log").exists());
        assert!(dir.path().join("crashes/a.dmp").exists());
    }

    #[test]
    fn dut_info_guard_rejects_second_query() {
        let mut guard = DutInfoGuard::new();
        guard.record_query(DutInfo::default(), false).unwrap();
        let err = guard.record_query(DutInfo::default(), false).unwrap_err();
        assert!(matches!(err, DutInfoError::CalledTwice));
    }

    #[test]
    fn empty_feature_lists_fail_when_check_requested() {
        let mut guard = DutInfoGuard::new();
        let err = guard.record_query(DutInfo::default(), true).unwrap_err();
        assert!(matches!(err, DutInfoError::NoSoftwareFeatures));
    }

    #[test]
    fn empty_feature_lists_are_fine_when_check_not_requested() {
        let mut guard = DutInfoGuard::new();
        assert!(guard.record_query(DutInfo::default(), false).is_ok());
    }

    #[test]
    fn diff_detects_new_and_grown_logs_and_new_minidumps() {
        let mut initial = SysInfoSnapshot::default();
        initial.log_inodes.insert(PathBuf::from("/var/log/a.log"), (1, 100));

        let mut current = SysInfoSnapshot::default();
        current.log_inodes.insert(PathBuf::from("/var/log/a.log"), (1, 200));
        current.log_inodes.insert(PathBuf::from("/var/log/b.log"), (2, 50));
        current.minidumps.push(PathBuf::from("/var/spool/crash/x.dmp"));

        let diff = diff_snapshots(&initial, &current);
        assert!(diff.new_or_grown_logs.contains(&PathBuf::from("/var/log/a.log")));
        assert!(diff.new_or_grown_logs.contains(&PathBuf::from("/var/log/b.log")));
        assert_eq!(diff.new_minidumps, vec![PathBuf::from("/var/spool/crash/x.dmp")]);
    }

    #[test]
    fn arch_probe_parses_known_formats() {
        assert_eq!(parse_arch("ELF 64-bit LSB executable, x86-64"), "x86_64");
        assert_eq!(parse_arch("ELF 64-bit LSB executable, ARM aarch64"), "aarch64");
        assert_eq!(parse_arch("ELF 32-bit LSB executable, ARM"), "armv7l");
    }
}
