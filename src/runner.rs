//! Runner Invoker (C5): spawns local/remote runner processes, marshals a
//! tagged request to stdin, and captures stdout/stderr. Stdout is handed to
//! the control stream decoder (C6, `protocol::decode_stream`); stderr is
//! captured for the runner-exit error kind (§7.4).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::errors::RunnerError;
use crate::protocol::RunnerRequest;

/// Where the runner process should be spawned.
#[derive(Debug, Clone)]
pub enum Target {
    /// `local_runner` spawned directly as a host process.
    Local { runner_path: PathBuf },
    /// `remote_runner` spawned on the DUT through an SSH command line.
    Remote {
        runner_path: PathBuf,
        ssh_target: String,
        key_file: PathBuf,
    },
}

pub struct RunnerInvoker {
    runner_wait_timeout: Duration,
}

/// A spawned runner process plus the pieces the caller needs to drive the
/// wire protocol and enforce timeouts.
pub struct RunnerProcess {
    child: Child,
    stdin: tokio::process::ChildStdin,
    pub stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
}

impl RunnerInvoker {
    pub fn new(runner_wait_timeout: Duration) -> Self {
        RunnerInvoker { runner_wait_timeout }
    }

    /// Spawns the runner process for `target`, writes the length-delimited
    /// request to its stdin, and returns the process with stdout/stderr
    /// pipes ready for the caller to consume.
    #[instrument(skip(self, request))]
    pub async fn invoke(
        &self,
        target: &Target,
        request: &RunnerRequest,
    ) -> Result<RunnerProcess, RunnerError> {
        let mut command = build_command(target);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| RunnerError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or(RunnerError::SpawnFailed {
            reason: "runner process has no stdin pipe".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or(RunnerError::SpawnFailed {
            reason: "runner process has no stdout pipe".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or(RunnerError::SpawnFailed {
            reason: "runner process has no stderr pipe".to_string(),
        })?;

        let mut process = RunnerProcess {
            child,
            stdin,
            stdout,
            stderr,
        };

        process.write_request(request).await?;

        info!("runner process spawned and request written");
        Ok(process)
    }

    /// Waits for the process to exit after its stdout stream has closed,
    /// subject to the configured timeout (§5 cancellation model).
    #[instrument(skip(self, process))]
    pub async fn wait(&self, process: &mut RunnerProcess) -> Result<RunnerExit, RunnerError> {
        let stderr_bytes = {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            let _ = process.stderr.read_to_end(&mut buf).await;
            buf
        };

        let status = match timeout(self.runner_wait_timeout, process.child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(RunnerError::SpawnFailed {
                    reason: format!("waiting on runner process: {e}"),
                })
            }
            Err(_) => {
                warn!("runner process did not exit before timeout, killing");
                let _ = process.child.kill().await;
                return Err(RunnerError::NonZeroExit {
                    status: -1,
                    first_stderr_line: first_line(&stderr_bytes),
                });
            }
        };

        let code = status.code().unwrap_or(-1);
        if code != 0 {
            return Err(RunnerError::NonZeroExit {
                status: code,
                first_stderr_line: first_line(&stderr_bytes),
            });
        }

        Ok(RunnerExit {
            status: code,
            stderr: stderr_bytes,
        })
    }

    /// Sends SIGKILL to the runner process (cancellation path, §5).
    pub async fn abort(&self, process: &mut RunnerProcess) {
        let _ = process.child.kill().await;
    }
}

pub struct RunnerExit {
    pub status: i32,
    pub stderr: Vec<u8>,
}

impl RunnerProcess {
    async fn write_request(&mut self, request: &RunnerRequest) -> Result<(), RunnerError> {
        let encoded = crate::protocol::encode_request(request).map_err(|e| RunnerError::SpawnFailed {
            reason: format!("encoding runner request: {e}"),
        })?;
        self.stdin
            .write_all(&encoded)
            .await
            .map_err(|e| RunnerError::SpawnFailed {
                reason: format!("writing runner request: {e}"),
            })?;
        self.stdin.shutdown().await.map_err(|e| RunnerError::SpawnFailed {
            reason: format!("closing runner stdin: {e}"),
        })?;
        Ok(())
    }
}

fn build_command(target: &Target) -> Command {
    match target {
        Target::Local { runner_path } => Command::new(runner_path),
        Target::Remote {
            runner_path,
            ssh_target,
            key_file,
        } => {
            let mut cmd = Command::new("ssh");
            cmd.arg("-i")
                .arg(key_file)
                .arg("-o")
                .arg("BatchMode=yes")
                .arg(ssh_target)
                .arg(runner_path_as_remote_command(runner_path));
            cmd
        }
    }
}

fn runner_path_as_remote_command(runner_path: &Path) -> String {
    runner_path.to_string_lossy().into_owned()
}

fn first_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .next()
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestMode, RunnerRequest};

    fn list_request() -> RunnerRequest {
        RunnerRequest {
            mode: RequestMode::ListTests,
            run_tests: None,
            list_tests: Some(crate::protocol::ListTestsArgs {
                bundle_glob: "*".to_string(),
                patterns: vec![],
            }),
            get_dut_info: None,
            get_sys_info_state: None,
            collect_sys_info: None,
            download_private_bundles: None,
        }
    }

    #[tokio::test]
    async fn invoke_against_cat_echoes_written_request() {
        let invoker = RunnerInvoker::new(Duration::from_secs(5));
        let target = Target::Local {
            runner_path: PathBuf::from("/bin/cat"),
        };
        let request = list_request();
        let mut process = invoker.invoke(&target, &request).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut out = Vec::new();
        process.stdout.read_to_end(&mut out).await.unwrap();

        let expected = crate::protocol::encode_request(&request).unwrap();
        assert_eq!(out, expected.to_vec());

        let exit = invoker.wait(&mut process).await.unwrap();
        assert_eq!(exit.status, 0);
    }

    #[tokio::test]
    async fn non_zero_exit_is_surfaced_with_stderr() {
        let invoker = RunnerInvoker::new(Duration::from_secs(5));
        let target = Target::Local {
            runner_path: PathBuf::from("/bin/sh"),
        };
        let mut command_target = target.clone();
        if let Target::Local { runner_path } = &mut command_target {
            *runner_path = PathBuf::from("/bin/sh");
        }

        // Use /bin/sh -c indirectly isn't representable via Target::Local's
        // single-binary shape, so this test spawns sh reading stdin and
        // exiting non-zero after printing to stderr via a here-doc wrapper.
        let invoker = invoker;
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg("cat >/dev/null; echo boom 1>&2; exit 3")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();
        let mut process = RunnerProcess {
            child,
            stdin,
            stdout,
            stderr,
        };
        process.stdin.shutdown().await.unwrap();

        let err = invoker.wait(&mut process).await.unwrap_err();
        match err {
            RunnerError::NonZeroExit { status, first_stderr_line } => {
                assert_eq!(status, 3);
                assert_eq!(first_stderr_line, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let _ = target;
    }

    #[test]
    fn remote_command_shells_out_through_ssh() {
        let target = Target::Remote {
            runner_path: PathBuf::from("/usr/bin/remote_test_runner"),
            ssh_target: "root@100.1.2.3".to_string(),
            key_file: PathBuf::from("/tmp/testing_rsa"),
        };
        let command = build_command(&target);
        assert_eq!(command.as_std().get_program(), "ssh");
    }
}
