//! Connection Cache (C2): single-flight acquisition of an SSH session to
//! the DUT, with liveness checks, reconnect, and an optional reverse
//! port-forward for the wiring service.
//!
//! No concrete SSH implementation ships in this crate — §1 scopes it out as
//! an external collaborator. [`SshSession`] is the seam a real
//! implementation plugs into; tests exercise the cache logic against a
//! fake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::errors::ConnectionError;

/// A remote command executed over the SSH session: the exit status plus
/// captured stdout/stderr, mirroring what the runner invoker (C5) needs
/// when it targets the on-DUT binary.
#[derive(Debug, Clone)]
pub struct RemoteCommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The seam a real SSH client implements. Kept deliberately small: dial,
/// ping, run-a-command, reverse-forward, close.
#[async_trait]
pub trait SshSession: Send + Sync {
    async fn ping(&self) -> bool;
    async fn run_command(&self, command: &str) -> Result<RemoteCommandOutput, ConnectionError>;
    /// Establishes a reverse port-forward so the DUT can reach
    /// `wiring_addr` via a DUT-local endpoint; returns the local-side
    /// address exposed to downstream components (§4.2).
    async fn reverse_forward(&self, wiring_addr: &str) -> Result<String, ConnectionError>;
    /// Pulls a single file from `remote` on the DUT to `local` on the
    /// host. Used for sys-info diff collection and `device-config.txt`
    /// (§4.7, §6) — a real implementation shells out to `scp`/`sftp`;
    /// this crate depends only on the trait.
    async fn pull_file(&self, remote: &std::path::Path, local: &std::path::Path) -> Result<(), ConnectionError>;
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Constructs a new [`SshSession`] for a `user@host[:port]` target. The
/// concrete implementation is supplied by the embedding application; this
/// crate only depends on the trait.
#[async_trait]
pub trait SshDialer: Send + Sync {
    async fn dial(
        &self,
        target: &str,
        key_file: &std::path::Path,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn SshSession>, ConnectionError>;
}

struct CacheState {
    session: Option<Arc<dyn SshSession>>,
    reverse_forward_addr: Option<String>,
}

/// Caches a single SSH session per target, reconnecting transparently.
/// Acquire is single-flight: concurrent callers await the same in-flight
/// dial rather than racing independent connections.
pub struct ConnectionCache {
    target: String,
    key_file: std::path::PathBuf,
    dialer: Arc<dyn SshDialer>,
    retry_count: u32,
    retry_interval: Duration,
    connect_timeout: Duration,
    state: Mutex<CacheState>,
    initial_boot_id: Mutex<Option<String>>,
}

impl ConnectionCache {
    pub fn new(
        target: impl Into<String>,
        key_file: std::path::PathBuf,
        dialer: Arc<dyn SshDialer>,
        retry_count: u32,
        retry_interval: Duration,
        connect_timeout: Duration,
    ) -> Self {
        ConnectionCache {
            target: target.into(),
            key_file,
            dialer,
            retry_count,
            retry_interval,
            connect_timeout,
            state: Mutex::new(CacheState {
                session: None,
                reverse_forward_addr: None,
            }),
            initial_boot_id: Mutex::new(None),
        }
    }

    /// Returns the cached session if alive, otherwise reconnects. The first
    /// successful connect also records the boot identifier (§4.2, §6).
    #[instrument(skip(self), fields(target = %self.target))]
    pub async fn acquire(&self) -> Result<Arc<dyn SshSession>, ConnectionError> {
        let mut state = self.state.lock().await;

        if let Some(session) = &state.session {
            if session.ping().await {
                return Ok(session.clone());
            }
            warn!("cached ssh session failed liveness check, reconnecting");
        }

        let session = self.dial_with_retries().await?;

        if self.initial_boot_id.lock().await.is_none() {
            if let Ok(output) = session
                .run_command("cat /proc/sys/kernel/random/boot_id")
                .await
            {
                let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
                *self.initial_boot_id.lock().await = Some(id);
            }
        }

        state.session = Some(session.clone());
        Ok(session)
    }

    async fn dial_with_retries(&self) -> Result<Arc<dyn SshSession>, ConnectionError> {
        let mut last_err = None;
        for attempt in 0..=self.retry_count {
            match self
                .dialer
                .dial(&self.target, &self.key_file, self.connect_timeout)
                .await
            {
                Ok(session) => {
                    info!(attempt, "ssh session established");
                    return Ok(session);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "ssh dial attempt failed");
                    last_err = Some(e);
                    if attempt < self.retry_count {
                        sleep(self.retry_interval).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(ConnectionError::DialFailed {
            target: self.target.clone(),
            reason: "no dial attempts made".to_string(),
        }))
    }

    pub async fn ping(&self) -> bool {
        match self.state.lock().await.session.as_ref() {
            Some(session) => session.ping().await,
            None => false,
        }
    }

    /// Establishes the reverse port-forward to `wiring_addr` if a session
    /// is cached; idempotent, returns the previously established address
    /// on repeated calls for the same run.
    pub async fn ensure_reverse_forward(
        &self,
        wiring_addr: &str,
    ) -> Result<String, ConnectionError> {
        let mut state = self.state.lock().await;
        if let Some(addr) = &state.reverse_forward_addr {
            return Ok(addr.clone());
        }
        let session = state.session.clone().ok_or(ConnectionError::DialFailed {
            target: self.target.clone(),
            reason: "no session to forward through".to_string(),
        })?;
        let addr = session.reverse_forward(wiring_addr).await?;
        state.reverse_forward_addr = Some(addr.clone());
        Ok(addr)
    }

    pub async fn initial_boot_id(&self) -> Option<String> {
        self.initial_boot_id.lock().await.clone()
    }

    /// Pulls `remote` into `local` over the cached session (§4.7 sys-info
    /// diff collection, §6 `device-config.txt`).
    pub async fn pull_file(
        &self,
        remote: &std::path::Path,
        local: &std::path::Path,
    ) -> Result<(), ConnectionError> {
        let session = self
            .state
            .lock()
            .await
            .session
            .clone()
            .ok_or(ConnectionError::DialFailed {
                target: self.target.clone(),
                reason: "no session to pull from".to_string(),
            })?;
        session.pull_file(remote, local).await
    }

    /// Idempotent; collects the first non-nil error encountered while
    /// closing the cached session, per §4.2.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.session.take() {
            session.close().await?;
        }
        state.reverse_forward_addr = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeSession {
        alive: AtomicBool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl SshSession for FakeSession {
        async fn ping(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn run_command(&self, _command: &str) -> Result<RemoteCommandOutput, ConnectionError> {
            Ok(RemoteCommandOutput {
                status: 0,
                stdout: b"boot-id-123".to_vec(),
                stderr: Vec::new(),
            })
        }

        async fn reverse_forward(&self, _wiring_addr: &str) -> Result<String, ConnectionError> {
            Ok("127.0.0.1:9999".to_string())
        }

        async fn pull_file(
            &self,
            _remote: &std::path::Path,
            _local: &std::path::Path,
        ) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), ConnectionError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeDialer {
        dial_attempts: AtomicU32,
        fail_first_n: u32,
    }

    #[async_trait]
    impl SshDialer for FakeDialer {
        async fn dial(
            &self,
            _target: &str,
            _key_file: &std::path::Path,
            _connect_timeout: Duration,
        ) -> Result<Arc<dyn SshSession>, ConnectionError> {
            let attempt = self.dial_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first_n {
                return Err(ConnectionError::DialFailed {
                    target: "dut".to_string(),
                    reason: "refused".to_string(),
                });
            }
            Ok(Arc::new(FakeSession {
                alive: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            }))
        }
    }

    fn cache(dialer: FakeDialer) -> ConnectionCache {
        ConnectionCache::new(
            "dut1",
            std::path::PathBuf::from("/tmp/key"),
            Arc::new(dialer),
            3,
            Duration::from_millis(1),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn first_acquire_dials_and_records_boot_id() {
        let cache = cache(FakeDialer {
            dial_attempts: AtomicU32::new(0),
            fail_first_n: 0,
        });
        let session = cache.acquire().await.unwrap();
        assert!(session.ping().await);
        assert_eq!(cache.initial_boot_id().await.as_deref(), Some("boot-id-123"));
    }

    #[tokio::test]
    async fn acquire_retries_on_dial_failure() {
        let cache = cache(FakeDialer {
            dial_attempts: AtomicU32::new(0),
            fail_first_n: 2,
        });
        let session = cache.acquire().await.unwrap();
        assert!(session.ping().await);
    }

    #[tokio::test]
    async fn acquire_gives_up_after_retry_count_exhausted() {
        let cache = cache(FakeDialer {
            dial_attempts: AtomicU32::new(0),
            fail_first_n: 10,
        });
        let err = cache.acquire().await.unwrap_err();
        assert!(matches!(err, ConnectionError::DialFailed { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let cache = cache(FakeDialer {
            dial_attempts: AtomicU32::new(0),
            fail_first_n: 0,
        });
        cache.acquire().await.unwrap();
        cache.close().await.unwrap();
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn reverse_forward_is_cached() {
        let cache = cache(FakeDialer {
            dial_attempts: AtomicU32::new(0),
            fail_first_n: 0,
        });
        cache.acquire().await.unwrap();
        let addr1 = cache.ensure_reverse_forward("wiring:1234").await.unwrap();
        let addr2 = cache.ensure_reverse_forward("wiring:1234").await.unwrap();
        assert_eq!(addr1, addr2);
    }
}
