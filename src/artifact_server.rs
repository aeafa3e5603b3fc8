//! Ephemeral Artifact Server (C3): a loopback HTTP cache started on demand
//! when no external devserver is configured. Modeled on the same
//! `axum::Router` + `axum::Server::bind(..).serve(..)` idiom used for this
//! codebase's metrics endpoint.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Router, Server};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct ServerState {
    root: PathBuf,
    allowed_buckets: Vec<String>,
}

/// A running loopback artifact cache. Dropping this (after calling
/// [`EphemeralArtifactServer::shutdown`]) tears down the listener; it is
/// recreated whenever the SSH connection is rebuilt mid-run, per §4.3,
/// since the forwarded port it relies on no longer exists.
pub struct EphemeralArtifactServer {
    pub local_addr: SocketAddr,
    handle: JoinHandle<()>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl EphemeralArtifactServer {
    /// Binds a loopback TCP port and starts serving `root` as a read-through
    /// file cache for the given allowed buckets. Only created when (a) no
    /// external artifact server is configured, (b) remote tests are being
    /// run, and (c) the run policy allows it — that policy decision is the
    /// caller's, not this constructor's.
    pub async fn start(root: PathBuf, allowed_buckets: Vec<String>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(ServerState {
            root,
            allowed_buckets,
        });

        let app = Router::new()
            .route("/:bucket/*path", get(serve_artifact))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let std_listener = listener.into_std()?;
        let handle = tokio::spawn(async move {
            let server = Server::from_tcp(std_listener)
                .expect("valid std listener")
                .serve(app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                });
            if let Err(e) = server.await {
                warn!(error = %e, "ephemeral artifact server exited with error");
            }
        });

        info!(%local_addr, "ephemeral artifact server listening");

        Ok(EphemeralArtifactServer {
            local_addr,
            handle,
            shutdown_tx,
        })
    }

    /// URL prepended to the effective devserver list for the run's
    /// duration (§3 Run State, §4.3).
    pub fn url(&self) -> String {
        format!("http://{}/", self.local_addr)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

async fn serve_artifact(
    State(state): State<Arc<ServerState>>,
    AxumPath((bucket, rel_path)): AxumPath<(String, String)>,
) -> Result<Vec<u8>, StatusCode> {
    if !state.allowed_buckets.iter().any(|b| b == &bucket) {
        return Err(StatusCode::FORBIDDEN);
    }

    let full_path = safe_join(&state.root, &bucket, &rel_path).ok_or(StatusCode::BAD_REQUEST)?;

    tokio::fs::read(&full_path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)
}

/// Joins `root/bucket/rel_path`, rejecting any `rel_path` that would escape
/// `root` via `..` components.
fn safe_join(root: &Path, bucket: &str, rel_path: &str) -> Option<PathBuf> {
    let candidate = root.join(bucket).join(rel_path);
    let bucket_root = root.join(bucket);
    let mut depth: i32 = 0;
    for component in Path::new(rel_path).components() {
        match component {
            std::path::Component::ParentDir => depth -= 1,
            std::path::Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return None;
        }
    }
    Some(bucket_root.join(candidate.strip_prefix(&bucket_root).ok()?))
}
