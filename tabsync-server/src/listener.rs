//! TCP accept loop.
//!
//! Binding is the only step whose failure is fatal to the process. After
//! that every connection runs in its own task and can only fail itself.

use crate::error::{Result, ServerError};
use crate::limits::spawn_limiter_cleanup;
use crate::server::TableServer;
use crate::session::Session;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Aborts a background task when the accept loop exits or is dropped.
struct BackgroundTask(JoinHandle<()>);

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A bound TCP listener.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind to `addr`.
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { inner })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn serve(self, server: Arc<TableServer>) -> Result<()> {
        self.serve_with_shutdown(server, std::future::pending())
            .await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Sessions already running are left to finish on their own. The
    /// limiter cleanup task runs for as long as the loop does.
    pub async fn serve_with_shutdown<F>(self, server: Arc<TableServer>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let _cleanup = BackgroundTask(spawn_limiter_cleanup(
            server.rate_limits().clone(),
            server.config().limits.cleanup_interval(),
        ));
        if let Ok(addr) = self.inner.local_addr() {
            tracing::info!("Listening on {}", addr);
        }

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Listener shutting down");
                    return Ok(());
                }
                accepted = self.inner.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => admit(&server, stream, peer),
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Apply admission limits and spawn the session task.
fn admit(server: &Arc<TableServer>, stream: TcpStream, peer: SocketAddr) {
    let metrics = server.metrics();
    metrics.connections_total.fetch_add(1, Ordering::Relaxed);

    if let Err(e) = server.rate_limits().check_connection(&peer.ip()) {
        metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Refusing {}: {}", peer, e);
        return;
    }
    let permit = match server.rate_limits().acquire_session() {
        Ok(permit) => permit,
        Err(e) => {
            metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Refusing {}: {}", peer, e);
            return;
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }

    let server = server.clone();
    let span = tracing::info_span!("connection", peer = %peer);
    tokio::spawn(
        async move {
            let _permit = permit;
            tracing::debug!("Accepted connection");
            if let Err(e) = Session::new(server, peer).run(stream).await {
                tracing::debug!("Connection ended with error: {}", e);
            }
        }
        .instrument(span),
    );
}
