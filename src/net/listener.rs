//! TCP listener with a bounded worker pool.
//!
//! # Responsibilities
//! - Bind the preferred port, falling back to an ephemeral port when taken
//! - Accept incoming TCP connections
//! - Enforce the worker pool capacity via semaphore
//! - Graceful handling of accept errors

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(std::io::Error),
    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(std::io::Error),
    /// The worker pool was shut down.
    #[error("Worker pool closed")]
    PoolClosed,
}

/// A bounded TCP listener that limits concurrently served connections.
///
/// Uses a semaphore sized to the worker pool. When every worker is busy, new
/// connections wait in the kernel backlog until a slot becomes available.
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Semaphore to limit concurrent workers.
    workers: Arc<Semaphore>,
    /// Configured worker capacity.
    max_workers: usize,
}

impl Listener {
    /// Bind `host:port`, or `host:0` if that fails.
    pub async fn bind(host: &str, port: u16, max_workers: usize) -> Result<Self, ListenerError> {
        let listener = match TcpListener::bind((host, port)).await {
            Ok(l) => l,
            Err(e) if port != 0 => {
                tracing::warn!(
                    host = %host,
                    port,
                    error = %e,
                    "Preferred port unavailable, falling back to an ephemeral port"
                );
                TcpListener::bind((host, 0)).await.map_err(ListenerError::Bind)?
            }
            Err(e) => return Err(ListenerError::Bind(e)),
        };

        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_workers,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        })
    }

    /// Accept a new connection, respecting the worker pool capacity.
    ///
    /// This will wait if every worker is busy.
    /// Returns the stream and a permit that must be held while the connection is served.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, WorkerPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::PoolClosed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_workers = self.workers.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, WorkerPermit { _permit: permit }))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Get current idle worker slots.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Get configured worker capacity.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

/// A permit representing a worker slot.
///
/// When dropped, the slot is released back to the pool. This happens when
/// the connection closes or when it is handed to a WebSocket task.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_when_port_taken() {
        let first = Listener::bind("127.0.0.1", 0, 4).await.unwrap();
        let taken = first.local_addr().unwrap().port();

        let second = Listener::bind("127.0.0.1", taken, 4).await.unwrap();
        let port = second.local_addr().unwrap().port();
        assert_ne!(port, taken);
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn permits_bound_workers() {
        let listener = Listener::bind("127.0.0.1", 0, 1).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, _peer, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_workers(), 0);

        drop(permit);
        assert_eq!(listener.available_workers(), 1);
        assert_eq!(listener.max_workers(), 1);
    }
}
