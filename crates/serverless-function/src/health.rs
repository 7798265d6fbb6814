//! Liveness probing through the reconciler
//!
//! A probe enqueues a reconcile for a sentinel name that can never belong to
//! a real object (longer than the 253 character name limit). The reconciler
//! recognises it, skips all stages and acknowledges over a bounded channel.
//! A probe that is not acknowledged within the timeout fails.

use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// Name the health probe reconciles
pub static HEALTH_CHECK_NAME: Lazy<String> =
    Lazy::new(|| format!("health-check-{}", "x".repeat(256)));

/// Namespace the health probe reconciles in
pub const HEALTH_CHECK_NAMESPACE: &str = "health-check";

/// True for the sentinel name
pub fn is_health_check(name: &str) -> bool {
    name == HEALTH_CHECK_NAME.as_str()
}

/// Health probe failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    /// Another probe request is still queued
    #[error("health check queue is full")]
    QueueFull,

    /// The reconciler did not acknowledge in time
    #[error("health check not acknowledged within {0:?}")]
    Timeout(Duration),

    /// The worker or the reconciler side is gone
    #[error("health check channel closed")]
    Closed,
}

/// Probe side: requests a sentinel reconcile and waits for the acknowledgement
pub struct HealthChecker {
    requests: mpsc::Sender<()>,
    acks: Mutex<mpsc::Receiver<()>>,
    timeout: Duration,
}

/// Reconciler side: acknowledges sentinel reconciles
#[derive(Clone, Debug)]
pub struct HealthResponder {
    acks: mpsc::Sender<()>,
    timeout: Duration,
}

/// Wire a checker to a responder
///
/// The returned receiver yields one item per probe and must be served by a
/// worker that reconciles [`HEALTH_CHECK_NAME`].
pub fn health_channels(timeout: Duration) -> (HealthChecker, HealthResponder, mpsc::Receiver<()>) {
    let (request_tx, request_rx) = mpsc::channel(1);
    let (ack_tx, ack_rx) = mpsc::channel(1);
    (
        HealthChecker {
            requests: request_tx,
            acks: Mutex::new(ack_rx),
            timeout,
        },
        HealthResponder {
            acks: ack_tx,
            timeout,
        },
        request_rx,
    )
}

impl HealthChecker {
    /// Run one probe
    pub async fn check(&self) -> Result<(), HealthError> {
        let mut acks = self.acks.lock().await;
        // Acknowledgements from probes that already timed out
        while acks.try_recv().is_ok() {}

        self.requests.try_send(()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HealthError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => HealthError::Closed,
        })?;

        match timeout(self.timeout, acks.recv()).await {
            Ok(Some(())) => Ok(()),
            Ok(None) => Err(HealthError::Closed),
            Err(_) => Err(HealthError::Timeout(self.timeout)),
        }
    }
}

impl HealthResponder {
    /// Acknowledge one probe, giving up after the timeout
    pub async fn acknowledge(&self) -> Result<(), HealthError> {
        self.acks
            .send_timeout((), self.timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => HealthError::Timeout(self.timeout),
                mpsc::error::SendTimeoutError::Closed(_) => HealthError::Closed,
            })
    }
}
