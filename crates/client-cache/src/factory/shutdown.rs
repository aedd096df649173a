//! Single-shot shutdown coordination.
//!
//! The operator signals shutdown out-of-band (a well-known ConfigMap
//! edit, or a direct call from the manager); the coordinator translates
//! that into one factory shutdown and reports `Pending → Done | Failed`.
//! Repeat signals after completion are no-ops.

use crate::core::error::FactoryError;
use crate::factory::{CachingClientFactory, ShutdownRequest};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// What to do with outstanding tokens on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Revoke every cached token and purge persisted records
    Revoke,
    /// Leave tokens to expire on their own
    NoRevoke,
}

/// Coordinator progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// No signal received yet
    Idle,
    /// Shutdown in progress
    Pending,
    /// Shutdown completed
    Done,
    /// Shutdown failed; the factory stays disabled
    Failed,
}

/// Translates an external shutdown signal into one factory shutdown
pub struct ShutdownCoordinator {
    factory: Arc<CachingClientFactory>,
    status: Mutex<ShutdownStatus>,
}

impl ShutdownCoordinator {
    /// Coordinator for `factory`
    pub fn new(factory: Arc<CachingClientFactory>) -> Self {
        Self {
            factory,
            status: Mutex::new(ShutdownStatus::Idle),
        }
    }

    /// Current progress
    pub fn status(&self) -> ShutdownStatus {
        *self.status.lock()
    }

    /// Handle one shutdown signal. Idempotent once `Done` or `Failed`.
    pub async fn signal(&self, mode: ShutdownMode) -> Result<ShutdownStatus, FactoryError> {
        {
            let mut status = self.status.lock();
            match *status {
                ShutdownStatus::Idle => *status = ShutdownStatus::Pending,
                current => return Ok(current),
            }
        }

        info!(?mode, "shutdown signal received");
        let result = self
            .factory
            .shutdown(ShutdownRequest {
                revoke: mode == ShutdownMode::Revoke,
            })
            .await;

        let next = match &result {
            Ok(()) => ShutdownStatus::Done,
            Err(e) => {
                error!(error = %e, "factory shutdown failed");
                ShutdownStatus::Failed
            }
        };
        *self.status.lock() = next;
        result.map(|()| next)
    }

    /// Consume external signals until one is handled or the root context
    /// is cancelled
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<ShutdownMode>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                mode = signals.recv() => match mode {
                    Some(mode) => {
                        let _ = self.signal(mode).await;
                        if matches!(self.status(), ShutdownStatus::Done | ShutdownStatus::Failed) {
                            return;
                        }
                    }
                    None => return,
                },
            }
        }
    }
}
