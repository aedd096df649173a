//! The token lifetime watcher.
//!
//! One task per live non-clone client. The loop sleeps until a
//! provider-computed fraction of the lease has elapsed, renews, and
//! re-arms. Renewal errors get one retry when transient; a terminal error
//! is recorded on the client and announced as a `WatcherDone` lifecycle
//! event, after which the task exits. The task holds only a `Weak`
//! reference so a dropped client tears its watcher down with it.

use super::{ClientEvent, LifecycleEvent, VaultClient};
use rand::Rng;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Renew once this fraction of the lease has elapsed
pub const DEFAULT_RENEWAL_PERCENT: f64 = 0.67;

/// Jitter added on top of the renewal fraction, as a fraction of the lease
const JITTER_PERCENT: f64 = 0.05;

/// The renewal fraction never exceeds this, jitter included
const MAX_RENEWAL_PERCENT: f64 = 0.90;

/// Fallback sleep when the lease duration is unknown
const UNKNOWN_LEASE_HORIZON: Duration = Duration::from_secs(30);

/// Grace period before retrying a transient renewal failure
const RETRY_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct WatcherHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WatcherHandle {
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished() && !self.cancel.is_cancelled()
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sleep horizon for a lease of `ttl_secs`: 67% of the lease plus jitter,
/// clamped to at most 90%.
pub(crate) fn horizon(ttl_secs: u64) -> Duration {
    if ttl_secs == 0 {
        return UNKNOWN_LEASE_HORIZON;
    }
    let jitter = rand::thread_rng().gen_range(0.0..JITTER_PERCENT);
    let fraction = (DEFAULT_RENEWAL_PERCENT + jitter).clamp(0.0, MAX_RENEWAL_PERCENT);
    Duration::from_secs_f64(ttl_secs as f64 * fraction)
}

pub(crate) fn spawn(client: &Arc<VaultClient>) -> WatcherHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let weak = Arc::downgrade(client);
    let client_id = client.id().to_string();
    let handle = tokio::spawn(async move {
        run(weak, task_cancel).await;
        debug!(client_id = %client_id, "lifetime watcher exited");
    });
    WatcherHandle { cancel, handle }
}

async fn run(client: Weak<VaultClient>, cancel: CancellationToken) {
    loop {
        let Some(strong) = client.upgrade() else {
            return;
        };
        let sleep_for = strong.renewal_horizon();
        drop(strong);

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(sleep_for) => {}
        }

        let Some(strong) = client.upgrade() else {
            return;
        };
        match renew_with_retry(&strong, &cancel).await {
            Ok(()) => {}
            Err(RenewOutcome::Cancelled) => return,
            Err(RenewOutcome::Terminal(err)) => {
                warn!(
                    client_id = %strong.id(),
                    error = %err,
                    "lifetime watcher terminating"
                );
                strong.record_watcher_error(&err);
                strong
                    .emit(LifecycleEvent::new(
                        ClientEvent::WATCHER_DONE,
                        Arc::clone(&strong),
                    ))
                    .await;
                return;
            }
        }
    }
}

enum RenewOutcome {
    Cancelled,
    Terminal(crate::core::error::ClientError),
}

async fn renew_with_retry(
    client: &Arc<VaultClient>,
    cancel: &CancellationToken,
) -> Result<(), RenewOutcome> {
    match client.renew().await {
        Ok(()) => return Ok(()),
        Err(first) if first.is_retryable() => {
            debug!(client_id = %client.id(), error = %first, "renewal failed, retrying once");
            tokio::select! {
                () = cancel.cancelled() => return Err(RenewOutcome::Cancelled),
                () = tokio::time::sleep(RETRY_GRACE) => {}
            }
        }
        Err(first) => return Err(RenewOutcome::Terminal(first)),
    }
    client.renew().await.map_err(RenewOutcome::Terminal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horizon_stays_within_lease_bounds() {
        for _ in 0..64 {
            let h = horizon(100).as_secs_f64();
            assert!(h >= 100.0 * DEFAULT_RENEWAL_PERCENT);
            assert!(h <= 100.0 * MAX_RENEWAL_PERCENT);
        }
    }

    #[test]
    fn unknown_lease_uses_fallback() {
        assert_eq!(horizon(0), UNKNOWN_LEASE_HORIZON);
    }
}
