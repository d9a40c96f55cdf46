// MIT License - Copyright (c) 2021 TJForc
// Periodic resubscription

use std::sync::Arc;

use tokio::sync::Barrier;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::TesiraClient;
use crate::config::SubscriptionSet;

/// Re-run subscribe-all every `interval` so subscriptions the device dropped come back.
///
/// Waits at `ready` first, so the cycle starts together with the other long-running
/// loops. Errors are logged and the next cycle still runs; the loop ends when `cancel`
/// fires or the client's session is gone.
pub async fn resubscribe_on_schedule(
    client: TesiraClient,
    subscriptions: SubscriptionSet,
    interval: Duration,
    ready: Arc<Barrier>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = ready.wait() => {}
    }
    info!("Starting Tesira subscription setting loop");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }

        debug!("Refreshing {} subscription(s)", subscriptions.len());
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = client.subscribe_all(subscriptions.as_slice()) => result,
        };

        match result {
            Ok(report) if report.is_complete() => {}
            Ok(report) => warn!(
                "Resubscription finished with {} failure(s)",
                report.failed.len()
            ),
            Err(e) if e.is_connection() => {
                warn!("Resubscription stopped: {}", e);
                break;
            }
            Err(e) => warn!("Resubscription failed: {}", e),
        }
    }
    debug!("Resubscription loop stopped");
}
