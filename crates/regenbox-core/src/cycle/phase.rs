//! The polling loop every session mode is built on

use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{CycleError, Session};
use crate::driver::{ChargeState, Snapshot};

impl Session {
    /// Poll the box every `ticker` until `stop` yields a value, `timeout`
    /// elapses or the session is cancelled.
    ///
    /// Each tick takes a snapshot, skips the tick when the link is down,
    /// re-asserts `mode`, publishes the snapshot and only then evaluates `stop`.
    pub(crate) async fn run_phase<T>(
        &mut self,
        timeout: Duration,
        mode: ChargeState,
        mut stop: impl FnMut(&Snapshot) -> Option<T>,
    ) -> Result<T, CycleError> {
        let poll = self.config.ticker;
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CycleError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(CycleError::Timeout(timeout)),
                _ = ticker.tick() => {}
            }

            let snapshot = self.driver.snapshot().await;
            if !snapshot.is_connected() {
                debug!(state = %snapshot.state, "box not connected, skipping tick");
                continue;
            }

            // a reconnect may have left the box idle
            if let Err(e) = self.driver.set_charge_mode(mode).await {
                warn!(%mode, error = %e, "failed to re-assert charge mode");
            }

            self.publish(snapshot.clone()).await?;

            if let Some(done) = stop(&snapshot) {
                return Ok(done);
            }
        }
    }

    /// Hand a snapshot to the consumer, waiting at most the publish timeout
    async fn publish(&mut self, snapshot: Snapshot) -> Result<(), CycleError> {
        let Some(tx) = self.snapshots.as_ref() else {
            return Ok(());
        };
        let limit = self.driver.options().publish_timeout;

        let res = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CycleError::Cancelled),
            res = tx.send_timeout(snapshot, limit) => res,
        };
        match res {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => {
                debug!("snapshot consumer went away, detaching");
                self.snapshots = None;
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(after = ?limit, "snapshot consumer stalled");
                Err(CycleError::BackPressure(limit))
            }
        }
    }
}
