use super::supervisor::WhatsAppSession;
use crate::channels::traits::ReadyState;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One sample taken by the liveness monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LivenessProbe {
    Healthy,
    Unhealthy(ReadyState),
    /// The monitored socket is no longer the installed one.
    Stale,
}

/// Why a monitor loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitorExit {
    Cancelled,
    Stale,
    /// Failure threshold reached; a forced reconnect was requested.
    Escalated,
}

/// Something the monitor can sample and escalate to.
pub(crate) trait LivenessTarget: Send + Sync + 'static {
    fn probe(&self, generation: u64) -> LivenessProbe;
    fn escalate(&self, generation: u64);
}

impl LivenessTarget for WhatsAppSession {
    fn probe(&self, generation: u64) -> LivenessProbe {
        self.probe_liveness(generation)
    }

    fn escalate(&self, generation: u64) {
        self.request_forced_reconnect(generation);
    }
}

/// Periodic transport check bound to one socket generation.
pub(crate) struct LivenessMonitor {
    cancel: CancellationToken,
}

impl LivenessMonitor {
    pub(crate) fn spawn<T: LivenessTarget>(
        target: T,
        generation: u64,
        interval: Duration,
        threshold: u32,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            let exit = run(&target, generation, interval, threshold, token).await;
            tracing::debug!("WhatsApp Web: keepalive for socket {generation} ended: {exit:?}");
        });
        tracing::info!(
            "WhatsApp Web: keepalive started (every {}s)",
            interval.as_secs()
        );
        Self { cancel }
    }

    pub(crate) fn stop(self) {
        self.cancel.cancel();
    }
}

/// Sample every `interval` (first sample one interval after start) and
/// escalate after `threshold` consecutive unhealthy samples.
pub(crate) async fn run<T: LivenessTarget>(
    target: &T,
    generation: u64,
    interval: Duration,
    threshold: u32,
    cancel: CancellationToken,
) -> MonitorExit {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0_u32;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return MonitorExit::Cancelled,
            _ = ticker.tick() => {}
        }

        match target.probe(generation) {
            LivenessProbe::Stale => return MonitorExit::Stale,
            LivenessProbe::Healthy => failures = 0,
            LivenessProbe::Unhealthy(ready) => {
                failures += 1;
                tracing::warn!(
                    "WhatsApp Web: socket not open (state: {ready}), failure {failures}/{threshold}"
                );
                if failures >= threshold {
                    if cancel.is_cancelled() {
                        return MonitorExit::Cancelled;
                    }
                    tracing::error!(
                        "WhatsApp Web: socket unhealthy for {threshold} checks, forcing reconnect"
                    );
                    target.escalate(generation);
                    return MonitorExit::Escalated;
                }
            }
        }
    }
}
