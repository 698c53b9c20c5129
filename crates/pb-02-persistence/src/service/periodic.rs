use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Run `action` every `period` until `shutdown` turns `true`.
///
/// The first run happens one period after the call. A slow run delays the
/// next tick instead of bursting to catch up.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut action: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(action = name, period_ms = period.as_millis() as u64, "Periodic action started");

    loop {
        tokio::select! {
            _ = interval.tick() => action().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(action = name, "Periodic action stopped");
}
