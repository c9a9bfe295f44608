use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::session::SessionRegistry;

/// Periodic sweep that kills sessions idle for longer than a configured
/// max age.
///
/// This is the only defense against unbounded resource growth from
/// abandoned interactive sessions. Both the sweep interval and the max age
/// are policy knobs supplied by configuration, not constants.
pub struct IdleReaper {
    registry: SessionRegistry,
    interval: Duration,
    max_age: Duration,
}

impl IdleReaper {
    pub fn new(registry: SessionRegistry, interval: Duration, max_age: Duration) -> Self {
        Self {
            registry,
            interval,
            max_age,
        }
    }

    /// Run the sweep loop until `cancel` fires. Spawn this on the runtime.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep(&self.registry, self.max_age);
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

/// One reaper tick: kill every session whose last activity is older than
/// `max_age`, leave fresher sessions untouched.
pub fn sweep(registry: &SessionRegistry, max_age: Duration) -> usize {
    let stale: Vec<String> = registry
        .list()
        .into_iter()
        .filter_map(|info| {
            let session = registry.get(&info.id)?;
            (session.activity.idle_for() >= max_age).then_some(info.id)
        })
        .collect();

    let mut reaped = 0;
    for id in stale {
        if registry.kill(&id) {
            tracing::info!(session = %id, "reaped idle session");
            reaped += 1;
        }
    }
    reaped
}
