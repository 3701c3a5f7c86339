//! Periodic alarm harvesting
//!
//! Sweeps every live entity state at a fixed interval so duration
//! conditions advance without new messages. Runs on its own task beside the
//! ingest loop; an entity whose snapshot write fails still publishes its
//! events and never stops the sweep.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::AlarmEngineContext;

/// Counters of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestStats {
    pub entities: usize,
    pub events: usize,
    /// Entities whose snapshot write failed; their events were still published
    pub unpersisted: usize,
}

pub struct Harvester {
    ctx: Arc<AlarmEngineContext>,
    interval: Duration,
}

impl Harvester {
    pub fn new(ctx: Arc<AlarmEngineContext>, interval: Duration) -> Self {
        Self { ctx, interval }
    }

    /// Sweep every `interval` until `token` is cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("Alarm harvester started, interval {:?}", self.interval);
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let now = self.ctx.clock.now_millis();
                    let stats = self.harvest_once(now).await;
                    debug!(
                        "Harvested {} entities: {} alarm events, {} unpersisted",
                        stats.entities, stats.events, stats.unpersisted
                    );
                },
            }
        }

        info!("Alarm harvester stopped");
    }

    /// One sweep over the registry at `now`
    pub async fn harvest_once(&self, now: i64) -> HarvestStats {
        let mut stats = HarvestStats::default();
        for state in self.ctx.registry.snapshot() {
            stats.entities += 1;
            let harvest = state.harvest_alarms(now).await;
            stats.events += harvest.events;
            if !harvest.persisted {
                stats.unpersisted += 1;
            }
        }
        stats
    }
}
