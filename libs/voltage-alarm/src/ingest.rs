//! Queue consumption loop
//!
//! One driver task polls the consumer, hands the pack to a bounded worker
//! pool (a semaphore over spawned tasks) and waits for the whole pack up to
//! the pack processing timeout before committing. Records of one entity are
//! handled by a single task in arrival order; different entities run in
//! parallel.
//!
//! On timeout the outstanding tasks are left running, not cancelled, and the
//! pack is committed anyway: a record whose work had not finished counts as
//! consumed.

use futures::future::join_all;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ids::EntityId;
use crate::message::AlarmRuleStateMsg;
use crate::service::AlarmRuleStateService;
use crate::traits::{QueueConsumer, QueueRecord};

/// Counters of one processed pack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackStats {
    pub records: usize,
    pub undecodable: usize,
    pub failed: usize,
    pub timed_out: bool,
}

pub struct IngestLoop {
    service: Arc<AlarmRuleStateService>,
    consumer: Arc<dyn QueueConsumer>,
    workers: Arc<Semaphore>,
    poll_interval: Duration,
    pack_processing_timeout: Duration,
}

impl IngestLoop {
    pub fn new(
        service: Arc<AlarmRuleStateService>,
        consumer: Arc<dyn QueueConsumer>,
        workers: Arc<Semaphore>,
        poll_interval: Duration,
        pack_processing_timeout: Duration,
    ) -> Self {
        Self {
            service,
            consumer,
            workers,
            poll_interval,
            pack_processing_timeout,
        }
    }

    /// Run until `token` is cancelled or the consumer stops
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("Alarm rules consumer started");

        while !token.is_cancelled() && !self.consumer.is_stopped() {
            let polled = tokio::select! {
                () = token.cancelled() => break,
                polled = self.consumer.poll(self.poll_interval) => polled,
            };

            let outcome = match polled {
                Ok(records) if records.is_empty() => continue,
                Ok(records) => {
                    // Stopping mid-pack skips the commit; the pack is redelivered
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = self.process_pack(records) => {},
                    }
                    self.consumer.commit().await
                },
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                if self.consumer.is_stopped() {
                    break;
                }
                warn!("Failed to process messages from queue: {}", e);
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(self.poll_interval) => {},
                }
            }
        }

        info!("Alarm rules consumer stopped");
    }

    /// Dispatch one pack and wait for it, bounded by the pack timeout
    ///
    /// Records are grouped by entity; each group runs as one unit of work
    /// that handles its records in arrival order. Undecodable records are
    /// logged and counted as processed.
    pub async fn process_pack(&self, records: Vec<QueueRecord>) -> PackStats {
        let mut stats = PackStats {
            records: records.len(),
            ..PackStats::default()
        };
        let failed = Arc::new(AtomicUsize::new(0));

        let mut groups: Vec<Vec<AlarmRuleStateMsg>> = Vec::new();
        let mut group_of: FxHashMap<EntityId, usize> = FxHashMap::default();
        for record in records {
            let msg = match AlarmRuleStateMsg::decode(&record.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("[{}] Skipping undecodable alarm rules record: {}", record.tpi, e);
                    stats.undecodable += 1;
                    continue;
                },
            };
            let idx = *group_of.entry(msg.entity_id()).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[idx].push(msg);
        }

        let mut tasks = Vec::with_capacity(groups.len());
        for msgs in groups {
            let service = Arc::clone(&self.service);
            let workers = Arc::clone(&self.workers);
            let failed = Arc::clone(&failed);
            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = workers.acquire_owned().await else {
                    debug!("Worker pool closed, dropping {} alarm rules records", msgs.len());
                    return;
                };
                for msg in msgs {
                    let tenant_id = msg.tenant_id();
                    let entity_id = msg.entity_id();
                    if let Err(e) = service.handle(msg).await {
                        failed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "[{}] [{}] Failed to process alarm rules message: {}",
                            tenant_id, entity_id, e
                        );
                    }
                }
            }));
        }

        if tokio::time::timeout(self.pack_processing_timeout, join_all(tasks))
            .await
            .is_err()
        {
            warn!("Timeout for processing the alarm rules tasks");
            stats.timed_out = true;
        }

        stats.failed = failed.load(Ordering::Relaxed);
        stats
    }
}
