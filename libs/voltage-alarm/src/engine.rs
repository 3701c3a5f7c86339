//! Engine assembly and lifecycle
//!
//! Builds the service, partition coordinator, ingest loop and harvester over
//! one shared [`AlarmEngineContext`] and owns their tasks.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::{AlarmEngineContext, Collaborators};
use crate::harvest::Harvester;
use crate::ingest::IngestLoop;
use crate::partition::{PartitionChangeEvent, PartitionChangeSummary, PartitionCoordinator, PartitionOwnership};
use crate::service::AlarmRuleStateService;
use crate::traits::QueueConsumer;

/// Engine timing and concurrency settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmEngineConfig {
    pub poll_interval: Duration,
    pub pack_processing_timeout: Duration,
    pub harvest_interval: Duration,
    pub worker_threads: usize,
}

impl Default for AlarmEngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(25),
            pack_processing_timeout: Duration::from_millis(60_000),
            harvest_interval: Duration::from_secs(60),
            worker_threads: 8,
        }
    }
}

pub struct AlarmEngine {
    ctx: Arc<AlarmEngineContext>,
    service: Arc<AlarmRuleStateService>,
    coordinator: PartitionCoordinator,
    ingest: Arc<IngestLoop>,
    harvester: Arc<Harvester>,
    consumer: Arc<dyn QueueConsumer>,
    workers: Arc<Semaphore>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AlarmEngine {
    pub fn new(
        config: AlarmEngineConfig,
        collaborators: Collaborators,
        ownership: Arc<PartitionOwnership>,
        consumer: Arc<dyn QueueConsumer>,
    ) -> Self {
        let ctx = Arc::new(AlarmEngineContext::new(collaborators, ownership));
        let service = Arc::new(AlarmRuleStateService::new(Arc::clone(&ctx)));
        let workers = Arc::new(Semaphore::new(config.worker_threads.max(1)));

        Self {
            coordinator: PartitionCoordinator::new(Arc::clone(&service), Arc::clone(&consumer)),
            ingest: Arc::new(IngestLoop::new(
                Arc::clone(&service),
                Arc::clone(&consumer),
                Arc::clone(&workers),
                config.poll_interval,
                config.pack_processing_timeout,
            )),
            harvester: Arc::new(Harvester::new(Arc::clone(&ctx), config.harvest_interval)),
            ctx,
            service,
            consumer,
            workers,
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<AlarmEngineContext> {
        &self.ctx
    }

    pub fn service(&self) -> &Arc<AlarmRuleStateService> {
        &self.service
    }

    pub fn ingest(&self) -> &Arc<IngestLoop> {
        &self.ingest
    }

    pub fn harvester(&self) -> &Arc<Harvester> {
        &self.harvester
    }

    pub async fn on_partition_change(&self, event: PartitionChangeEvent) -> PartitionChangeSummary {
        self.coordinator.on_partition_change(event).await
    }

    /// Spawn the ingest loop and the harvester
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Alarm engine already started");
            return;
        }
        tasks.push(tokio::spawn(
            Arc::clone(&self.ingest).run(self.token.child_token()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.harvester).run(self.token.child_token()),
        ));
        info!("Alarm engine started");
    }

    /// Stop consuming, close the worker pool and stop the harvester
    ///
    /// Work already running in the pool is not drained.
    pub async fn stop(&self) {
        self.token.cancel();
        if let Err(e) = self.consumer.unsubscribe().await {
            warn!("Failed to unsubscribe alarm rules consumer: {}", e);
        }
        self.workers.close();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Alarm engine task ended abnormally: {}", e);
            }
        }
        info!("Alarm engine stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && !self.tasks.lock().is_empty()
    }
}
