//! Service wiring and lifecycle

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use voltage_alarm::memory::HashPartitionResolver;
use voltage_alarm::{
    AlarmEngine, Collaborators, KeyFilterEvaluator, PartitionChangeEvent, PartitionOwnership,
    SystemTimeProvider,
};

use crate::catalog_file::{CatalogSummary, FileCatalog};
use crate::config::Config;
use crate::redis::{self as store, KeySpace, RedisAlarmSink, RedisQueueConsumer, RedisStateStore};
use crate::shutdown::wait_for_shutdown;

/// Everything `run` starts, assembled over a connected pool
pub struct AlarmService {
    pub engine: AlarmEngine,
    pub resolver: Arc<HashPartitionResolver>,
    pub consumer: Arc<RedisQueueConsumer>,
}

impl AlarmService {
    pub async fn build(config: &Config) -> Result<Self> {
        let catalog = FileCatalog::load(&config.catalog.rules_file)?;
        log_summary(catalog.summary());

        let pool = store::connect(&config.redis).await?;
        let keys = KeySpace::new(config.redis.key_prefix.clone());

        let ownership = Arc::new(PartitionOwnership::new());
        let resolver = Arc::new(HashPartitionResolver::new(
            config.queue.topic.clone(),
            config.queue.partitions,
            Arc::clone(&ownership),
        ));
        let consumer = Arc::new(RedisQueueConsumer::new(
            Arc::clone(&pool),
            keys.clone(),
            config.queue.max_poll_records,
        ));

        let collaborators = Collaborators {
            rule_source: catalog.rule_source(),
            device_profiles: catalog.device_profiles(),
            asset_profiles: catalog.asset_profiles(),
            store: Arc::new(RedisStateStore::new(
                Arc::clone(&pool),
                keys.clone(),
                resolver.clone(),
            )),
            resolver: resolver.clone(),
            sink: Arc::new(RedisAlarmSink::new(pool, &keys)),
            evaluator: Arc::new(KeyFilterEvaluator),
            clock: Arc::new(SystemTimeProvider),
        };
        let engine = AlarmEngine::new(
            config.engine_config(),
            collaborators,
            ownership,
            consumer.clone(),
        );

        Ok(Self {
            engine,
            resolver,
            consumer,
        })
    }

    /// Claim every partition; a standalone node owns the whole topic
    pub async fn claim_all_partitions(&self) {
        let summary = self
            .engine
            .on_partition_change(PartitionChangeEvent::new(self.resolver.all_partitions()))
            .await;
        info!(
            "Claimed {} partitions, restored {} entity states",
            summary.added, summary.restored
        );
    }

    pub async fn stop(&self) {
        self.engine.stop().await;
        self.consumer.stop();
    }
}

/// `alarmsrv run`
pub async fn run(config: Config) -> Result<()> {
    info!(
        "Starting {} (topic {}, {} partitions, {} workers)",
        config.service.name, config.queue.topic, config.queue.partitions, config.queue.worker_threads
    );

    let service = AlarmService::build(&config)
        .await
        .context("Failed to build alarm service")?;
    service.claim_all_partitions().await;
    service.engine.start();

    wait_for_shutdown().await;
    info!("Shutdown signal received");

    service.stop().await;
    info!("{} stopped", config.service.name);
    Ok(())
}

/// `alarmsrv check`: validate configuration and rules file
pub fn check(config: &Config) -> Result<CatalogSummary> {
    config.validate()?;
    let catalog = FileCatalog::load(&config.catalog.rules_file)?;
    Ok(catalog.summary().clone())
}

fn log_summary(summary: &CatalogSummary) {
    info!(
        "Loaded {} alarm rules ({} enabled) for {} tenants, {} devices, {} assets",
        summary.rules, summary.enabled, summary.tenants, summary.devices, summary.assets
    );
    for (rule_id, reason) in &summary.invalid {
        tracing::warn!("Alarm rule {} is invalid and will be skipped: {}", rule_id, reason);
    }
}
