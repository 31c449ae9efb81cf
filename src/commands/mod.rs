//! Subcommand implementations for the `mawaqit` binary

pub mod admin;
pub mod run;

use anyhow::{Context, Result};
use std::sync::Arc;

use mawaqit::cache::PrayerTimeCache;
use mawaqit::config::Config;
use mawaqit::groups::ActiveGroupsManager;
use mawaqit::health::HealthMonitor;
use mawaqit::resolver::TimesResolver;
use mawaqit::scheduler::{PeriodicPlan, ScheduleComputer};
use mawaqit::source::TimeSourceClient;
use mawaqit::storage::Repositories;

pub use admin::{fetch, group, health, purge, schedule, GroupAction};
pub use run::run;

/// Components shared by every subcommand, wired from one config
pub struct Services {
    pub config: Config,
    pub health: Arc<HealthMonitor>,
    pub cache: Arc<PrayerTimeCache>,
    pub resolver: Arc<TimesResolver>,
    pub groups: ActiveGroupsManager,
    pub computer: ScheduleComputer,
}

impl Services {
    pub async fn build(config: Config) -> Result<Self> {
        if let Some(parent) = config.storage.sqlite_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
        }

        let repos = Repositories::sqlite(&config.storage.sqlite_path)?;

        let health = HealthMonitor::from_config(&config.health)
            .context("Failed to build alert channels")?
            .with_repository(repos.health.clone());
        let restored = health.restore().await?;
        let health = Arc::new(health);

        let client = Arc::new(TimeSourceClient::from_config(&config, health.clone()).await?);

        let cache = Arc::new(PrayerTimeCache::new(
            repos.prayer_times.clone(),
            config.cache.clone(),
        ));
        if let Some(path) = &config.cache.snapshot_path {
            if path.exists() {
                let imported = cache.import_snapshot(path).await?;
                tracing::info!(path = %path.display(), imported, "Cache snapshot imported");
            }
        }
        let warmed = cache.warm().await?;

        let resolver = Arc::new(TimesResolver::new(
            cache.clone(),
            client,
            health.clone(),
            config.sources.location.clone(),
        ));

        let groups = ActiveGroupsManager::new(repos.groups.clone(), repos.ledger.clone())
            .with_default_timezone(config.scheduler.default_timezone.clone());

        let computer = ScheduleComputer::new(PeriodicPlan::from_config(&config.scheduler)?);

        tracing::debug!(restored, warmed, "Services ready");

        Ok(Self {
            config,
            health,
            cache,
            resolver,
            groups,
            computer,
        })
    }
}
