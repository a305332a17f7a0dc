use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{run_configured_sync, SyncConfig, SyncRequest};

/// Admits one run at a time; a second caller is turned away instead of queued.
#[derive(Debug, Clone, Default)]
pub struct RunGuard(Arc<Mutex<()>>);

impl RunGuard {
    pub fn try_start(&self) -> Option<OwnedMutexGuard<()>> {
        self.0.clone().try_lock_owned().ok()
    }
}

/// Scheduler running `request` on `config.sync_cron`. Ticks that fire while a
/// run is still in flight are skipped.
pub async fn build_scheduler(
    config: Arc<SyncConfig>,
    request: SyncRequest,
    shutdown: CancellationToken,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let guard = RunGuard::default();
    let cron = config.sync_cron.clone();

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = config.clone();
        let request = request.clone();
        let guard = guard.clone();
        let shutdown = shutdown.clone();
        Box::pin(async move {
            let Some(_running) = guard.try_start() else {
                warn!(job = %request.job, "previous sync still running; skipping tick");
                return;
            };
            if shutdown.is_cancelled() {
                return;
            }
            match run_configured_sync(&config, &request, &shutdown).await {
                Ok(outcome) => info!(
                    run_id = %outcome.summary.run_id,
                    state = ?outcome.summary.final_state,
                    added = outcome.summary.counters.added,
                    "scheduled sync finished"
                ),
                Err(err) => error!("scheduled sync failed: {err:#}"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
