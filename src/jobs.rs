use crate::authz::Registry;
use crate::errors::AppError;
use crate::session::SessionStore;
use crate::settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(
    sessions: Arc<SessionStore>,
    registry: Arc<Registry>,
    settings: &Settings,
) -> Result<JobScheduler, AppError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| AppError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let idle_timeout = Duration::from_secs(settings.sessions.idle_timeout_secs);
    let sweep_job = Job::new_async(settings.sessions.sweep_schedule.as_str(), move |_uuid, _l| {
        let sessions = sessions.clone();
        Box::pin(async move {
            match sessions.sweep_idle(idle_timeout).await {
                Ok(0) => debug!("No idle sessions to sweep"),
                Ok(count) => info!("Swept {} idle sessions", count),
                Err(e) => error!("Failed to sweep idle sessions: {}", e),
            }
        })
    })
    .map_err(|e| AppError::Other(format!("Failed to create session sweep job: {}", e)))?;

    sched
        .add(sweep_job)
        .await
        .map_err(|e| AppError::Other(format!("Failed to add session sweep job: {}", e)))?;

    let refresh_job = Job::new_async(settings.authz.refresh_schedule.as_str(), move |_uuid, _l| {
        let registry = registry.clone();
        Box::pin(async move {
            if let Err(e) = registry.reload().await {
                error!("Failed to refresh registry snapshot: {}", e);
            }
        })
    })
    .map_err(|e| AppError::Other(format!("Failed to create registry refresh job: {}", e)))?;

    sched
        .add(refresh_job)
        .await
        .map_err(|e| AppError::Other(format!("Failed to add registry refresh job: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| AppError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!(
        sweep = %settings.sessions.sweep_schedule,
        refresh = %settings.authz.refresh_schedule,
        "Job scheduler started"
    );

    Ok(sched)
}
