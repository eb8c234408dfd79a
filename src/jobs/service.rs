use chrono::Utc;
use serde_json::Value;
use sqlx::{Pool, Postgres};
use tracing::{debug, info, warn};

use crate::db::checkpoint_repository::CheckpointRepository;
use crate::db::job_repository::{JobRepository, JobStatistics, NewJob};
use crate::db::models::{CheckpointRow, JobMetadata, JobRow, ResumeCheckpointInfo};
use crate::error::EngineError;
use crate::jobs::checkpoint::{CheckpointDetail, CheckpointPayload, Phase};
use crate::jobs::status::JobStatus;

const DEFAULT_BATCH_SIZE: i64 = 100;

/// Outcome of `create_job`.
pub enum CreateOutcome {
    Created(JobRow),
    /// A crashed job already holds this id; creation is skipped and the
    /// caller should resume it instead.
    ExistingCrashed(JobRow),
}

/// Outcome of `resume_job`.
pub enum ResumeOutcome {
    Resuming {
        job: JobRow,
        previous_status: JobStatus,
        checkpoint: CheckpointRow,
    },
    /// The latest checkpoint already marks the extraction complete; the
    /// caller re-completes the job instead of relaunching it.
    AlreadyComplete {
        job: JobRow,
        records_processed: i64,
    },
}

/// Outcome of `complete_job`.
pub enum CompleteOutcome {
    Completed(JobRow),
    /// The status moved away from `running` before completion committed
    /// (a concurrent cancellation wins this race).
    Superseded { status: String },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub job: JobRow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_info: Option<CheckpointInfo>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckpointInfo {
    pub latest_checkpoint: CheckpointRow,
    pub progress: Option<f64>,
}

/// The job lifecycle state machine, executed against the shared store.
///
/// All status mutation in the system goes through this service (the crash
/// sweep's direct store write included, since it lives here too). Guards
/// are checked against a fresh read for error reporting and re-enforced
/// inside each conditional UPDATE for linearization.
#[derive(Clone)]
pub struct JobService {
    pool: Pool<Postgres>,
}

impl JobService {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn create_job(
        &self,
        id: &str,
        organization_id: &str,
        job_type: &str,
        config: Value,
    ) -> Result<CreateOutcome, EngineError> {
        if let Some(status) = JobRepository::status_of(&self.pool, id).await? {
            if status == JobStatus::Crashed.as_str() {
                info!("Job {} exists as crashed; skipping creation", id);
                let job = self.require_job(id).await?;
                return Ok(CreateOutcome::ExistingCrashed(job));
            }
            return Err(EngineError::DuplicateJob {
                id: id.to_string(),
                status,
            });
        }

        let inserted = JobRepository::insert(
            &self.pool,
            &NewJob {
                id,
                organization_id,
                job_type,
                config,
            },
        )
        .await?;

        if !inserted {
            // Lost a creation race; report whatever won.
            let status = JobRepository::status_of(&self.pool, id)
                .await?
                .unwrap_or_else(|| "unknown".to_string());
            return Err(EngineError::DuplicateJob {
                id: id.to_string(),
                status,
            });
        }

        let job = self.require_job(id).await?;
        info!(
            target: "business_event",
            event = "job_created",
            job_id = %id,
            organization_id = %organization_id,
        );
        Ok(CreateOutcome::Created(job))
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRow>, EngineError> {
        Ok(JobRepository::find(&self.pool, id).await?)
    }

    async fn require_job(&self, id: &str) -> Result<JobRow, EngineError> {
        JobRepository::find(&self.pool, id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound { id: id.to_string() })
    }

    async fn current_status(&self, id: &str) -> Result<String, EngineError> {
        JobRepository::status_of(&self.pool, id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound { id: id.to_string() })
    }

    /// pending | crashed | resuming -> running, heartbeat stamped.
    pub async fn start_running(&self, id: &str) -> Result<JobRow, EngineError> {
        match JobRepository::mark_running(&self.pool, id).await? {
            Some(job) => Ok(job),
            None => Err(EngineError::InvalidTransition {
                action: "start",
                id: id.to_string(),
                status: self.current_status(id).await?,
            }),
        }
    }

    /// Pause a running or pending job. The status flip and the pause
    /// checkpoint are both durable before this returns success; the
    /// checkpoint write itself is best-effort (losing it only degrades
    /// resume precision).
    pub async fn pause_job(&self, id: &str) -> Result<JobStatusView, EngineError> {
        let job = self.require_job(id).await?;
        let previous = job.status().ok_or_else(|| EngineError::InvalidTransition {
            action: "pause",
            id: id.to_string(),
            status: job.status.clone(),
        })?;
        if !previous.can_pause() {
            return Err(EngineError::InvalidTransition {
                action: "pause",
                id: id.to_string(),
                status: job.status.clone(),
            });
        }

        let patch = JobMetadata::pause_patch(previous, "user_requested");
        let updated = match JobRepository::mark_paused(&self.pool, id, patch).await? {
            Some(row) => row,
            None => {
                // Another transition won; report the status it left behind.
                return Err(EngineError::InvalidTransition {
                    action: "pause",
                    id: id.to_string(),
                    status: self.current_status(id).await?,
                });
            }
        };

        // Snapshot the latest known position so even a paused-while-pending
        // job has something to resume from. A running loop appends its own
        // precise paused checkpoint when it observes the signal, which then
        // supersedes this one as latest.
        let latest = self.get_latest_checkpoint(id).await?;
        let snapshot = CheckpointPayload {
            phase: Phase::MainDataPaused,
            records_processed: latest.as_ref().map_or(0, |c| c.records_processed),
            total_estimated: latest.as_ref().and_then(|c| c.total_estimated),
            cursor: latest.as_ref().and_then(|c| c.cursor.clone()),
            page_number: latest.as_ref().map_or(0, |c| c.page_number),
            batch_size: latest.as_ref().map_or(DEFAULT_BATCH_SIZE, |c| c.batch_size),
            last_processed_id: latest.as_ref().and_then(|c| c.last_processed_id.clone()),
            last_processed_timestamp: None,
            detail: CheckpointDetail::Paused {
                pause_reason: "user_requested".to_string(),
                paused_at_page: latest.as_ref().map_or(0, |c| c.page_number),
                paused_at: Utc::now(),
                service: "crm_deals".to_string(),
            },
        };
        if let Err(e) = self.save_checkpoint(id, snapshot).await {
            warn!("Failed to save pause checkpoint for job {}: {}", id, e);
        }

        info!(
            target: "business_event",
            event = "job_paused",
            job_id = %id,
            previous_status = %previous,
            records_processed = latest.as_ref().map_or(0, |c| c.records_processed),
        );

        Ok(JobStatusView {
            duration_seconds: duration_of(&updated),
            checkpoint_info: latest.map(|c| CheckpointInfo {
                progress: c.progress_percentage(),
                latest_checkpoint: c,
            }),
            job: updated,
        })
    }

    /// paused | crashed -> resuming, provided a checkpoint exists.
    pub async fn resume_job(&self, id: &str) -> Result<ResumeOutcome, EngineError> {
        let job = self.require_job(id).await?;
        let previous = job.status().ok_or_else(|| EngineError::InvalidTransition {
            action: "resume",
            id: id.to_string(),
            status: job.status.clone(),
        })?;
        if !previous.can_resume() {
            return Err(EngineError::InvalidTransition {
                action: "resume",
                id: id.to_string(),
                status: job.status.clone(),
            });
        }

        let latest = self
            .get_latest_checkpoint(id)
            .await?
            .ok_or_else(|| EngineError::NoCheckpoint { id: id.to_string() })?;

        if latest.marks_completion() {
            // Nothing left to extract; the caller re-completes instead of
            // restarting from page one.
            return Ok(ResumeOutcome::AlreadyComplete {
                records_processed: latest.records_processed,
                job,
            });
        }

        let patch = JobMetadata::resume_patch(
            previous,
            ResumeCheckpointInfo {
                page: latest.page_number,
                records_processed: latest.records_processed,
                phase: latest.phase.clone(),
            },
        );
        let updated = match JobRepository::mark_resuming(&self.pool, id, patch).await? {
            Some(row) => row,
            None => {
                return Err(EngineError::InvalidTransition {
                    action: "resume",
                    id: id.to_string(),
                    status: self.current_status(id).await?,
                });
            }
        };

        info!(
            target: "business_event",
            event = "job_resumed",
            job_id = %id,
            previous_status = %previous,
            resume_page = latest.page_number,
            records_processed = latest.records_processed,
        );

        Ok(ResumeOutcome::Resuming {
            job: updated,
            previous_status: previous,
            checkpoint: latest,
        })
    }

    /// Cancel any job that has not already reached a terminal state.
    pub async fn cancel_job(&self, id: &str) -> Result<JobRow, EngineError> {
        let job = self.require_job(id).await?;
        let current = job.status();
        if let Some(status) = current {
            if !status.can_cancel() {
                return Err(EngineError::InvalidTransition {
                    action: "cancel",
                    id: id.to_string(),
                    status: job.status.clone(),
                });
            }
        }

        let updated = match JobRepository::mark_cancelled(&self.pool, id, JobMetadata::cancel_patch())
            .await?
        {
            Some(row) => row,
            None => {
                return Err(EngineError::InvalidTransition {
                    action: "cancel",
                    id: id.to_string(),
                    status: self.current_status(id).await?,
                });
            }
        };

        // Best-effort marker; the loop writes its own precise cancellation
        // checkpoint if it is mid-flight.
        let latest = self.get_latest_checkpoint(id).await.ok().flatten();
        let snapshot = CheckpointPayload {
            phase: Phase::MainDataCancelled,
            records_processed: latest.as_ref().map_or(0, |c| c.records_processed),
            total_estimated: None,
            cursor: latest.as_ref().and_then(|c| c.cursor.clone()),
            page_number: latest.as_ref().map_or(0, |c| c.page_number),
            batch_size: latest.as_ref().map_or(DEFAULT_BATCH_SIZE, |c| c.batch_size),
            last_processed_id: None,
            last_processed_timestamp: None,
            detail: CheckpointDetail::Cancelled {
                cancellation_reason: "user_requested".to_string(),
                cancelled_at_page: latest.as_ref().map_or(0, |c| c.page_number),
                service: "crm_deals".to_string(),
            },
        };
        if let Err(e) = self.save_checkpoint(id, snapshot).await {
            warn!("Failed to save cancellation checkpoint for job {}: {}", id, e);
        }

        info!(target: "business_event", event = "job_cancelled", job_id = %id);
        Ok(updated)
    }

    /// running -> completed, unless a concurrent cancellation won.
    pub async fn complete_job(
        &self,
        id: &str,
        records_extracted: i64,
        metadata_patch: Value,
    ) -> Result<CompleteOutcome, EngineError> {
        match JobRepository::mark_completed(&self.pool, id, records_extracted, metadata_patch)
            .await?
        {
            Some(job) => {
                info!(
                    target: "business_event",
                    event = "job_completed",
                    job_id = %id,
                    records_extracted = records_extracted,
                );
                Ok(CompleteOutcome::Completed(job))
            }
            None => {
                let status = self.current_status(id).await?;
                Ok(CompleteOutcome::Superseded { status })
            }
        }
    }

    /// Completion on the resume path, when the latest checkpoint already
    /// says the extraction finished.
    pub async fn complete_resumed(
        &self,
        id: &str,
        records_extracted: i64,
        metadata_patch: Value,
    ) -> Result<JobRow, EngineError> {
        match JobRepository::complete_from(
            &self.pool,
            id,
            &[JobStatus::Paused, JobStatus::Crashed],
            records_extracted,
            metadata_patch,
        )
        .await?
        {
            Some(job) => {
                info!(
                    target: "business_event",
                    event = "job_completed",
                    job_id = %id,
                    records_extracted = records_extracted,
                );
                Ok(job)
            }
            None => Err(EngineError::InvalidTransition {
                action: "complete",
                id: id.to_string(),
                status: self.current_status(id).await?,
            }),
        }
    }

    /// Mark the job failed with a message and structured error details.
    /// Skipped (with a warning) if the job already reached a terminal
    /// state; end_time is only ever set once.
    pub async fn fail_job(
        &self,
        id: &str,
        error_message: &str,
        metadata_patch: Value,
    ) -> Result<Option<JobRow>, EngineError> {
        let updated =
            JobRepository::mark_failed(&self.pool, id, error_message, metadata_patch).await?;
        match &updated {
            Some(_) => {
                info!(
                    target: "business_event",
                    event = "job_failed",
                    job_id = %id,
                    error_message = %error_message,
                );
            }
            None => {
                warn!(
                    "Not marking job {} failed: already terminal or missing",
                    id
                );
            }
        }
        Ok(updated)
    }

    pub async fn update_heartbeat(&self, id: &str) -> Result<(), EngineError> {
        if !JobRepository::touch_heartbeat(&self.pool, id).await? {
            debug!("Heartbeat skipped for job {} (not actively running)", id);
        }
        Ok(())
    }

    /// Crash sweep. Finds running jobs whose heartbeat is older than the
    /// timeout and flips them to crashed in one statement. Returns the
    /// affected ids; invoked periodically from outside, never on a timer
    /// of its own.
    pub async fn detect_crashed_jobs(
        &self,
        timeout_minutes: i64,
    ) -> Result<Vec<String>, EngineError> {
        let crashed = JobRepository::sweep_crashed(&self.pool, timeout_minutes).await?;
        if !crashed.is_empty() {
            warn!(
                "Crashed jobs detected: count={}, timeout_minutes={}",
                crashed.len(),
                timeout_minutes
            );
            info!(
                target: "business_event",
                event = "crashed_jobs_detected",
                crashed_count = crashed.len(),
                timeout_minutes = timeout_minutes,
            );
        }
        Ok(crashed)
    }

    /// Append a checkpoint and stamp the heartbeat: every checkpoint write
    /// doubles as the liveness signal the crash sweep reads.
    pub async fn save_checkpoint(
        &self,
        job_id: &str,
        payload: CheckpointPayload,
    ) -> Result<CheckpointRow, EngineError> {
        let row =
            CheckpointRepository::append(&self.pool, job_id, &payload.into_new_checkpoint())
                .await?;
        self.update_heartbeat(job_id).await?;
        Ok(row)
    }

    pub async fn get_latest_checkpoint(
        &self,
        job_id: &str,
    ) -> Result<Option<CheckpointRow>, EngineError> {
        Ok(CheckpointRepository::latest(&self.pool, job_id).await?)
    }

    pub async fn get_job_status(&self, id: &str) -> Result<Option<JobStatusView>, EngineError> {
        let Some(job) = JobRepository::find(&self.pool, id).await? else {
            return Ok(None);
        };
        let latest = self.get_latest_checkpoint(id).await?;
        Ok(Some(JobStatusView {
            duration_seconds: duration_of(&job),
            checkpoint_info: latest.map(|c| CheckpointInfo {
                progress: c.progress_percentage(),
                latest_checkpoint: c,
            }),
            job,
        }))
    }

    pub async fn list_jobs(
        &self,
        organization_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobRow>, EngineError> {
        let jobs = JobRepository::list(&self.pool, organization_id, limit, offset).await?;
        debug!(
            "Jobs listed: count={}, organization_id={:?}",
            jobs.len(),
            organization_id
        );
        Ok(jobs)
    }

    pub async fn get_job_statistics(
        &self,
        organization_id: Option<&str>,
    ) -> Result<JobStatistics, EngineError> {
        Ok(JobRepository::statistics(&self.pool, organization_id).await?)
    }

    pub async fn cleanup_old_jobs(&self, days_old: i64) -> Result<u64, EngineError> {
        let deleted = JobRepository::delete_older_than(&self.pool, days_old).await?;
        info!(
            target: "business_event",
            event = "jobs_cleanup_performed",
            deleted_count = deleted,
            days_old = days_old,
        );
        Ok(deleted)
    }

    /// Remove the job row (checkpoints cascade). Active jobs are refused;
    /// cancel first.
    pub async fn remove_job(&self, id: &str) -> Result<JobRow, EngineError> {
        let job = self.require_job(id).await?;
        if job.status().map_or(false, |s| !s.can_remove()) {
            return Err(EngineError::InvalidTransition {
                action: "remove",
                id: id.to_string(),
                status: job.status.clone(),
            });
        }

        if !JobRepository::delete(&self.pool, id).await? {
            return Err(EngineError::JobNotFound { id: id.to_string() });
        }

        info!(target: "business_event", event = "job_removed", job_id = %id);
        Ok(job)
    }
}

fn duration_of(job: &JobRow) -> Option<f64> {
    job.end_time
        .map(|end| (end - job.start_time).num_milliseconds() as f64 / 1000.0)
}
