use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Pool, Postgres};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::credentials::{AuthConfig, CredentialCipher};
use crate::db::deal_repository::DealRepository;
use crate::db::job_repository::{JobRepository, JobStatistics};
use crate::db::models::{DealRow, JobConfig, JobMetadata, JobRow, ScanFilters};
use crate::error::EngineError;
use crate::extraction::run::{
    run_extraction, CheckpointSink, ControlSignals, ExtractionContext, ExtractionTuning,
    LoopOutcome, RecordSink, ResumePoint, Signal,
};
use crate::extraction::source::SourceAdapter;
use crate::extraction::transform::DealRecord;
use crate::jobs::checkpoint::CheckpointPayload;
use crate::jobs::service::{CompleteOutcome, CreateOutcome, JobService, JobStatusView, ResumeOutcome};
use crate::jobs::status::JobStatus;

/// Everything needed to start one scan, decoupled from the HTTP request
/// shape.
#[derive(Debug, Clone)]
pub struct ScanSpec {
    pub scan_id: String,
    pub organization_id: String,
    pub source_types: Vec<String>,
    pub auth: AuthConfig,
    pub filters: ScanFilters,
}

impl ScanSpec {
    fn job_type(&self) -> &str {
        self.source_types.first().map(String::as_str).unwrap_or("deal")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartScanAck {
    pub success: bool,
    pub scan_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeAck {
    pub scan_id: String,
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_point: Option<ResumePointView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePointView {
    pub page: i64,
    pub records_processed: i64,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveOutcome {
    pub scan_id: String,
    pub records_removed: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResults {
    pub scan_id: String,
    pub dataset_name: String,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub results: Vec<DealRow>,
}

/// Orchestrates the state machine, extraction loop and crash sweep behind
/// a scan-centric API. Holds explicit store handles; there is no ambient
/// global anywhere in the engine.
#[derive(Clone)]
pub struct ExtractionService {
    pool: Pool<Postgres>,
    jobs: JobService,
    source: Arc<dyn SourceAdapter>,
    cipher: Arc<dyn CredentialCipher>,
    tuning: ExtractionTuning,
    scan_permits: Arc<Semaphore>,
    source_type: String,
    pipeline_name: String,
}

impl ExtractionService {
    pub fn new(
        pool: Pool<Postgres>,
        source: Arc<dyn SourceAdapter>,
        cipher: Arc<dyn CredentialCipher>,
        tuning: ExtractionTuning,
        max_concurrent_scans: usize,
    ) -> Self {
        let source_type = "crm_deal".to_string();
        let pipeline_name = format!("{}_extraction", source_type);
        Self {
            jobs: JobService::new(pool.clone()),
            pool,
            source,
            cipher,
            tuning,
            scan_permits: Arc::new(Semaphore::new(max_concurrent_scans)),
            source_type,
            pipeline_name,
        }
    }

    pub fn jobs(&self) -> &JobService {
        &self.jobs
    }

    /// Accept a scan and return immediately. Setup and execution run as a
    /// background task; setup failures become a `failed` job, never a
    /// caller-visible error.
    pub fn start_scan(&self, spec: ScanSpec) -> StartScanAck {
        let scan_id = spec.scan_id.clone();
        info!(
            "Scan initiation requested: scan_id={}, organization_id={}",
            scan_id, spec.organization_id
        );

        let service = self.clone();
        tokio::spawn(async move {
            let _permit = match service.scan_permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Failed to acquire scan permit: {:?}", e);
                    return;
                }
            };
            service.execute_scan_with_setup(spec).await;
        });

        info!(target: "business_event", event = "scan_initiated", scan_id = %scan_id);

        StartScanAck {
            success: true,
            scan_id,
            status: "initializing".to_string(),
            message: format!("{} extraction scan initiated successfully", self.source_type),
        }
    }

    /// Background half of `start_scan`: health check, idempotent-start and
    /// crashed-restart detection, job creation, status flip, execution.
    async fn execute_scan_with_setup(&self, spec: ScanSpec) {
        let scan_id = spec.scan_id.clone();
        info!("Starting scan setup: scan_id={}", scan_id);

        if let Err(e) = self.setup(&spec).await {
            error!("Setup failed: scan_id={}, error={}", scan_id, e);
            // Make sure a job row exists to carry the failure.
            if let Ok(None) = self.jobs.get_job(&scan_id).await {
                if let Ok(config) = self.encode_config(&spec) {
                    let _ = self
                        .jobs
                        .create_job(&scan_id, &spec.organization_id, spec.job_type(), config)
                        .await;
                }
            }
            let patch = JobMetadata::error_patch(e.kind(), &e.to_string(), "setup");
            let _ = self.jobs.fail_job(&scan_id, &e.to_string(), patch).await;
            return;
        }

        self.execute_scan(&scan_id).await;
    }

    async fn setup(&self, spec: &ScanSpec) -> Result<(), EngineError> {
        let scan_id = &spec.scan_id;

        // Store health gate before anything else touches it.
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EngineError::Setup(format!("database is not available: {}", e)))?;

        match self.jobs.get_job(scan_id).await? {
            Some(existing) => {
                if existing.status() == Some(JobStatus::Crashed) {
                    info!("Restarting crashed job: scan_id={}", scan_id);
                    match self.jobs.resume_job(scan_id).await {
                        Ok(ResumeOutcome::Resuming { .. }) => {}
                        Ok(ResumeOutcome::AlreadyComplete {
                            records_processed, ..
                        }) => {
                            self.recomplete(scan_id, &existing, records_processed).await?;
                            return Ok(());
                        }
                        // A crashed job that never checkpointed restarts
                        // from scratch; crashed -> running is legal.
                        Err(EngineError::NoCheckpoint { .. }) => {
                            warn!("Crashed job {} has no checkpoint; starting fresh", scan_id);
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    // Idempotent start: the id is already taken by a live
                    // or finished job, so this request is a no-op.
                    warn!(
                        "Job already exists: scan_id={}, existing_status={}",
                        scan_id, existing.status
                    );
                    return Ok(());
                }
            }
            None => {
                let config = self.encode_config(spec)?;
                match self
                    .jobs
                    .create_job(scan_id, &spec.organization_id, spec.job_type(), config)
                    .await
                {
                    Ok(CreateOutcome::Created(_)) => {
                        info!("Job created successfully: scan_id={}", scan_id);
                    }
                    Ok(CreateOutcome::ExistingCrashed(_)) => {
                        // Raced with a crash sweep; fall through and run.
                        info!("Job surfaced as crashed during creation: scan_id={}", scan_id);
                    }
                    // Lost a creation race to a concurrent start of the
                    // same scan id; that start owns the job now.
                    Err(EngineError::DuplicateJob { status, .. }) => {
                        warn!(
                            "Job already exists: scan_id={}, existing_status={}",
                            scan_id, status
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.jobs.start_running(scan_id).await?;
        info!("Setup completed, starting extraction: scan_id={}", scan_id);
        Ok(())
    }

    fn encode_config(&self, spec: &ScanSpec) -> Result<Value, EngineError> {
        let auth = self
            .cipher
            .encrypt(&spec.auth)
            .map_err(|e| EngineError::Setup(e.to_string()))?;
        let config = JobConfig {
            auth,
            filters: spec.filters.clone(),
            source_types: spec.source_types.clone(),
        };
        serde_json::to_value(&config).map_err(|e| EngineError::Setup(e.to_string()))
    }

    /// Run the extraction pipeline for a job that is already `running`.
    /// All errors are captured here as a `failed` job.
    async fn execute_scan(&self, job_id: &str) {
        if let Err(e) = self.run_pipeline(job_id).await {
            error!("Scan execution failed: job_id={}, error={}", job_id, e);
            let patch = JobMetadata::error_patch(e.kind(), &e.to_string(), "extraction");
            let _ = self.jobs.fail_job(job_id, &e.to_string(), patch).await;
            info!(target: "business_event", event = "scan_failed", job_id = %job_id);
        }
    }

    async fn run_pipeline(&self, job_id: &str) -> Result<(), EngineError> {
        let Some(job) = self.jobs.get_job(job_id).await? else {
            error!("Job not found for execution: job_id={}", job_id);
            return Ok(());
        };

        let config = job
            .config_doc()
            .ok_or_else(|| EngineError::Setup("job config missing or malformed".to_string()))?;
        let auth = self
            .cipher
            .decrypt(&config.auth)
            .map_err(|e| EngineError::Setup(e.to_string()))?;

        // Resume only from a checkpoint that still has pages ahead of it;
        // a cursor-less checkpoint means a fresh start.
        let resume_from = self
            .jobs
            .get_latest_checkpoint(job_id)
            .await?
            .filter(|cp| cp.cursor.is_some())
            .map(|cp| {
                info!(
                    "Resuming from checkpoint: job_id={}, resume_page={}",
                    job_id, cp.page_number
                );
                ResumePoint {
                    cursor: cp.cursor,
                    page_number: cp.page_number,
                    records_processed: cp.records_processed,
                }
            });

        let sink = PgRecordSink {
            pool: self.pool.clone(),
        };
        let checkpoints = JobCheckpointSink {
            jobs: self.jobs.clone(),
        };
        let signals = StatusSignals {
            pool: self.pool.clone(),
        };

        self.jobs.update_heartbeat(job_id).await?;
        info!("Pipeline started: job_id={}", job_id);

        let outcome = run_extraction(
            ExtractionContext {
                job_id,
                organization_id: &job.organization_id,
                access_token: &auth.access_token,
                properties: config.filters.properties.as_deref(),
            },
            &self.tuning,
            resume_from,
            self.source.as_ref(),
            &sink,
            &checkpoints,
            &signals,
        )
        .await?;

        match outcome {
            LoopOutcome::Completed {
                records_processed, ..
            } => {
                let patch = JobMetadata::completion_patch(
                    &self.pipeline_name,
                    &build_dataset_name(&job.organization_id),
                    &self.source_type,
                    records_processed,
                );
                match self.jobs.complete_job(job_id, records_processed, patch).await? {
                    CompleteOutcome::Completed(_) => {
                        info!(
                            "Scan completed successfully: job_id={}, records_extracted={}",
                            job_id, records_processed
                        );
                        info!(
                            target: "business_event",
                            event = "scan_completed",
                            job_id = %job_id,
                            records_extracted = records_processed,
                        );
                    }
                    CompleteOutcome::Superseded { status } => {
                        // The cancellation signal wins this race; never
                        // overwrite it with completed.
                        info!(
                            "Job status moved to {} during execution; not marking completed: job_id={}",
                            status, job_id
                        );
                    }
                }
            }
            LoopOutcome::Paused { records_processed } => {
                info!(
                    "Extraction paused: job_id={}, records_processed={}",
                    job_id, records_processed
                );
            }
            LoopOutcome::Cancelled { records_processed } => {
                info!(
                    "Extraction cancelled: job_id={}, records_processed={}",
                    job_id, records_processed
                );
            }
        }
        Ok(())
    }

    async fn recomplete(
        &self,
        scan_id: &str,
        job: &JobRow,
        records_processed: i64,
    ) -> Result<JobRow, EngineError> {
        info!(
            "Latest checkpoint already marks completion; re-completing: scan_id={}",
            scan_id
        );
        let patch = JobMetadata::completion_patch(
            &self.pipeline_name,
            &build_dataset_name(&job.organization_id),
            &self.source_type,
            records_processed,
        );
        self.jobs
            .complete_resumed(scan_id, records_processed, patch)
            .await
    }

    pub async fn pause_scan(&self, scan_id: &str) -> Result<JobStatusView, EngineError> {
        self.jobs.pause_job(scan_id).await
    }

    /// Validate and perform the resume transition, then relaunch execution
    /// in the background. A checkpoint that already marks completion makes
    /// this a no-op success that re-completes the job.
    pub async fn resume_scan(&self, scan_id: &str) -> Result<ResumeAck, EngineError> {
        match self.jobs.resume_job(scan_id).await? {
            ResumeOutcome::AlreadyComplete {
                job,
                records_processed,
            } => {
                self.recomplete(scan_id, &job, records_processed).await?;
                Ok(ResumeAck {
                    scan_id: scan_id.to_string(),
                    status: JobStatus::Completed.as_str().to_string(),
                    message: format!(
                        "Scan {} already extracted all pages; marked completed",
                        scan_id
                    ),
                    resume_point: None,
                })
            }
            ResumeOutcome::Resuming { checkpoint, .. } => {
                let service = self.clone();
                let id = scan_id.to_string();
                tokio::spawn(async move {
                    let _permit = match service.scan_permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            error!("Failed to acquire scan permit: {:?}", e);
                            return;
                        }
                    };
                    match service.jobs.start_running(&id).await {
                        Ok(_) => service.execute_scan(&id).await,
                        Err(e) => {
                            error!("Failed to restart resumed job {}: {}", id, e);
                        }
                    }
                });

                Ok(ResumeAck {
                    scan_id: scan_id.to_string(),
                    status: JobStatus::Resuming.as_str().to_string(),
                    message: format!("Scan {} is resuming from checkpoint", scan_id),
                    resume_point: Some(ResumePointView {
                        page: checkpoint.page_number,
                        records_processed: checkpoint.records_processed,
                        phase: checkpoint.phase.clone(),
                        cursor: checkpoint.cursor,
                    }),
                })
            }
        }
    }

    pub async fn cancel_scan(&self, scan_id: &str) -> Result<JobRow, EngineError> {
        let job = self.jobs.cancel_job(scan_id).await?;
        info!(target: "business_event", event = "scan_cancelled", scan_id = %scan_id);
        Ok(job)
    }

    /// Remove a scan: its extracted rows, its checkpoints and its job
    /// record. Active scans must be cancelled first.
    pub async fn remove_scan(&self, scan_id: &str) -> Result<RemoveOutcome, EngineError> {
        let job = self
            .jobs
            .get_job(scan_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound {
                id: scan_id.to_string(),
            })?;
        if job.status().map_or(false, |s| !s.can_remove()) {
            return Err(EngineError::InvalidTransition {
                action: "remove",
                id: scan_id.to_string(),
                status: job.status.clone(),
            });
        }

        let records_removed = DealRepository::delete_for_scan(&self.pool, scan_id).await?;
        self.jobs.remove_job(scan_id).await?;

        info!(
            "Scan removed successfully: scan_id={}, records_removed={}",
            scan_id, records_removed
        );
        Ok(RemoveOutcome {
            scan_id: scan_id.to_string(),
            records_removed,
        })
    }

    pub async fn get_scan_status(&self, scan_id: &str) -> Result<Option<JobStatusView>, EngineError> {
        self.jobs.get_job_status(scan_id).await
    }

    pub async fn list_scans(
        &self,
        organization_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobRow>, EngineError> {
        self.jobs.list_jobs(organization_id, limit, offset).await
    }

    pub async fn get_scan_statistics(
        &self,
        organization_id: Option<&str>,
    ) -> Result<JobStatistics, EngineError> {
        self.jobs.get_job_statistics(organization_id).await
    }

    pub async fn detect_crashed_jobs(
        &self,
        timeout_minutes: i64,
    ) -> Result<Vec<String>, EngineError> {
        self.jobs.detect_crashed_jobs(timeout_minutes).await
    }

    pub async fn cleanup_old_scans(&self, days_old: i64) -> Result<u64, EngineError> {
        self.jobs.cleanup_old_jobs(days_old).await
    }

    /// Paginated readback of extracted rows for a completed scan.
    pub async fn get_scan_results(
        &self,
        scan_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<ScanResults, EngineError> {
        let job = self
            .jobs
            .get_job(scan_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound {
                id: scan_id.to_string(),
            })?;
        if job.status() != Some(JobStatus::Completed) {
            return Err(EngineError::InvalidTransition {
                action: "read results of",
                id: scan_id.to_string(),
                status: job.status.clone(),
            });
        }

        // Dataset identity recorded at completion time, falling back to
        // the derived name for rows completed by older writers.
        let dataset_name = job
            .metadata_doc()
            .dataset_name
            .unwrap_or_else(|| build_dataset_name(&job.organization_id));

        let total = DealRepository::count_for_scan(&self.pool, scan_id).await?;
        let results = DealRepository::list_for_scan(&self.pool, scan_id, limit, offset).await?;
        Ok(ScanResults {
            scan_id: scan_id.to_string(),
            dataset_name,
            total,
            limit,
            offset,
            results,
        })
    }
}

/// Logical dataset identifier recorded in completion metadata.
pub fn build_dataset_name(organization_id: &str) -> String {
    format!("crm_deals_{}", organization_id.replace('-', "_"))
}

/// Sink over the shared Postgres store.
struct PgRecordSink {
    pool: Pool<Postgres>,
}

#[async_trait]
impl RecordSink for PgRecordSink {
    async fn upsert(&self, record: &DealRecord) -> Result<(), EngineError> {
        DealRepository::upsert(&self.pool, record)
            .await
            .map_err(EngineError::from)
    }
}

/// Checkpoint sink that also stamps the heartbeat on every write.
struct JobCheckpointSink {
    jobs: JobService,
}

#[async_trait]
impl CheckpointSink for JobCheckpointSink {
    async fn save(&self, job_id: &str, payload: CheckpointPayload) -> Result<(), EngineError> {
        self.jobs.save_checkpoint(job_id, payload).await.map(|_| ())
    }
}

/// Control token refreshed from the store: each poll reads the status
/// column only. A failed read never interrupts the loop.
struct StatusSignals {
    pool: Pool<Postgres>,
}

#[async_trait]
impl ControlSignals for StatusSignals {
    async fn poll(&self, job_id: &str) -> Signal {
        match JobRepository::status_of(&self.pool, job_id).await {
            Ok(Some(status)) if status == JobStatus::Cancelled.as_str() => Signal::Cancel,
            Ok(Some(status)) if status == JobStatus::Paused.as_str() => Signal::Pause,
            _ => Signal::Proceed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_name_is_org_scoped() {
        assert_eq!(build_dataset_name("org-12-a"), "crm_deals_org_12_a");
    }

    #[test]
    fn scan_spec_defaults_job_type() {
        let spec = ScanSpec {
            scan_id: "s".into(),
            organization_id: "o".into(),
            source_types: vec![],
            auth: AuthConfig {
                access_token: "t".into(),
            },
            filters: ScanFilters::default(),
        };
        assert_eq!(spec.job_type(), "deal");

        let spec = ScanSpec {
            source_types: vec!["user".into()],
            ..spec
        };
        assert_eq!(spec.job_type(), "user");
    }
}
