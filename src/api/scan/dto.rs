use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::credentials::AuthConfig;
use crate::db::models::{CheckpointRow, JobRow, ScanFilters};
use crate::jobs::service::JobStatusView;

/// Body of `POST /api/scans/start`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartScanRequest {
    #[validate(length(
        min = 1,
        max = 255,
        message = "scanId must be between 1 and 255 characters"
    ))]
    pub scan_id: String,
    #[validate(length(
        min = 1,
        max = 255,
        message = "organizationId must be between 1 and 255 characters"
    ))]
    pub organization_id: String,
    #[serde(rename = "type", default)]
    pub source_types: Vec<String>,
    pub auth: AuthConfig,
    #[serde(default)]
    pub filters: ScanFilters,
}

/// API-facing shape of a job row. The scan id key is kept stable for
/// callers even though the store calls it `id`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub scan_id: String,
    pub organization_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub records_extracted: i64,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl From<JobRow> for JobView {
    fn from(row: JobRow) -> Self {
        JobView {
            scan_id: row.id,
            organization_id: row.organization_id,
            job_type: row.job_type,
            status: row.status,
            start_time: row.start_time,
            end_time: row.end_time,
            last_heartbeat: row.last_heartbeat,
            records_extracted: row.records_extracted,
            error_message: row.error_message,
            metadata: row.metadata,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointView {
    pub id: i64,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub phase: String,
    pub records_processed: i64,
    pub total_estimated: Option<i64>,
    pub cursor: Option<String>,
    pub page_number: i64,
    pub batch_size: i64,
    pub last_processed_id: Option<String>,
    pub last_processed_timestamp: Option<DateTime<Utc>>,
    pub checkpoint_data: Option<serde_json::Value>,
    pub progress_percentage: Option<f64>,
}

impl From<CheckpointRow> for CheckpointView {
    fn from(row: CheckpointRow) -> Self {
        let progress_percentage = row.progress_percentage();
        CheckpointView {
            id: row.id,
            job_id: row.job_id,
            created_at: row.created_at,
            phase: row.phase,
            records_processed: row.records_processed,
            total_estimated: row.total_estimated,
            cursor: row.cursor,
            page_number: row.page_number,
            batch_size: row.batch_size,
            last_processed_id: row.last_processed_id,
            last_processed_timestamp: row.last_processed_timestamp,
            checkpoint_data: row.checkpoint_data,
            progress_percentage,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatusResponse {
    #[serde(flatten)]
    pub job: JobView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_info: Option<CheckpointInfoView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointInfoView {
    pub latest_checkpoint: CheckpointView,
    pub progress: Option<f64>,
    pub last_checkpoint_at: DateTime<Utc>,
}

impl From<JobStatusView> for ScanStatusResponse {
    fn from(view: JobStatusView) -> Self {
        ScanStatusResponse {
            job: view.job.into(),
            duration: view.duration_seconds,
            checkpoint_info: view.checkpoint_info.map(|info| CheckpointInfoView {
                progress: info.progress,
                last_checkpoint_at: info.latest_checkpoint.created_at,
                latest_checkpoint: info.latest_checkpoint.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub organization_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsQuery {
    pub organization_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsQuery {
    #[serde(default = "default_results_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectCrashedQuery {
    #[serde(default = "default_crash_timeout")]
    pub timeout_minutes: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupQuery {
    #[serde(default = "default_cleanup_days")]
    pub days_old: i64,
}

fn default_limit() -> i64 {
    50
}

fn default_results_limit() -> i64 {
    100
}

fn default_crash_timeout() -> i64 {
    10
}

fn default_cleanup_days() -> i64 {
    7
}
