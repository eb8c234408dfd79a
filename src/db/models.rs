use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use crate::jobs::status::JobStatus;

/// Database representation of a job with all fields.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRow {
    pub id: String,
    pub organization_id: String,
    pub job_type: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub records_extracted: i64,
    pub error_message: Option<String>,
    pub config: Option<Value>,
    pub metadata: Option<Value>,
}

impl JobRow {
    pub fn status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }

    pub fn config_doc(&self) -> Option<JobConfig> {
        self.config
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn metadata_doc(&self) -> JobMetadata {
        self.metadata
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

/// Database representation of one checkpoint.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CheckpointRow {
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
    pub checkpoint_data: Option<Value>,
}

impl CheckpointRow {
    /// A checkpoint that marks the extraction as finished: completion
    /// phase and no further pages. Resuming from one of these is a no-op.
    pub fn marks_completion(&self) -> bool {
        self.cursor.is_none() && self.phase.ends_with("_completed")
    }

    pub fn progress_percentage(&self) -> Option<f64> {
        match self.total_estimated {
            Some(total) if total > 0 => {
                Some((self.records_processed as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
}

/// Database representation of a sunk deal record (readback shape).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DealRow {
    pub id: String,
    pub source_record_id: String,
    pub organization_id: String,
    pub scan_id: String,
    pub extracted_at: DateTime<Utc>,
    pub page_number: i64,
    pub deal_name: Option<String>,
    pub amount: Option<Decimal>,
    pub pipeline: String,
    pub deal_stage: Option<String>,
    pub close_date: Option<DateTime<Utc>>,
    pub currency_code: String,
    pub owner_id: Option<String>,
    pub is_closed: Option<bool>,
    pub is_closed_won: Option<bool>,
    pub archived: bool,
    pub custom_properties: Option<Value>,
}

/// Structured job configuration stored in `jobs.config`.
///
/// `auth` holds the ciphertext produced by the credential cipher, never
/// the raw token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub auth: String,
    #[serde(default)]
    pub filters: ScanFilters,
    #[serde(rename = "type", default)]
    pub source_types: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Structured annotations accumulated on `jobs.metadata`.
///
/// Patches are merged additively at the store (JSONB `||`), so each
/// constructor below serializes only the keys it sets. Unknown keys from
/// other writers survive in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_from_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_checkpoint: Option<ResumeCheckpointInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_summary: Option<ExtractionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeCheckpointInfo {
    pub page: i64,
    pub records_processed: i64,
    pub phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSummary {
    pub total_records: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub error_type: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub failure_stage: String,
}

impl JobMetadata {
    pub fn pause_patch(previous: JobStatus, reason: &str) -> Value {
        serde_json::json!({
            "paused_at": Utc::now(),
            "paused_from_status": previous.as_str(),
            "pause_reason": reason,
        })
    }

    pub fn resume_patch(previous: JobStatus, checkpoint: ResumeCheckpointInfo) -> Value {
        serde_json::json!({
            "resumed_at": Utc::now(),
            "resumed_from_status": previous.as_str(),
            "resume_checkpoint": checkpoint,
        })
    }

    pub fn cancel_patch() -> Value {
        serde_json::json!({ "cancelled_at": Utc::now() })
    }

    pub fn completion_patch(
        pipeline_name: &str,
        dataset_name: &str,
        source_type: &str,
        total_records: i64,
    ) -> Value {
        serde_json::json!({
            "pipeline_name": pipeline_name,
            "destination": "postgres",
            "dataset_name": dataset_name,
            "source_type": source_type,
            "extraction_summary": { "total_records": total_records },
            "completed_at": Utc::now(),
        })
    }

    pub fn error_patch(error_type: &str, error_message: &str, failure_stage: &str) -> Value {
        serde_json::json!({
            "error_details": {
                "error_type": error_type,
                "error_message": error_message,
                "failed_at": Utc::now(),
                "failure_stage": failure_stage,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_survives_unknown_keys() {
        let raw = serde_json::json!({
            "paused_at": "2026-01-01T00:00:00Z",
            "pause_reason": "user_requested",
            "some_future_field": {"nested": true},
        });

        let doc: JobMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.pause_reason.as_deref(), Some("user_requested"));
        assert!(doc.extra.contains_key("some_future_field"));

        // The unknown key round-trips back out.
        let out = serde_json::to_value(&doc).unwrap();
        assert!(out.get("some_future_field").is_some());
    }

    #[test]
    fn completion_patch_sets_only_completion_keys() {
        let patch =
            JobMetadata::completion_patch("crm_deal_extraction", "crm_deals_org_1", "crm_deal", 42);
        let obj = patch.as_object().unwrap();
        assert!(obj.contains_key("extraction_summary"));
        assert!(obj.contains_key("completed_at"));
        assert!(!obj.contains_key("paused_at"));
    }

    #[test]
    fn completed_checkpoint_detection() {
        let row = CheckpointRow {
            id: 1,
            job_id: "s1".into(),
            created_at: Utc::now(),
            phase: "main_data_completed".into(),
            records_processed: 10,
            total_estimated: None,
            cursor: None,
            page_number: 2,
            batch_size: 100,
            last_processed_id: None,
            last_processed_timestamp: None,
            checkpoint_data: None,
        };
        assert!(row.marks_completion());

        let paused = CheckpointRow {
            phase: "main_data_paused".into(),
            cursor: Some("abc".into()),
            ..row.clone()
        };
        assert!(!paused.marks_completion());
    }

    #[test]
    fn progress_percentage_caps_at_hundred() {
        let row = CheckpointRow {
            id: 1,
            job_id: "s1".into(),
            created_at: Utc::now(),
            phase: "main_data".into(),
            records_processed: 150,
            total_estimated: Some(100),
            cursor: Some("c".into()),
            page_number: 1,
            batch_size: 100,
            last_processed_id: None,
            last_processed_timestamp: None,
            checkpoint_data: None,
        };
        assert_eq!(row.progress_percentage(), Some(100.0));
    }
}
