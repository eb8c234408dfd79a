use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::checkpoint_repository::NewCheckpoint;

/// Why a checkpoint was written. Stored as the free-form `phase` tag;
/// these are the values this writer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    MainData,
    MainDataPaused,
    MainDataPausedMidPage,
    MainDataCancelled,
    MainDataCompleted,
    MainDataError,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::MainData => "main_data",
            Phase::MainDataPaused => "main_data_paused",
            Phase::MainDataPausedMidPage => "main_data_paused_mid_page",
            Phase::MainDataCancelled => "main_data_cancelled",
            Phase::MainDataCompleted => "main_data_completed",
            Phase::MainDataError => "main_data_error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase-specific structured detail stored in `checkpoint_data`.
///
/// Tagged by `kind`; anything written by an unknown producer falls into
/// the `Unknown` variant instead of failing replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointDetail {
    Progress {
        pages_processed: i64,
        last_page_records: i64,
        service: String,
    },
    Paused {
        pause_reason: String,
        paused_at_page: i64,
        paused_at: DateTime<Utc>,
        service: String,
    },
    PausedMidPage {
        pause_reason: String,
        paused_at_page: i64,
        records_completed_in_page: i64,
        paused_at: DateTime<Utc>,
        service: String,
    },
    Cancelled {
        cancellation_reason: String,
        cancelled_at_page: i64,
        service: String,
    },
    Completed {
        completion_status: String,
        total_pages: i64,
        final_total: i64,
        service: String,
    },
    Error {
        error: String,
        error_page: i64,
        recovery_cursor: Option<String>,
        service: String,
    },
    #[serde(untagged)]
    Unknown(serde_json::Value),
}

/// What the extraction loop (or a control operation) hands the checkpoint
/// store for one append.
#[derive(Debug, Clone)]
pub struct CheckpointPayload {
    pub phase: Phase,
    pub records_processed: i64,
    pub total_estimated: Option<i64>,
    pub cursor: Option<String>,
    pub page_number: i64,
    pub batch_size: i64,
    pub last_processed_id: Option<String>,
    pub last_processed_timestamp: Option<DateTime<Utc>>,
    pub detail: CheckpointDetail,
}

impl CheckpointPayload {
    pub fn into_new_checkpoint(self) -> NewCheckpoint {
        NewCheckpoint {
            phase: self.phase.as_str().to_string(),
            records_processed: self.records_processed,
            total_estimated: self.total_estimated,
            cursor: self.cursor,
            page_number: self.page_number,
            batch_size: self.batch_size,
            last_processed_id: self.last_processed_id,
            last_processed_timestamp: self.last_processed_timestamp,
            checkpoint_data: serde_json::to_value(&self.detail).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_serializes_with_kind_tag() {
        let detail = CheckpointDetail::Paused {
            pause_reason: "user_requested".into(),
            paused_at_page: 2,
            paused_at: Utc::now(),
            service: "crm_deals".into(),
        };
        let value = serde_json::to_value(&detail).unwrap();
        assert_eq!(value["kind"], "paused");
        assert_eq!(value["paused_at_page"], 2);

        let back: CheckpointDetail = serde_json::from_value(value).unwrap();
        assert!(matches!(back, CheckpointDetail::Paused { .. }));
    }

    #[test]
    fn unknown_detail_is_preserved_not_rejected() {
        let foreign = serde_json::json!({
            "kind": "compaction_snapshot",
            "segments": [1, 2, 3],
        });
        let parsed: CheckpointDetail = serde_json::from_value(foreign.clone()).unwrap();
        match parsed {
            CheckpointDetail::Unknown(v) => assert_eq!(v, foreign),
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn error_detail_keeps_recovery_cursor() {
        let detail = CheckpointDetail::Error {
            error: "timeout".into(),
            error_page: 5,
            recovery_cursor: Some("cur-5".into()),
            service: "crm_deals".into(),
        };
        let value = serde_json::to_value(&detail).unwrap();
        let back: CheckpointDetail = serde_json::from_value(value).unwrap();
        assert_eq!(back, detail);
    }
}
