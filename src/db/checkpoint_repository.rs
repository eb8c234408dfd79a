use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Postgres};
use tracing::debug;

use crate::db::models::CheckpointRow;

const CHECKPOINT_COLUMNS: &str = "id, job_id, created_at, phase, records_processed, \
     total_estimated, cursor, page_number, batch_size, last_processed_id, \
     last_processed_timestamp, checkpoint_data";

/// Insertion parameters for one checkpoint.
pub struct NewCheckpoint {
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

/// Repository for the append-only checkpoint log. Rows are never updated;
/// they disappear only when the owning job is deleted (FK cascade).
pub struct CheckpointRepository;

impl CheckpointRepository {
    pub async fn append(
        pool: &Pool<Postgres>,
        job_id: &str,
        checkpoint: &NewCheckpoint,
    ) -> Result<CheckpointRow, sqlx::Error> {
        debug!(
            "Saving checkpoint: job_id={}, phase={}, page_number={}",
            job_id, checkpoint.phase, checkpoint.page_number
        );

        let query = format!(
            r#"
            INSERT INTO job_checkpoints
                (job_id, phase, records_processed, total_estimated, cursor,
                 page_number, batch_size, last_processed_id,
                 last_processed_timestamp, checkpoint_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            CHECKPOINT_COLUMNS
        );

        sqlx::query_as::<_, CheckpointRow>(&query)
            .bind(job_id)
            .bind(&checkpoint.phase)
            .bind(checkpoint.records_processed)
            .bind(checkpoint.total_estimated)
            .bind(&checkpoint.cursor)
            .bind(checkpoint.page_number)
            .bind(checkpoint.batch_size)
            .bind(&checkpoint.last_processed_id)
            .bind(checkpoint.last_processed_timestamp)
            .bind(&checkpoint.checkpoint_data)
            .fetch_one(pool)
            .await
    }

    /// Latest checkpoint for a job: max created_at, ties broken by id so
    /// that two checkpoints landing in the same instant order by append.
    pub async fn latest(
        pool: &Pool<Postgres>,
        job_id: &str,
    ) -> Result<Option<CheckpointRow>, sqlx::Error> {
        let query = format!(
            r#"
            SELECT {} FROM job_checkpoints
            WHERE job_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            CHECKPOINT_COLUMNS
        );
        sqlx::query_as::<_, CheckpointRow>(&query)
            .bind(job_id)
            .fetch_optional(pool)
            .await
    }
}
