use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::{Pool, Postgres};
use tracing::debug;

use crate::db::models::JobRow;
use crate::jobs::status::{JobStatus, ALL_STATUSES};

const JOB_COLUMNS: &str = "id, organization_id, job_type, status, start_time, end_time, \
     last_heartbeat, records_extracted, error_message, config, metadata";

/// New job parameters for insertion.
pub struct NewJob<'a> {
    pub id: &'a str,
    pub organization_id: &'a str,
    pub job_type: &'a str,
    pub config: Value,
}

/// Repository for job rows.
///
/// Every status mutation is a single conditional UPDATE guarded on the
/// current status, so concurrent transitions on one job serialize through
/// the store: exactly one statement matches, the rest return no row and
/// the caller reports the post-transition status.
pub struct JobRepository;

impl JobRepository {
    /// Insert a new pending job. Returns false if the id already exists.
    pub async fn insert(pool: &Pool<Postgres>, job: &NewJob<'_>) -> Result<bool, sqlx::Error> {
        debug!(
            "Creating job: id={}, organization_id={}",
            job.id, job.organization_id
        );

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, organization_id, job_type, status, config)
            VALUES ($1, $2, $3, 'pending', $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.organization_id)
        .bind(job.job_type)
        .bind(&job.config)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn find(pool: &Pool<Postgres>, id: &str) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn status_of(
        pool: &Pool<Postgres>,
        id: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// pending | crashed | resuming -> running, heartbeat stamped.
    pub async fn mark_running(
        pool: &Pool<Postgres>,
        id: &str,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'running', last_heartbeat = now()
            WHERE id = $1 AND status IN ('pending', 'crashed', 'resuming')
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// running | pending -> paused, metadata patch merged additively.
    pub async fn mark_paused(
        pool: &Pool<Postgres>,
        id: &str,
        metadata_patch: Value,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'paused',
                metadata = COALESCE(metadata, '{{}}'::jsonb) || $2::jsonb
            WHERE id = $1 AND status IN ('running', 'pending')
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(metadata_patch)
            .fetch_optional(pool)
            .await
    }

    /// paused | crashed -> resuming, heartbeat stamped.
    pub async fn mark_resuming(
        pool: &Pool<Postgres>,
        id: &str,
        metadata_patch: Value,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'resuming',
                last_heartbeat = now(),
                metadata = COALESCE(metadata, '{{}}'::jsonb) || $2::jsonb
            WHERE id = $1 AND status IN ('paused', 'crashed')
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(metadata_patch)
            .fetch_optional(pool)
            .await
    }

    /// Any non-terminal status -> cancelled; end_time set once.
    pub async fn mark_cancelled(
        pool: &Pool<Postgres>,
        id: &str,
        metadata_patch: Value,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                end_time = now(),
                metadata = COALESCE(metadata, '{{}}'::jsonb) || $2::jsonb
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(metadata_patch)
            .fetch_optional(pool)
            .await
    }

    /// running -> completed. The guard is what loses a race against a
    /// concurrent cancellation: if the status moved, no row matches and
    /// the cancelled status stands.
    pub async fn mark_completed(
        pool: &Pool<Postgres>,
        id: &str,
        records_extracted: i64,
        metadata_patch: Value,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        Self::complete_from(pool, id, &[JobStatus::Running], records_extracted, metadata_patch)
            .await
    }

    /// Completion with an explicit origin set. Used by resume when the
    /// latest checkpoint already marks the extraction complete.
    pub async fn complete_from(
        pool: &Pool<Postgres>,
        id: &str,
        allowed_from: &[JobStatus],
        records_extracted: i64,
        metadata_patch: Value,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let origins: Vec<String> = allowed_from.iter().map(|s| s.as_str().to_string()).collect();
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'completed',
                end_time = now(),
                records_extracted = $2,
                metadata = COALESCE(metadata, '{{}}'::jsonb) || $3::jsonb
            WHERE id = $1 AND status = ANY($4)
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(records_extracted)
            .bind(metadata_patch)
            .bind(origins)
            .fetch_optional(pool)
            .await
    }

    /// Any non-terminal status -> failed, with error message and details.
    pub async fn mark_failed(
        pool: &Pool<Postgres>,
        id: &str,
        error_message: &str,
        metadata_patch: Value,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'failed',
                end_time = now(),
                error_message = $2,
                metadata = COALESCE(metadata, '{{}}'::jsonb) || $3::jsonb
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(error_message)
            .bind(metadata_patch)
            .fetch_optional(pool)
            .await
    }

    /// Heartbeat only ticks while the job is actively executing.
    pub async fn touch_heartbeat(pool: &Pool<Postgres>, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET last_heartbeat = now() WHERE id = $1 AND status IN ('running', 'resuming')",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Crash sweep: running jobs whose heartbeat went stale are marked
    /// crashed in one statement. This is the documented exception to the
    /// rule that status only changes via the state machine entry points;
    /// the owning process is presumed dead and cannot cooperate.
    pub async fn sweep_crashed(
        pool: &Pool<Postgres>,
        timeout_minutes: i64,
    ) -> Result<Vec<String>, sqlx::Error> {
        let cutoff = Utc::now() - Duration::minutes(timeout_minutes);
        sqlx::query_scalar::<_, String>(
            r#"
            UPDATE jobs
            SET status = 'crashed'
            WHERE status = 'running' AND last_heartbeat < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await
    }

    pub async fn list(
        pool: &Pool<Postgres>,
        organization_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobRow>, sqlx::Error> {
        let rows = match organization_id {
            Some(org) => {
                let query = format!(
                    "SELECT {} FROM jobs WHERE organization_id = $1 \
                     ORDER BY start_time DESC LIMIT $2 OFFSET $3",
                    JOB_COLUMNS
                );
                sqlx::query_as::<_, JobRow>(&query)
                    .bind(org)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM jobs ORDER BY start_time DESC LIMIT $1 OFFSET $2",
                    JOB_COLUMNS
                );
                sqlx::query_as::<_, JobRow>(&query)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(rows)
    }

    /// Counts per status plus totals, in a single grouped query.
    pub async fn statistics(
        pool: &Pool<Postgres>,
        organization_id: Option<&str>,
    ) -> Result<JobStatistics, sqlx::Error> {
        let grouped: Vec<(String, i64)> = match organization_id {
            Some(org) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM jobs WHERE organization_id = $1 GROUP BY status",
                )
                .bind(org)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                    .fetch_all(pool)
                    .await?
            }
        };

        let week_ago = Utc::now() - Duration::days(7);
        let (recent_jobs, total_records): (i64, i64) = match organization_id {
            Some(org) => {
                sqlx::query_as(
                    r#"
                    SELECT COUNT(*) FILTER (WHERE start_time >= $2),
                           COALESCE(SUM(records_extracted), 0)::BIGINT
                    FROM jobs WHERE organization_id = $1
                    "#,
                )
                .bind(org)
                .bind(week_ago)
                .fetch_one(pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT COUNT(*) FILTER (WHERE start_time >= $1),
                           COALESCE(SUM(records_extracted), 0)::BIGINT
                    FROM jobs
                    "#,
                )
                .bind(week_ago)
                .fetch_one(pool)
                .await?
            }
        };

        let mut stats = JobStatistics {
            total_jobs: 0,
            status_breakdown: ALL_STATUSES
                .iter()
                .map(|s| (s.as_str().to_string(), 0))
                .collect(),
            recent_jobs_7_days: recent_jobs,
            total_records_extracted: total_records,
        };
        for (status, count) in grouped {
            stats.total_jobs += count;
            stats.status_breakdown.insert(status, count);
        }
        Ok(stats)
    }

    /// Delete the job row; checkpoints go with it via the FK cascade.
    pub async fn delete(pool: &Pool<Postgres>, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_older_than(
        pool: &Pool<Postgres>,
        days_old: i64,
    ) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - Duration::days(days_old);
        let result = sqlx::query("DELETE FROM jobs WHERE start_time < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatistics {
    pub total_jobs: i64,
    pub status_breakdown: std::collections::BTreeMap<String, i64>,
    pub recent_jobs_7_days: i64,
    pub total_records_extracted: i64,
}
