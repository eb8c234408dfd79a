use sqlx::{Pool, Postgres};
use tracing::debug;

use crate::db::models::DealRow;
use crate::extraction::transform::DealRecord;

const DEAL_COLUMNS: &str = "id, source_record_id, organization_id, scan_id, extracted_at, \
     page_number, deal_name, amount, pipeline, deal_stage, close_date, currency_code, \
     owner_id, is_closed, is_closed_won, archived, custom_properties";

/// Repository for the relational sink.
///
/// Replace disposition: the unique key on (scan_id, source_record_id)
/// absorbs the duplicates a mid-page pause can produce, so re-extracting
/// a page after resume overwrites in place.
pub struct DealRepository;

impl DealRepository {
    pub async fn upsert(pool: &Pool<Postgres>, record: &DealRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO crm_deals
                (id, source_record_id, organization_id, scan_id, extracted_at,
                 source_system, api_version, page_number, deal_name, amount,
                 pipeline, deal_stage, deal_type, description, close_date,
                 create_date, last_modified, currency_code, owner_id,
                 is_closed, is_closed_won, num_associated_contacts,
                 days_to_close, archived, source_created_at, source_updated_at,
                 custom_properties)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24,
                    $25, $26, $27)
            ON CONFLICT (scan_id, source_record_id) DO UPDATE SET
                extracted_at = EXCLUDED.extracted_at,
                page_number = EXCLUDED.page_number,
                deal_name = EXCLUDED.deal_name,
                amount = EXCLUDED.amount,
                pipeline = EXCLUDED.pipeline,
                deal_stage = EXCLUDED.deal_stage,
                deal_type = EXCLUDED.deal_type,
                description = EXCLUDED.description,
                close_date = EXCLUDED.close_date,
                create_date = EXCLUDED.create_date,
                last_modified = EXCLUDED.last_modified,
                currency_code = EXCLUDED.currency_code,
                owner_id = EXCLUDED.owner_id,
                is_closed = EXCLUDED.is_closed,
                is_closed_won = EXCLUDED.is_closed_won,
                num_associated_contacts = EXCLUDED.num_associated_contacts,
                days_to_close = EXCLUDED.days_to_close,
                archived = EXCLUDED.archived,
                source_created_at = EXCLUDED.source_created_at,
                source_updated_at = EXCLUDED.source_updated_at,
                custom_properties = EXCLUDED.custom_properties
            "#,
        )
        .bind(&record.id)
        .bind(&record.source_record_id)
        .bind(&record.organization_id)
        .bind(&record.scan_id)
        .bind(record.extracted_at)
        .bind(&record.source_system)
        .bind(&record.api_version)
        .bind(record.page_number)
        .bind(&record.deal_name)
        .bind(record.amount)
        .bind(&record.pipeline)
        .bind(&record.deal_stage)
        .bind(&record.deal_type)
        .bind(&record.description)
        .bind(record.close_date)
        .bind(record.create_date)
        .bind(record.last_modified)
        .bind(&record.currency_code)
        .bind(&record.owner_id)
        .bind(record.is_closed)
        .bind(record.is_closed_won)
        .bind(record.num_associated_contacts)
        .bind(record.days_to_close)
        .bind(record.archived)
        .bind(record.source_created_at)
        .bind(record.source_updated_at)
        .bind(&record.custom_properties)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn list_for_scan(
        pool: &Pool<Postgres>,
        scan_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DealRow>, sqlx::Error> {
        let query = format!(
            "SELECT {} FROM crm_deals WHERE scan_id = $1 \
             ORDER BY page_number, source_record_id LIMIT $2 OFFSET $3",
            DEAL_COLUMNS
        );
        sqlx::query_as::<_, DealRow>(&query)
            .bind(scan_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    pub async fn count_for_scan(pool: &Pool<Postgres>, scan_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM crm_deals WHERE scan_id = $1")
            .bind(scan_id)
            .fetch_one(pool)
            .await
    }

    pub async fn delete_for_scan(pool: &Pool<Postgres>, scan_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM crm_deals WHERE scan_id = $1")
            .bind(scan_id)
            .execute(pool)
            .await?;

        debug!(
            "Removed extracted data: scan_id={}, rows={}",
            scan_id,
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }
}
