use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgDatabaseError, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use strum::IntoEnumIterator;

use crate::db::{ResumeStore, StoreError};
use crate::models::batch::{BatchJobRecord, BatchStatus};
use crate::models::field::{ExtractionResult, Field, FieldKind, FieldValue};
use crate::models::resume::{ResumeRecord, UserId};
use crate::services::validation::FieldViolation;

const JOB_COLUMNS: &str = "job_id, input_file_id, output_file_id, error_file_id, status, submitted_at, \
     last_checked_at, record_count, deadline, failure_reason, succeeded, failed";

/// Production store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgResumeStore {
    pool: PgPool,
}

impl PgResumeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn resume_from_row(row: &PgRow) -> Result<ResumeRecord, sqlx::Error> {
    let text: Option<String> = row.try_get("markdownresume")?;
    Ok(ResumeRecord {
        user_id: UserId(row.try_get("userid")?),
        text: text.unwrap_or_default(),
        last_processed: row.try_get("lastprocessed")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<BatchJobRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = BatchStatus::from_str(&status)
        .map_err(|_| StoreError::Schema(format!("unknown batch status {status:?}")))?;

    Ok(BatchJobRecord {
        job_id: row.try_get("job_id")?,
        input_file_id: row.try_get("input_file_id")?,
        output_file_id: row.try_get("output_file_id")?,
        error_file_id: row.try_get("error_file_id")?,
        status,
        submitted_at: row.try_get("submitted_at")?,
        last_checked_at: row.try_get("last_checked_at")?,
        record_count: row.try_get("record_count")?,
        deadline: row.try_get("deadline")?,
        failure_reason: row.try_get("failure_reason")?,
        succeeded: row.try_get("succeeded")?,
        failed: row.try_get("failed")?,
    })
}

/// Bind one field value with the SQL type of its column, including typed nulls.
fn push_value(builder: &mut QueryBuilder<'_, Postgres>, field: Field, value: &FieldValue) {
    match (value, field.kind()) {
        (FieldValue::Text(text), _) => builder.push_bind(text.clone()),
        (FieldValue::Date(date), _) => builder.push_bind(*date),
        (FieldValue::Years(years), _) => builder.push_bind(*years),
        (FieldValue::Null, FieldKind::Date) => builder.push_bind(None::<NaiveDate>),
        (FieldValue::Null, FieldKind::Years) => builder.push_bind(None::<f64>),
        (FieldValue::Null, _) => builder.push_bind(None::<String>),
    };
}

/// Name the field behind a data exception when the server reports the column.
fn field_error(e: sqlx::Error, result: &ExtractionResult) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        let is_data_error = db.code().is_some_and(|c| c.starts_with("22") || c.starts_with("23"));
        let field = db
            .try_downcast_ref::<PgDatabaseError>()
            .and_then(|pg| pg.column())
            .and_then(|column| Field::iter().find(|f| f.column() == column));
        if let (true, Some(field)) = (is_data_error, field) {
            return StoreError::FieldRejected {
                field,
                value: result.get(field).to_string(),
                message: db.message().to_string(),
            };
        }
    }
    StoreError::from(e)
}

#[async_trait]
impl ResumeStore for PgResumeStore {
    async fn fetch_unprocessed(
        &self,
        limit: usize,
        exclude: &[UserId],
    ) -> Result<Vec<ResumeRecord>, StoreError> {
        let excluded: Vec<i64> = exclude.iter().map(|id| id.0).collect();
        let rows = sqlx::query(
            r#"
            SELECT c.userid, c.markdownresume, c.lastprocessed
            FROM aicandidate c
            WHERE c.lastprocessed IS NULL
              AND c.markdownresume IS NOT NULL
              AND c.markdownresume <> ''
              AND NOT EXISTS (
                  SELECT 1
                  FROM batch_job_records r
                  JOIN batch_jobs j ON j.job_id = r.job_id
                  WHERE r.userid = c.userid
                    AND j.status IN ('submitted', 'polling', 'completed')
              )
              AND NOT (c.userid = ANY($2))
            ORDER BY c.datelastmodified DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .bind(excluded)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(resume_from_row).collect::<Result<_, _>>()?)
    }

    async fn fetch_by_id(&self, user_id: UserId) -> Result<ResumeRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT userid, markdownresume, lastprocessed
            FROM aicandidate
            WHERE userid = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(resume_from_row(&row)?),
            None => Err(StoreError::NotFound(user_id)),
        }
    }

    async fn apply_extraction(
        &self,
        result: &ExtractionResult,
        violations: &[FieldViolation],
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let user_id = result.user_id();
        let mut tx = self.pool.begin().await?;

        let mut update = QueryBuilder::<Postgres>::new("UPDATE aicandidate SET ");
        for (field, value) in result.iter() {
            update.push(field.column()).push(" = ");
            push_value(&mut update, field, value);
            update.push(", ");
        }
        update.push("lastprocessed = ");
        update.push_bind(processed_at);
        update.push(" WHERE userid = ");
        update.push_bind(user_id.0);

        let updated = update
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| field_error(e, result))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(user_id));
        }

        sqlx::query("DELETE FROM candidate_field_flags WHERE userid = $1")
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;

        if !violations.is_empty() {
            let mut flags = QueryBuilder::<Postgres>::new(
                "INSERT INTO candidate_field_flags (userid, field_name, raw_value, reason, flagged_at) ",
            );
            flags.push_values(violations, |mut row, v| {
                row.push_bind(user_id.0)
                    .push_bind(v.field.name())
                    .push_bind(v.value.clone())
                    .push_bind(v.reason.to_string())
                    .push_bind(processed_at);
            });
            flags.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_batch_job(
        &self,
        record: &BatchJobRecord,
        members: &[UserId],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // An applied job is retired; later writes never move it back.
        sqlx::query(
            r#"
            INSERT INTO batch_jobs (job_id, input_file_id, output_file_id, error_file_id, status,
                                    submitted_at, last_checked_at, record_count, deadline,
                                    failure_reason, succeeded, failed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (job_id) DO UPDATE SET
                output_file_id = EXCLUDED.output_file_id,
                error_file_id = EXCLUDED.error_file_id,
                status = EXCLUDED.status,
                last_checked_at = EXCLUDED.last_checked_at,
                failure_reason = EXCLUDED.failure_reason,
                succeeded = EXCLUDED.succeeded,
                failed = EXCLUDED.failed,
                updated_at = NOW()
            WHERE batch_jobs.status <> 'applied'
            "#,
        )
        .bind(&record.job_id)
        .bind(&record.input_file_id)
        .bind(&record.output_file_id)
        .bind(&record.error_file_id)
        .bind(record.status.to_string())
        .bind(record.submitted_at)
        .bind(record.last_checked_at)
        .bind(record.record_count)
        .bind(record.deadline)
        .bind(&record.failure_reason)
        .bind(record.succeeded)
        .bind(record.failed)
        .execute(&mut *tx)
        .await?;

        if !members.is_empty() {
            let mut insert =
                QueryBuilder::<Postgres>::new("INSERT INTO batch_job_records (job_id, userid) ");
            insert.push_values(members, |mut row, user_id| {
                row.push_bind(record.job_id.clone()).push_bind(user_id.0);
            });
            insert.push(" ON CONFLICT DO NOTHING");
            insert.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_batch_job(&self, job_id: &str) -> Result<Option<BatchJobRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM batch_jobs WHERE job_id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn open_batch_jobs(&self) -> Result<Vec<BatchJobRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs \
             WHERE status IN ('submitted', 'polling', 'completed') \
             ORDER BY submitted_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn batch_members(&self, job_id: &str) -> Result<Vec<UserId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT userid FROM batch_job_records
            WHERE job_id = $1
            ORDER BY userid
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<UserId, StoreError> { Ok(UserId(row.try_get("userid")?)) })
            .collect()
    }
}
