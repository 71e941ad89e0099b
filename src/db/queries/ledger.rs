//! Establishment, participant and operation writes
//!
//! Monetary values travel as integer cents and are converted to
//! `NUMERIC(18,2)` in SQL.

use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::services::ledger::SinkError;
use crate::types::{EstablishmentRecord, OperationRow, ParticipantRow};

/// Map a database error onto the accumulator's fallback policy.
///
/// `42P10` (no unique index matches the conflict target) and integrity
/// violations (`23xxx`) may still succeed as a plain insert.
pub fn classify(e: sqlx::Error) -> SinkError {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code() {
            if code == "42P10" || code.starts_with("23") {
                return SinkError::Constraint(format!("{} ({})", db.message(), code));
            }
        }
    }
    SinkError::Backend(e.to_string())
}

/// Find or create an establishment by `(company_id, tax_id)`
pub async fn resolve_establishment(
    pool: &PgPool,
    company_id: Uuid,
    record: &EstablishmentRecord,
) -> Result<(Uuid, bool), SinkError> {
    let created: Option<Uuid> = sqlx::query_scalar(
        r#"
        INSERT INTO establishments (id, company_id, tax_id, code, name, state, registration)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (company_id, tax_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(company_id)
    .bind(&record.tax_id)
    .bind(&record.code)
    .bind(&record.name)
    .bind(&record.state)
    .bind(&record.registration)
    .fetch_optional(pool)
    .await
    .map_err(classify)?;

    if let Some(id) = created {
        return Ok((id, true));
    }

    let id: Uuid = sqlx::query_scalar("SELECT id FROM establishments WHERE company_id = $1 AND tax_id = $2")
        .bind(company_id)
        .bind(&record.tax_id)
        .fetch_one(pool)
        .await
        .map_err(classify)?;
    Ok((id, false))
}

fn participants_insert(rows: &[ParticipantRow]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO participants (establishment_id, code, name, country_code, tax_id, \
         state_registration, municipality_code) ",
    );
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.establishment_id)
            .push_bind(&row.code)
            .push_bind(&row.name)
            .push_bind(&row.country_code)
            .push_bind(&row.tax_id)
            .push_bind(&row.state_registration)
            .push_bind(&row.municipality_code);
    });
    qb
}

/// Upsert participants; unchanged rows are not counted
pub async fn upsert_participants(pool: &PgPool, rows: &[ParticipantRow]) -> Result<u64, SinkError> {
    let mut qb = participants_insert(rows);
    qb.push(
        r#"
        ON CONFLICT (establishment_id, code) DO UPDATE SET
            name = EXCLUDED.name,
            country_code = EXCLUDED.country_code,
            tax_id = EXCLUDED.tax_id,
            state_registration = EXCLUDED.state_registration,
            municipality_code = EXCLUDED.municipality_code,
            updated_at = NOW()
        WHERE (participants.name, participants.country_code, participants.tax_id,
               participants.state_registration, participants.municipality_code)
            IS DISTINCT FROM
              (EXCLUDED.name, EXCLUDED.country_code, EXCLUDED.tax_id,
               EXCLUDED.state_registration, EXCLUDED.municipality_code)
        "#,
    );

    let result = qb.build().execute(pool).await.map_err(classify)?;
    Ok(result.rows_affected())
}

pub async fn insert_participants(pool: &PgPool, rows: &[ParticipantRow]) -> Result<u64, SinkError> {
    let result = participants_insert(rows)
        .build()
        .execute(pool)
        .await
        .map_err(classify)?;
    Ok(result.rows_affected())
}

fn operations_insert(job_id: Uuid, rows: &[OperationRow]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO ledger_operations (import_job_id, establishment_id, competence_month, direction, \
         category, cfop, partner_code, partner_name, document_number, document_date, \
         amount, icms, icms_st, ipi, pis, cofins) ",
    );
    qb.push_values(rows, |mut b, row| {
        b.push_bind(job_id)
            .push_bind(row.establishment_id)
            .push_bind(row.competence_month)
            .push_bind(row.direction.as_str())
            .push_bind(row.category.as_str())
            .push_bind(&row.cfop)
            .push_bind(&row.partner_code)
            .push_bind(&row.partner_name)
            .push_bind(&row.document_number)
            .push_bind(row.document_date);
        for cents in [
            row.amount_cents,
            row.icms_cents,
            row.icms_st_cents,
            row.ipi_cents,
            row.pis_cents,
            row.cofins_cents,
        ] {
            b.push_bind(cents).push_unseparated("::numeric / 100");
        }
    });
    qb
}

/// Insert operations, ignoring rows whose natural key already exists
pub async fn upsert_operations(pool: &PgPool, job_id: Uuid, rows: &[OperationRow]) -> Result<u64, SinkError> {
    let mut qb = operations_insert(job_id, rows);
    qb.push(
        " ON CONFLICT (establishment_id, competence_month, document_number, cfop, partner_code) DO NOTHING",
    );

    let result = qb.build().execute(pool).await.map_err(classify)?;
    Ok(result.rows_affected())
}

pub async fn insert_operations(pool: &PgPool, job_id: Uuid, rows: &[OperationRow]) -> Result<u64, SinkError> {
    let result = operations_insert(job_id, rows)
        .build()
        .execute(pool)
        .await
        .map_err(classify)?;
    Ok(result.rows_affected())
}

/// Rebuild the dashboard summaries of one company
pub async fn refresh_summaries(pool: &PgPool, company_id: Uuid) -> anyhow::Result<()> {
    sqlx::query("SELECT refresh_operation_summaries($1)")
        .bind(company_id)
        .execute(pool)
        .await?;
    Ok(())
}
