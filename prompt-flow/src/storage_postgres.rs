use async_trait::async_trait;
use sqlx::{PgPool, Row, types::Json};
use tracing::info;

use crate::{
    error::Result,
    models::InsuranceRecord,
    storage::{ChecklistSession, ChecklistSessionStore, RecordStore},
};

const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS insurance_records (
    id BIGSERIAL PRIMARY KEY,
    record JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS checklist_sessions (
    id TEXT PRIMARY KEY,
    session JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

/// Connect and make sure both tables exist.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPool::connect(database_url).await?;
    sqlx::query(CREATE_RECORDS_TABLE).execute(&pool).await?;
    sqlx::query(CREATE_SESSIONS_TABLE).execute(&pool).await?;
    info!("PostgreSQL storage ready");
    Ok(pool)
}

/// Records as JSONB rows; the serial id gives append order.
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn append(&self, record: InsuranceRecord) -> Result<()> {
        sqlx::query("INSERT INTO insurance_records (record) VALUES ($1)")
            .bind(Json(&record))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<InsuranceRecord>> {
        let rows = sqlx::query("SELECT record FROM insurance_records ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let Json(record): Json<InsuranceRecord> = row.try_get("record")?;
                Ok(record)
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct PostgresChecklistSessionStore {
    pool: PgPool,
}

impl PostgresChecklistSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChecklistSessionStore for PostgresChecklistSessionStore {
    async fn save(&self, session: ChecklistSession) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO checklist_sessions (id, session, updated_at)
               VALUES ($1, $2, NOW())
               ON CONFLICT (id) DO UPDATE SET session = EXCLUDED.session, updated_at = NOW()"#,
        )
        .bind(&session.id)
        .bind(Json(&session))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ChecklistSession>> {
        let row = sqlx::query("SELECT session FROM checklist_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let Json(session): Json<ChecklistSession> = row.try_get("session")?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checklist_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
