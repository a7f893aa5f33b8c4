//! Record store for dispatch jobs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::sync::RwLock;
use uuid::Uuid;

use herald_common::types::{Channel, DispatchJob, JobStatus, MessageRequest};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &DispatchJob) -> anyhow::Result<()>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<DispatchJob>>;

    /// Persist the mutable part of a job (status, attempts, last error, provider response).
    async fn update(&self, job: &DispatchJob) -> anyhow::Result<()>;

    /// Most recent jobs of a customer, newest first.
    async fn list_by_customer(&self, customer_id: Uuid, limit: u32)
    -> anyhow::Result<Vec<DispatchJob>>;

    /// Newest job of a customer on `channel` addressed to the normalized `recipient`.
    async fn latest_for_recipient(
        &self,
        customer_id: Uuid,
        channel: Channel,
        recipient: &str,
    ) -> anyhow::Result<Option<DispatchJob>>;

    /// Store a delivery receipt on a job, replacing any earlier one.
    async fn record_receipt(&self, id: Uuid, receipt: &serde_json::Value) -> anyhow::Result<()>;
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    customer_id: Uuid,
    channel: Channel,
    request: Json<MessageRequest>,
    dispatch_at: DateTime<Utc>,
    delay_ms: i64,
    attempts: i32,
    status: JobStatus,
    last_error: Option<String>,
    provider_response: Option<serde_json::Value>,
    received: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRow> for DispatchJob {
    fn from(row: JobRow) -> Self {
        let mut request = row.request.0;
        request.channel = row.channel;
        Self {
            id: row.id,
            customer_id: row.customer_id,
            request,
            dispatch_at: row.dispatch_at,
            delay_ms: row.delay_ms,
            attempts: row.attempts.max(0) as u32,
            status: row.status,
            last_error: row.last_error,
            provider_response: row.provider_response,
            received: row.received,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const JOB_COLUMNS: &str = "id, customer_id, channel, request, dispatch_at, delay_ms, attempts, \
     status, last_error, provider_response, received, created_at, updated_at";

/// PostgreSQL store over the `dispatch_jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &DispatchJob) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_jobs
                (id, customer_id, channel, request, recipient, dispatch_at, delay_ms, attempts,
                 status, last_error, provider_response, received, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id)
        .bind(job.customer_id)
        .bind(job.channel())
        .bind(Json(&job.request))
        .bind(job.recipient_address())
        .bind(job.dispatch_at)
        .bind(job.delay_ms)
        .bind(job.attempts as i32)
        .bind(job.status)
        .bind(&job.last_error)
        .bind(&job.provider_response)
        .bind(&job.received)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<DispatchJob>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {} FROM dispatch_jobs WHERE id = $1", JOB_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(DispatchJob::from))
    }

    async fn update(&self, job: &DispatchJob) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = $2, attempts = $3, last_error = $4, provider_response = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status)
        .bind(job.attempts as i32)
        .bind(&job.last_error)
        .bind(&job.provider_response)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("dispatch job {} does not exist", job.id);
        }
        Ok(())
    }

    async fn list_by_customer(
        &self,
        customer_id: Uuid,
        limit: u32,
    ) -> anyhow::Result<Vec<DispatchJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM dispatch_jobs WHERE customer_id = $1 ORDER BY created_at DESC LIMIT $2",
            JOB_COLUMNS
        ))
        .bind(customer_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DispatchJob::from).collect())
    }

    async fn latest_for_recipient(
        &self,
        customer_id: Uuid,
        channel: Channel,
        recipient: &str,
    ) -> anyhow::Result<Option<DispatchJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM dispatch_jobs
            WHERE customer_id = $1 AND channel = $2 AND recipient = $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            JOB_COLUMNS
        ))
        .bind(customer_id)
        .bind(channel)
        .bind(recipient)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DispatchJob::from))
    }

    async fn record_receipt(&self, id: Uuid, receipt: &serde_json::Value) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE dispatch_jobs SET received = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(receipt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("dispatch job {} does not exist", id);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, DispatchJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<DispatchJob> {
        self.jobs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &DispatchJob) -> anyhow::Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            anyhow::bail!("dispatch job {} already exists", job.id);
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<DispatchJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, job: &DispatchJob) -> anyhow::Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                // Receipts are written separately and survive status updates.
                let received = stored.received.take();
                *stored = job.clone();
                stored.received = received;
                Ok(())
            }
            None => anyhow::bail!("dispatch job {} does not exist", job.id),
        }
    }

    async fn list_by_customer(
        &self,
        customer_id: Uuid,
        limit: u32,
    ) -> anyhow::Result<Vec<DispatchJob>> {
        let jobs = self.jobs.read().await;
        let mut owned: Vec<DispatchJob> = jobs
            .values()
            .filter(|job| job.customer_id == customer_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.truncate(limit as usize);
        Ok(owned)
    }

    async fn latest_for_recipient(
        &self,
        customer_id: Uuid,
        channel: Channel,
        recipient: &str,
    ) -> anyhow::Result<Option<DispatchJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| {
                job.customer_id == customer_id
                    && job.channel() == channel
                    && job.recipient_address() == recipient
            })
            .max_by_key(|job| job.created_at)
            .cloned())
    }

    async fn record_receipt(&self, id: Uuid, receipt: &serde_json::Value) -> anyhow::Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(stored) => {
                stored.received = Some(receipt.clone());
                Ok(())
            }
            None => anyhow::bail!("dispatch job {} does not exist", id),
        }
    }
}
