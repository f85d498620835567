//! Build job queue backed by PostgreSQL.
//!
//! Every status write is a conditional update on the current status, so two
//! workers that receive the same notification cannot both claim the job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgeline_core::queue::{ChangeKind, ChangeStream, ClaimOutcome, JobChange, JobQueue};
use forgeline_core::{ArtifactUrls, Job, JobId, JobStatus};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::VecDeque;
use sqlx::postgres::PgListener;
use tracing::{debug, info, warn};

use crate::{DbError, DbResult};

/// Notification channel the `build_jobs` trigger publishes on.
pub const CHANGES_CHANNEL: &str = "build_jobs_changes";

/// A build job record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: uuid::Uuid,
    pub project_id: String,
    pub source_url: String,
    pub version: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
    pub error_log: Option<String>,
    pub aab_url: Option<String>,
    pub apk_url: Option<String>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(record: JobRecord) -> DbResult<Self> {
        let status: JobStatus = record
            .status
            .parse()
            .map_err(|e| DbError::InvalidRecord(format!("job {}: {}", record.id, e)))?;

        let artifacts = match (record.aab_url, record.apk_url) {
            (Some(aab_url), Some(apk_url)) => Some(ArtifactUrls { aab_url, apk_url }),
            _ => None,
        };

        Ok(Job {
            id: JobId::from(record.id),
            project_id: record.project_id,
            source_url: record.source_url,
            version: record.version,
            status,
            updated_at: record.updated_at,
            error_log: record.error_log,
            artifacts,
        })
    }
}

/// Payload published by the `notify_build_job_change` trigger.
#[derive(Debug, Deserialize)]
struct ChangePayload {
    kind: ChangeKind,
    id: uuid::Uuid,
}

/// PostgreSQL implementation of JobQueue.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new queued job.
    pub async fn enqueue(
        &self,
        project_id: &str,
        source_url: &str,
        version: &str,
    ) -> DbResult<Job> {
        let id = JobId::generate();
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO build_jobs (id, project_id, source_url, version, status, updated_at)
            VALUES ($1, $2, $3, $4, 'queued', NOW())
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(project_id)
        .bind(source_url)
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    /// All jobs currently queued, oldest first.
    pub async fn list_queued(&self) -> DbResult<Vec<Job>> {
        fetch_queued(&self.pool).await
    }

    async fn conflict(&self, id: JobId, wanted: JobStatus) -> DbError {
        match fetch_job(&self.pool, id).await {
            Ok(Some(job)) => DbError::Conflict(format!(
                "job {} is {}, cannot move to {}",
                id, job.status, wanted
            )),
            Ok(None) => DbError::NotFound(format!("job {}", id)),
            Err(e) => e,
        }
    }
}

async fn fetch_queued(pool: &PgPool) -> DbResult<Vec<Job>> {
    let records = sqlx::query_as::<_, JobRecord>(
        "SELECT * FROM build_jobs WHERE status = 'queued' ORDER BY updated_at ASC",
    )
    .fetch_all(pool)
    .await?;
    records.into_iter().map(Job::try_from).collect()
}

async fn fetch_job(pool: &PgPool, id: JobId) -> DbResult<Option<Job>> {
    sqlx::query_as::<_, JobRecord>("SELECT * FROM build_jobs WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_optional(pool)
        .await?
        .map(Job::try_from)
        .transpose()
}

/// Turn one notification into a change, fetching a fresh snapshot of the job.
async fn decode_change(pool: &PgPool, payload: &str) -> Option<JobChange> {
    let payload: ChangePayload = match serde_json::from_str(payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(payload, error = %e, "Ignoring malformed job notification");
            return None;
        }
    };

    let job_id = JobId::from(payload.id);
    let job = match payload.kind {
        ChangeKind::Removed => None,
        ChangeKind::Added | ChangeKind::Modified => match fetch_job(pool, job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to load job snapshot");
                None
            }
        },
    };

    Some(JobChange {
        kind: payload.kind,
        job_id,
        job,
    })
}

/// Live half of a subscription.
///
/// Notifications sent while the listener connection is down are lost, so a
/// reconnect re-announces every queued job as added.
struct LiveFeed {
    listener: PgListener,
    pool: PgPool,
    pending: VecDeque<JobChange>,
}

impl LiveFeed {
    async fn next_change(&mut self) -> forgeline_core::Result<JobChange> {
        loop {
            if let Some(change) = self.pending.pop_front() {
                return Ok(change);
            }

            let notification = self
                .listener
                .try_recv()
                .await
                .map_err(|e| forgeline_core::Error::Subscription(e.to_string()))?;

            let Some(notification) = notification else {
                warn!(
                    channel = CHANGES_CHANNEL,
                    "Job listener connection lost, re-reading queued jobs"
                );
                // Reconnect and LISTEN again before the snapshot so nothing
                // inserted in between is missed.
                sqlx::query("SELECT 1")
                    .execute(&mut self.listener)
                    .await
                    .map_err(|e| forgeline_core::Error::Subscription(e.to_string()))?;
                let queued = fetch_queued(&self.pool).await?;
                self.pending.extend(queued.into_iter().map(JobChange::added));
                continue;
            };

            debug!(payload = notification.payload(), "Job notification");
            if let Some(change) = decode_change(&self.pool, notification.payload()).await {
                return Ok(change);
            }
        }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, id: JobId) -> forgeline_core::Result<Option<Job>> {
        Ok(fetch_job(&self.pool, id).await?)
    }

    async fn claim(&self, id: JobId) -> forgeline_core::Result<ClaimOutcome> {
        let claimed = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE build_jobs
            SET status = 'building', updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        if let Some(record) = claimed {
            return Ok(ClaimOutcome::Claimed(Job::try_from(record)?));
        }

        Ok(match fetch_job(&self.pool, id).await? {
            Some(job) => ClaimOutcome::NotQueued(job.status),
            None => ClaimOutcome::NotFound,
        })
    }

    async fn mark_succeeded(
        &self,
        id: JobId,
        artifacts: &ArtifactUrls,
    ) -> forgeline_core::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE build_jobs
            SET status = 'success', updated_at = NOW(), aab_url = $2, apk_url = $3
            WHERE id = $1 AND status = 'building'
            "#,
        )
        .bind(id.as_uuid())
        .bind(&artifacts.aab_url)
        .bind(&artifacts.apk_url)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, JobStatus::Success).await.into());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: JobId, error_log: &str) -> forgeline_core::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE build_jobs
            SET status = 'failed', updated_at = NOW(), error_log = $2
            WHERE id = $1 AND status = 'building'
            "#,
        )
        .bind(id.as_uuid())
        .bind(error_log)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, JobStatus::Failed).await.into());
        }
        Ok(())
    }

    async fn subscribe(&self) -> forgeline_core::Result<ChangeStream> {
        // Listen before taking the snapshot so no insert falls in between.
        // A job in both is delivered twice; claiming makes that harmless.
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| forgeline_core::Error::Subscription(e.to_string()))?;
        listener
            .listen(CHANGES_CHANNEL)
            .await
            .map_err(|e| forgeline_core::Error::Subscription(e.to_string()))?;

        let queued = self.list_queued().await?;
        info!(queued = queued.len(), channel = CHANGES_CHANNEL, "Subscribed to job changes");

        let initial = stream::iter(queued.into_iter().map(|job| Ok(JobChange::added(job))));

        let feed = LiveFeed {
            listener,
            pool: self.pool.clone(),
            pending: VecDeque::new(),
        };
        let live = stream::unfold(Some(feed), |state| async move {
            let mut feed = state?;
            match feed.next_change().await {
                Ok(change) => Some((Ok(change), Some(feed))),
                Err(e) => Some((Err(e), None)),
            }
        });

        Ok(initial.chain(live).boxed())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
