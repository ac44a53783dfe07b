// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Durable job/payment ledger over SQLite. Runtime entries come and go;
// ledger rows outlive them and are what the settlement side reads.

use crate::queue::{Job, JobStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// One row of the `job` table.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: String,
    pub model: String,
    pub node_id: Option<String>,
    pub node_payout_address: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row of the `payment` table.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecord {
    pub job_id: String,
    pub amount: f64,
    pub transaction_hash: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Accounting fields extracted from a finished job's chunk stream.
#[derive(Debug, Default, Clone)]
pub struct JobAccounting {
    pub node_id: Option<String>,
    pub node_payout_address: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (creating if missing) the ledger database and initialize the
    /// schema. Accepts `sqlite://path`, a bare path, or `sqlite::memory:`.
    pub async fn open(url: &str) -> Result<Self> {
        let db_url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite://{}", url)
        };

        // SQLite needs the parent directory to exist before it can create
        // the file.
        if let Some(path) = db_url
            .strip_prefix("sqlite://")
            .filter(|p| !p.starts_with(":memory:"))
        {
            if let Some(dir) = Path::new(path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("failed to create {}", dir.display()))?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(&db_url)
            .with_context(|| format!("invalid database url {}", db_url))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to ledger database")?;

        let ledger = Self { pool };
        ledger.init_schema().await?;
        info!("ledger database ready at {}", db_url);
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job (
                job_id TEXT PRIMARY KEY NOT NULL,
                status TEXT NOT NULL,
                model TEXT NOT NULL,
                node_id TEXT,
                node_payout_address TEXT,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payment (
                job_id TEXT PRIMARY KEY NOT NULL REFERENCES job(job_id),
                amount REAL NOT NULL,
                transaction_hash TEXT,
                paid_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert the ledger row for a freshly created job (status pending).
    pub async fn create_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO job (job_id, status, model, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&job.job_id)
        .bind(JobStatus::Pending.as_str())
        .bind(&job.model)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record dispatch: the job left pending and (when known) which node
    /// took it. Terminal rows are never touched.
    pub async fn mark_running(&self, job_id: &str, node_id: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE job SET status = ?, node_id = COALESCE(?, node_id)
             WHERE job_id = ? AND status = ?",
        )
        .bind(JobStatus::InProgress.as_str())
        .bind(node_id)
        .bind(job_id)
        .bind(JobStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One-time terminal update with the accounting extracted from the
    /// chunk stream. The `completed_at IS NULL` guard keeps the row's
    /// terminal state first-writer-wins.
    pub async fn record_completion(
        &self,
        job_id: &str,
        status: JobStatus,
        accounting: &JobAccounting,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE job SET
                 status = ?,
                 node_id = COALESCE(?, node_id),
                 node_payout_address = COALESCE(?, node_payout_address),
                 prompt_tokens = ?,
                 completion_tokens = ?,
                 total_tokens = ?,
                 completed_at = ?
             WHERE job_id = ? AND completed_at IS NULL",
        )
        .bind(status.as_str())
        .bind(&accounting.node_id)
        .bind(&accounting.node_payout_address)
        .bind(accounting.prompt_tokens)
        .bind(accounting.completion_tokens)
        .bind(accounting.total_tokens)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            "SELECT job_id, status, model, node_id, node_payout_address,
                    prompt_tokens, completion_tokens, total_tokens,
                    created_at, completed_at
             FROM job WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_job_record).transpose()
    }

    /// Record a settlement confirmation. Maps the caller's transaction
    /// hash onto the payment row's tx column and stamps `paid_at = now`;
    /// repeated confirmations overwrite.
    pub async fn confirm_payment(
        &self,
        job_id: &str,
        amount: f64,
        transaction_hash: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO payment (job_id, amount, transaction_hash, paid_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (job_id) DO UPDATE SET
                 amount = excluded.amount,
                 transaction_hash = excluded.transaction_hash,
                 paid_at = excluded.paid_at",
        )
        .bind(job_id)
        .bind(amount)
        .bind(transaction_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_payment(&self, job_id: &str) -> Result<Option<PaymentRecord>> {
        let row = sqlx::query(
            "SELECT job_id, amount, transaction_hash, paid_at FROM payment WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PaymentRecord {
            job_id: r.get("job_id"),
            amount: r.get("amount"),
            transaction_hash: r.get("transaction_hash"),
            paid_at: r.get("paid_at"),
        }))
    }
}

fn row_to_job_record(row: &SqliteRow) -> Result<JobRecord> {
    Ok(JobRecord {
        job_id: row.try_get("job_id")?,
        status: row.try_get("status")?,
        model: row.try_get("model")?,
        node_id: row.try_get("node_id")?,
        node_payout_address: row.try_get("node_payout_address")?,
        prompt_tokens: row.try_get("prompt_tokens")?,
        completion_tokens: row.try_get("completion_tokens")?,
        total_tokens: row.try_get("total_tokens")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
