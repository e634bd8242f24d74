//! Postgres store backend.
//!
//! Plain runtime queries (no compile-time checking) so the crate builds
//! without a live database. The schema is owned by the platform's
//! migration pipeline; this worker only issues the statements below.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use fd_domain::message::{Message, MessageContent, Role};
use fd_domain::run::{RunStatus, TierInfo};
use fd_domain::{Error, Result};

use crate::{CreditDeduction, Database, NewMessage};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(url)
            .await
            .map_err(from_sqlx)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn from_sqlx(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

#[async_trait::async_trait]
impl Database for PgStore {
    async fn insert_message(&self, message: &NewMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages
                (message_id, thread_id, type, content, metadata, agent_id,
                 is_llm_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.thread_id)
        .bind(&message.kind)
        .bind(&message.content)
        .bind(&message.metadata)
        .bind(&message.agent_id)
        .bind(message.is_llm_message)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }

    async fn deduct_credits(&self, deduction: &CreditDeduction) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(from_sqlx)?;
        sqlx::query(
            r#"
            UPDATE credit_accounts
               SET balance = balance - $2
             WHERE account_id = $1
            "#,
        )
        .bind(&deduction.account_id)
        .bind(deduction.amount)
        .execute(&mut *tx)
        .await
        .map_err(from_sqlx)?;
        sqlx::query(
            r#"
            INSERT INTO credit_ledger
                (account_id, amount, thread_id, run_id, description, created_at)
            VALUES ($1, $2, $3, $4, $5, now())
            "#,
        )
        .bind(&deduction.account_id)
        .bind(deduction.amount)
        .bind(&deduction.thread_id)
        .bind(&deduction.run_id)
        .bind(&deduction.description)
        .execute(&mut *tx)
        .await
        .map_err(from_sqlx)?;
        tx.commit().await.map_err(from_sqlx)
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agent_runs
               SET status = $2, error = $3, updated_at = now()
             WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }

    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, thread_id, type, content, metadata, created_at
              FROM messages
             WHERE thread_id = $1 AND is_llm_message = true
             ORDER BY created_at ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("type").map_err(from_sqlx)?;
            let role = match kind.as_str() {
                "system" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                _ => continue,
            };
            let content_value: serde_json::Value =
                row.try_get("content").map_err(from_sqlx)?;
            let content: MessageContent = serde_json::from_value(content_value.clone())
                .unwrap_or(MessageContent::Text(content_value.to_string()));
            out.push(Message {
                message_id: row.try_get("message_id").map_err(from_sqlx)?,
                thread_id: row.try_get("thread_id").map_err(from_sqlx)?,
                role,
                content,
                metadata: row.try_get("metadata").ok(),
                created_at: row.try_get("created_at").map_err(from_sqlx)?,
                is_llm_message: true,
            });
        }
        Ok(out)
    }

    async fn tier_info(&self, account_id: &str) -> Result<Option<TierInfo>> {
        let row = sqlx::query(
            r#"
            SELECT tier_name, concurrent_runs_limit, allowed_models, allowed_tools
              FROM account_tiers
             WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)?;

        Ok(match row {
            Some(row) => Some(TierInfo {
                tier_name: row.try_get("tier_name").map_err(from_sqlx)?,
                concurrent_runs_limit: row
                    .try_get::<i32, _>("concurrent_runs_limit")
                    .map_err(from_sqlx)? as u32,
                allowed_models: row
                    .try_get::<Option<Vec<String>>, _>("allowed_models")
                    .map_err(from_sqlx)?
                    .unwrap_or_default(),
                allowed_tools: row
                    .try_get::<Option<Vec<String>>, _>("allowed_tools")
                    .map_err(from_sqlx)?
                    .unwrap_or_default(),
            }),
            None => None,
        })
    }

    async fn count_running_runs(&self, account_id: &str) -> Result<u32> {
        let row = sqlx::query(
            r#"
            SELECT count(*) AS n
              FROM agent_runs
             WHERE account_id = $1 AND status = 'running'
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        let n: i64 = row.try_get("n").map_err(from_sqlx)?;
        Ok(n.max(0) as u32)
    }

    async fn credit_balance(&self, account_id: &str) -> Result<f64> {
        let row = sqlx::query(
            r#"
            SELECT balance FROM credit_accounts WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(match row {
            Some(row) => row.try_get("balance").map_err(from_sqlx)?,
            None => 0.0,
        })
    }
}
