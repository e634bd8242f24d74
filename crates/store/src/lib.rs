//! Relational-store contract.
//!
//! The flusher and preparation pipeline touch the database through this
//! trait only: insert a message, apply an aggregated credit deduction,
//! update a run's terminal status, and a handful of reads (history, tier
//! info, running-run count, credit balance). [`PgStore`] is the production
//! backend; [`MemoryStore`] backs tests and single-process deployments.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fd_domain::message::Message;
use fd_domain::run::{RunStatus, TierInfo};
use fd_domain::Result;

/// A message row bound for the `messages` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub message_id: String,
    pub thread_id: String,
    /// Role column (`user`, `assistant`, `tool`, `status`, `image_context`).
    pub kind: String,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub is_llm_message: bool,
    pub created_at: DateTime<Utc>,
}

/// One aggregated credit deduction per flush cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditDeduction {
    pub account_id: String,
    pub amount: f64,
    pub thread_id: String,
    pub run_id: String,
    pub description: String,
}

#[async_trait::async_trait]
pub trait Database: Send + Sync {
    async fn insert_message(&self, message: &NewMessage) -> Result<()>;

    async fn deduct_credits(&self, deduction: &CreditDeduction) -> Result<()>;

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// LLM-visible history of a thread, oldest first.
    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<Message>>;

    /// The account's tier record, if one exists.
    async fn tier_info(&self, account_id: &str) -> Result<Option<TierInfo>>;

    async fn count_running_runs(&self, account_id: &str) -> Result<u32>;

    /// Reservable credit balance.
    async fn credit_balance(&self, account_id: &str) -> Result<f64>;
}
