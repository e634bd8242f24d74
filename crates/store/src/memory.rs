//! In-memory store backend with fault injection for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use fd_domain::message::{Message, MessageContent, Role};
use fd_domain::run::{RunStatus, TierInfo};
use fd_domain::{Error, Result};

use crate::{CreditDeduction, Database, NewMessage};

#[derive(Default)]
struct Inner {
    /// thread_id → ordered rows.
    messages: HashMap<String, Vec<NewMessage>>,
    deductions: Vec<CreditDeduction>,
    run_statuses: HashMap<String, (RunStatus, Option<String>)>,
    tiers: HashMap<String, TierInfo>,
    running_runs: HashMap<String, u32>,
    balances: HashMap<String, f64>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Fail the next N insert_message calls (fault injection).
    fail_next_inserts: AtomicU32,
    /// Error string injected failures carry; "connection reset" reads as
    /// transient, anything else as permanent.
    fail_error: Mutex<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            fail_error: Mutex::new("connection reset".into()),
            ..Self::default()
        }
    }

    // ── Test scaffolding ─────────────────────────────────────────────

    pub fn fail_next_inserts(&self, count: u32, error: &str) {
        self.fail_next_inserts.store(count, Ordering::SeqCst);
        *self.fail_error.lock() = error.to_owned();
    }

    pub fn set_tier(&self, account_id: &str, tier: TierInfo) {
        self.inner.lock().tiers.insert(account_id.into(), tier);
    }

    pub fn set_running_runs(&self, account_id: &str, count: u32) {
        self.inner
            .lock()
            .running_runs
            .insert(account_id.into(), count);
    }

    pub fn set_balance(&self, account_id: &str, balance: f64) {
        self.inner.lock().balances.insert(account_id.into(), balance);
    }

    pub fn seed_message(&self, message: Message) {
        let row = NewMessage {
            message_id: message.message_id.clone(),
            thread_id: message.thread_id.clone(),
            kind: role_str(message.role).into(),
            content: serde_json::to_value(&message.content).unwrap_or_default(),
            metadata: message.metadata.clone(),
            agent_id: None,
            is_llm_message: message.is_llm_message,
            created_at: message.created_at,
        };
        self.inner
            .lock()
            .messages
            .entry(row.thread_id.clone())
            .or_default()
            .push(row);
    }

    // ── Assertions ───────────────────────────────────────────────────

    pub fn message_count(&self, thread_id: &str) -> usize {
        self.inner
            .lock()
            .messages
            .get(thread_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn messages_of(&self, thread_id: &str) -> Vec<NewMessage> {
        self.inner
            .lock()
            .messages
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn deductions(&self) -> Vec<CreditDeduction> {
        self.inner.lock().deductions.clone()
    }

    pub fn run_status(&self, run_id: &str) -> Option<(RunStatus, Option<String>)> {
        self.inner.lock().run_statuses.get(run_id).cloned()
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
        Role::Status => "status",
        Role::ImageContext => "image_context",
    }
}

fn role_from_str(s: &str) -> Option<Role> {
    match s {
        "system" => Some(Role::System),
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        "tool" => Some(Role::Tool),
        "status" => Some(Role::Status),
        "image_context" => Some(Role::ImageContext),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Database for MemoryStore {
    async fn insert_message(&self, message: &NewMessage) -> Result<()> {
        let remaining = self.fail_next_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_inserts.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Database(self.fail_error.lock().clone()));
        }
        let mut inner = self.inner.lock();
        let rows = inner.messages.entry(message.thread_id.clone()).or_default();
        // Idempotent on message_id so retried flushes don't duplicate.
        if rows.iter().any(|m| m.message_id == message.message_id) {
            return Ok(());
        }
        rows.push(message.clone());
        Ok(())
    }

    async fn deduct_credits(&self, deduction: &CreditDeduction) -> Result<()> {
        let mut inner = self.inner.lock();
        let balance = inner
            .balances
            .entry(deduction.account_id.clone())
            .or_insert(0.0);
        *balance -= deduction.amount;
        inner.deductions.push(deduction.clone());
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.inner
            .lock()
            .run_statuses
            .insert(run_id.into(), (status, error.map(String::from)));
        Ok(())
    }

    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        let inner = self.inner.lock();
        let rows = match inner.messages.get(thread_id) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        for row in rows {
            if !row.is_llm_message {
                continue;
            }
            let Some(role) = role_from_str(&row.kind) else {
                continue;
            };
            let content: MessageContent = serde_json::from_value(row.content.clone())
                .unwrap_or(MessageContent::Text(row.content.to_string()));
            out.push(Message {
                message_id: row.message_id.clone(),
                thread_id: row.thread_id.clone(),
                role,
                content,
                metadata: row.metadata.clone(),
                created_at: row.created_at,
                is_llm_message: true,
            });
        }
        Ok(out)
    }

    async fn tier_info(&self, account_id: &str) -> Result<Option<TierInfo>> {
        Ok(self.inner.lock().tiers.get(account_id).cloned())
    }

    async fn count_running_runs(&self, account_id: &str) -> Result<u32> {
        Ok(*self
            .inner
            .lock()
            .running_runs
            .get(account_id)
            .unwrap_or(&0))
    }

    async fn credit_balance(&self, account_id: &str) -> Result<f64> {
        Ok(*self.inner.lock().balances.get(account_id).unwrap_or(&0.0))
    }
}
