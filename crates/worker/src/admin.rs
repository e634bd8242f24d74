//! Admin control plane — the operator surface.
//!
//! Read endpoints expose run info, the dashboard, health, and metrics;
//! write endpoints force-resume/complete/fail runs, trigger sweeps and
//! flushes, and manage the DLQ. Auth is a bearer token compared by
//! SHA-256 hash; with no token configured the surface runs open (dev).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::lifecycle::WorkerLifecycle;
use crate::recovery::RecoverySweeper;
use crate::state::WorkerState;

#[derive(Clone)]
pub struct AdminState {
    pub state: WorkerState,
    pub recovery: Arc<RecoverySweeper>,
    pub lifecycle: Arc<WorkerLifecycle>,
    /// SHA-256 of the admin bearer token; `None` disables auth.
    pub token_hash: Option<Vec<u8>>,
}

impl AdminState {
    pub fn new(
        state: WorkerState,
        recovery: Arc<RecoverySweeper>,
        lifecycle: Arc<WorkerLifecycle>,
    ) -> Self {
        let token_hash = match std::env::var(&state.config.admin.token_env) {
            Ok(token) if !token.is_empty() => {
                tracing::info!("admin bearer-token auth enabled");
                Some(Sha256::digest(token.as_bytes()).to_vec())
            }
            _ => {
                tracing::warn!(
                    env_var = %state.config.admin.token_env,
                    "admin bearer-token auth DISABLED"
                );
                None
            }
        };
        Self {
            state,
            recovery,
            lifecycle,
            token_hash,
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        let Some(expected) = &self.token_hash else {
            return Ok(());
        };
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        let hash = Sha256::digest(presented.as_bytes()).to_vec();
        if &hash == expected {
            Ok(())
        } else {
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

pub fn router(admin: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/admin/recovery/stuck", get(list_stuck))
        .route("/admin/recovery/resume/:run_id", post(force_resume))
        .route("/admin/recovery/complete/:run_id", post(force_complete))
        .route("/admin/recovery/fail/:run_id", post(force_fail))
        .route("/admin/recovery/run/:run_id", get(run_info))
        .route("/admin/recovery/dashboard", get(dashboard))
        .route("/admin/recovery/sweep", post(trigger_sweep))
        .route("/admin/recovery/flush", post(trigger_flush))
        .route("/admin/dlq", get(dlq_entries))
        .route("/admin/dlq/retry/:entry_id", post(dlq_retry))
        .route("/admin/dlq/purge", post(dlq_purge))
        .with_state(admin)
}

// ── Health & metrics (unauthenticated probes) ─────────────────────────

async fn health(State(admin): State<AdminState>) -> impl IntoResponse {
    let health = admin.lifecycle.health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

async fn metrics(State(admin): State<AdminState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        admin.state.metrics.render(),
    )
}

// ── Recovery endpoints ────────────────────────────────────────────────

#[derive(Deserialize)]
struct StuckQuery {
    #[serde(default = "default_min_age")]
    min_age: u64,
}

fn default_min_age() -> u64 {
    5
}

async fn list_stuck(
    State(admin): State<AdminState>,
    headers: HeaderMap,
    Query(query): Query<StuckQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    let min_age = query.min_age.clamp(1, 120);
    let stuck = admin.recovery.get_stuck(min_age).await;
    tracing::info!(count = stuck.len(), min_age, "operator listed stuck runs");
    Ok(Json(stuck))
}

async fn force_resume(
    State(admin): State<AdminState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    let action = admin.recovery.force_resume(&run_id).await;
    tracing::info!(run_id = %run_id, success = action.success, "operator forced resume");
    Ok(Json(action))
}

#[derive(Deserialize)]
struct CompleteQuery {
    #[serde(default = "default_reason")]
    reason: String,
}

fn default_reason() -> String {
    "admin".into()
}

async fn force_complete(
    State(admin): State<AdminState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Query(query): Query<CompleteQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    let action = admin.recovery.force_complete(&run_id, &query.reason).await;
    tracing::info!(run_id = %run_id, reason = %query.reason, "operator forced completion");
    Ok(Json(action))
}

#[derive(Deserialize)]
struct FailBody {
    #[serde(default = "default_fail_error")]
    error: String,
}

fn default_fail_error() -> String {
    "Admin terminated".into()
}

async fn force_fail(
    State(admin): State<AdminState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    body: Option<Json<FailBody>>,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    let error = body
        .map(|Json(b)| b.error)
        .unwrap_or_else(default_fail_error);
    let action = admin.recovery.force_fail(&run_id, &error).await;
    tracing::info!(run_id = %run_id, error = %error, "operator forced failure");
    Ok(Json(action))
}

async fn run_info(
    State(admin): State<AdminState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    match admin.state.ownership.get_info(&run_id).await {
        Some(info) => Ok(Json(info)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn dashboard(
    State(admin): State<AdminState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    let m = &admin.state.metrics;
    let stuck = admin.recovery.get_stuck(5).await;
    let wal = admin.state.wal.stats().await;
    let dlq = admin.state.dlq.stats().await;
    let health = m.check_health(&admin.state.config.coordination);
    let backpressure = admin.state.backpressure.state();

    Ok(Json(serde_json::json!({
        "worker_id": admin.state.ownership.worker_id(),
        "active_runs": m.active_runs.get(),
        "owned_runs": admin.state.ownership.owned_count(),
        "pending_writes": wal.total_pending,
        "stuck_count": stuck.len(),
        "runs_started": m.runs_started.get(),
        "runs_completed": m.runs_completed.get(),
        "runs_failed": m.runs_failed.get(),
        "runs_recovered": m.runs_recovered.get(),
        "writes_flushed": m.writes_flushed.get(),
        "writes_dropped": m.writes_dropped.get(),
        "dlq": dlq,
        "backpressure": backpressure,
        "healthy": health.healthy,
        "alerts": health.alerts,
    })))
}

async fn trigger_sweep(
    State(admin): State<AdminState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    let report = admin.recovery.sweep().await;
    tracing::info!(?report, "operator triggered sweep");
    Ok(Json(report))
}

async fn trigger_flush(
    State(admin): State<AdminState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    let results = admin.state.write_buffer.flush_all().await;
    let total: usize = results.values().map(|r| r.success_count).sum();
    tracing::info!(runs = results.len(), total, "operator triggered flush");
    Ok(Json(serde_json::json!({
        "runs": results.len(),
        "total": total,
        "details": results,
    })))
}

// ── DLQ endpoints ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DlqQuery {
    #[serde(default = "default_dlq_count")]
    count: usize,
    run_id: Option<String>,
}

fn default_dlq_count() -> usize {
    100
}

async fn dlq_entries(
    State(admin): State<AdminState>,
    headers: HeaderMap,
    Query(query): Query<DlqQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    let entries = admin
        .state
        .dlq
        .get_entries(query.count.min(1000), query.run_id.as_deref())
        .await;
    Ok(Json(entries))
}

async fn dlq_retry(
    State(admin): State<AdminState>,
    headers: HeaderMap,
    Path(entry_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    match admin.state.dlq.retry_entry(&entry_id, &admin.state.wal).await {
        Ok(true) => {
            // Kick a flush so the re-queued entry lands promptly.
            let _ = admin.state.write_buffer.flush_all().await;
            Ok(Json(serde_json::json!({"entry_id": entry_id, "retried": true})))
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::warn!(entry_id = %entry_id, error = %e, "DLQ retry failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Deserialize)]
struct PurgeQuery {
    /// Only purge entries older than this many seconds.
    older_than_seconds: Option<u64>,
}

async fn dlq_purge(
    State(admin): State<AdminState>,
    headers: HeaderMap,
    Query(query): Query<PurgeQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    admin.authorize(&headers)?;
    let older_than = query
        .older_than_seconds
        .map(std::time::Duration::from_secs);
    match admin.state.dlq.purge(older_than).await {
        Ok(deleted) => Ok(Json(serde_json::json!({"deleted": deleted}))),
        Err(e) => {
            tracing::warn!(error = %e, "DLQ purge failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
