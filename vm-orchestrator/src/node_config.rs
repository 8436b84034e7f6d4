//! Generated configuration artifact, one per request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteExecutor;
use uuid::Uuid;

use crate::db::to_datetime;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NodeConfigStatus {
    Pending,
    Generated,
    Committed,
    Initializing,
    Planning,
    Applying,
    Applied,
    Failed,
    Destroyed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub request_id: String,
    pub store_path: Option<String>,
    pub descriptor_file: Option<String>,
    pub rendered_config: Option<String>,
    pub variables: Option<String>,
    pub status: NodeConfigStatus,
    pub pending_commit: Option<String>,
    pub applied_commit: Option<String>,
    #[serde(skip)]
    pub state_snapshot: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct NodeConfigRow {
    id: String,
    request_id: String,
    store_path: Option<String>,
    descriptor_file: Option<String>,
    rendered_config: Option<String>,
    variables: Option<String>,
    status: NodeConfigStatus,
    pending_commit: Option<String>,
    applied_commit: Option<String>,
    state_snapshot: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<NodeConfigRow> for NodeConfig {
    fn from(row: NodeConfigRow) -> Self {
        Self {
            id: row.id,
            request_id: row.request_id,
            store_path: row.store_path,
            descriptor_file: row.descriptor_file,
            rendered_config: row.rendered_config,
            variables: row.variables,
            status: row.status,
            pending_commit: row.pending_commit,
            applied_commit: row.applied_commit,
            state_snapshot: row.state_snapshot,
            created_at: to_datetime(row.created_at),
            updated_at: to_datetime(row.updated_at),
        }
    }
}

pub async fn for_request<'e, E: SqliteExecutor<'e>>(
    executor: E,
    request_id: &str,
) -> Result<Option<NodeConfig>> {
    let row = sqlx::query_as::<_, NodeConfigRow>("SELECT * FROM node_configs WHERE request_id = ?")
        .bind(request_id)
        .fetch_optional(executor)
        .await?;

    Ok(row.map(Into::into))
}

/// Create the row for a request, or reset it to pending for a retry.
pub(crate) async fn reset_pending<'e, E: SqliteExecutor<'e>>(
    executor: E,
    request_id: &str,
) -> Result<()> {
    let now = Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO node_configs (id, request_id, status, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(request_id) DO UPDATE SET
             status = excluded.status,
             applied_commit = NULL,
             updated_at = excluded.updated_at",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(request_id)
    .bind(NodeConfigStatus::Pending)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(())
}

pub(crate) async fn set_status<'e, E: SqliteExecutor<'e>>(
    executor: E,
    request_id: &str,
    status: NodeConfigStatus,
) -> Result<()> {
    sqlx::query("UPDATE node_configs SET status = ?, updated_at = ? WHERE request_id = ?")
        .bind(status)
        .bind(Utc::now().timestamp())
        .bind(request_id)
        .execute(executor)
        .await?;

    Ok(())
}

pub(crate) async fn record_generated<'e, E: SqliteExecutor<'e>>(
    executor: E,
    request_id: &str,
    descriptor_file: &str,
    rendered_config: &str,
    variables: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE node_configs
         SET status = ?, descriptor_file = ?, rendered_config = ?, variables = ?,
             pending_commit = NULL, store_path = NULL, updated_at = ?
         WHERE request_id = ?",
    )
    .bind(NodeConfigStatus::Generated)
    .bind(descriptor_file)
    .bind(rendered_config)
    .bind(variables)
    .bind(Utc::now().timestamp())
    .bind(request_id)
    .execute(executor)
    .await?;

    Ok(())
}

pub(crate) async fn record_commit<'e, E: SqliteExecutor<'e>>(
    executor: E,
    request_id: &str,
    store_path: &str,
    commit_id: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE node_configs
         SET status = ?, store_path = ?, pending_commit = ?, updated_at = ?
         WHERE request_id = ?",
    )
    .bind(NodeConfigStatus::Committed)
    .bind(store_path)
    .bind(commit_id)
    .bind(Utc::now().timestamp())
    .bind(request_id)
    .execute(executor)
    .await?;

    Ok(())
}

/// Mark applied; the applied commit is whatever was committed as pending.
pub(crate) async fn record_applied<'e, E: SqliteExecutor<'e>>(
    executor: E,
    request_id: &str,
    state_snapshot: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE node_configs
         SET status = ?, applied_commit = pending_commit,
             state_snapshot = COALESCE(?, state_snapshot), updated_at = ?
         WHERE request_id = ?",
    )
    .bind(NodeConfigStatus::Applied)
    .bind(state_snapshot)
    .bind(Utc::now().timestamp())
    .bind(request_id)
    .execute(executor)
    .await?;

    Ok(())
}

pub(crate) async fn record_state<'e, E: SqliteExecutor<'e>>(
    executor: E,
    request_id: &str,
    status: NodeConfigStatus,
    state_snapshot: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE node_configs
         SET status = ?, state_snapshot = COALESCE(?, state_snapshot), updated_at = ?
         WHERE request_id = ?",
    )
    .bind(status)
    .bind(state_snapshot)
    .bind(Utc::now().timestamp())
    .bind(request_id)
    .execute(executor)
    .await?;

    Ok(())
}
