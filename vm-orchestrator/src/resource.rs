use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::to_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Running,
    Destroying,
    Destroyed,
    Error,
}

/// A provisioned artifact. Exists only for requests that completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub request_id: String,
    pub name: String,
    pub resource_type: String,
    pub provider: String,
    pub environment: String,
    pub status: ResourceStatus,
    pub outputs: serde_json::Value,
    pub owner: String,
    pub external_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct ResourceRow {
    id: String,
    request_id: String,
    name: String,
    resource_type: String,
    provider: String,
    environment: String,
    status: ResourceStatus,
    outputs: String,
    owner: String,
    external_id: Option<String>,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<ResourceRow> for Resource {
    fn from(row: ResourceRow) -> Self {
        Self {
            id: row.id,
            request_id: row.request_id,
            name: row.name,
            resource_type: row.resource_type,
            provider: row.provider,
            environment: row.environment,
            status: row.status,
            outputs: serde_json::from_str(&row.outputs)
                .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
            owner: row.owner,
            external_id: row.external_id,
            error_message: row.error_message,
            created_at: to_datetime(row.created_at),
            updated_at: to_datetime(row.updated_at),
        }
    }
}
