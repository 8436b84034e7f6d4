use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vm_iac::Stage;

use crate::db::{to_datetime, to_optional_datetime};
use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Provisioning,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Provisioning => "provisioning",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    /// The only edges a request may take.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Provisioning)
                | (Provisioning, Completed)
                | (Provisioning, Failed)
                | (Failed, Approved)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::Completed)
    }

    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            RequestStatus::Pending | RequestStatus::Rejected | RequestStatus::Failed
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            "provisioning" => Ok(RequestStatus::Provisioning),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(OrchestratorError::InvalidInput(format!(
                "unknown request status '{other}'"
            ))),
        }
    }
}

/// Step of the provisioning sequence that stopped a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Validate,
    Allocate,
    Generate,
    Commit,
    Init,
    Plan,
    Apply,
    /// The external apply finished but local bookkeeping did not.
    Record,
}

impl From<Stage> for FailureStage {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Init => FailureStage::Init,
            Stage::Plan => FailureStage::Plan,
            Stage::Apply | Stage::Destroy => FailureStage::Apply,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub id: String,
    pub requester: String,
    pub provider: String,
    pub resource_type: String,
    pub environment: String,
    pub spec: serde_json::Value,
    pub quantity: i64,
    pub status: RequestStatus,
    pub approver: Option<String>,
    pub reason: Option<String>,
    pub provider_id: Option<String>,
    pub module_id: Option<String>,
    pub credential_id: Option<String>,
    pub zone_id: Option<String>,
    pub region_id: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failure_stage: Option<FailureStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_log: Option<String>,
    pub resource_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    pub requester: String,
    pub provider: String,
    pub resource_type: String,
    pub environment: String,
    pub spec: serde_json::Value,
    pub quantity: Option<i64>,
    pub provider_id: Option<String>,
    pub module_id: Option<String>,
    pub credential_id: Option<String>,
    pub zone_id: Option<String>,
    pub region_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestFilters {
    pub requester: Option<String>,
    pub status: Option<RequestStatus>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct RequestRow {
    id: String,
    requester: String,
    provider: String,
    resource_type: String,
    environment: String,
    spec: String,
    quantity: i64,
    status: RequestStatus,
    approver: Option<String>,
    reason: Option<String>,
    provider_id: Option<String>,
    module_id: Option<String>,
    credential_id: Option<String>,
    zone_id: Option<String>,
    region_id: Option<String>,
    approved_at: Option<i64>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    error_message: Option<String>,
    failure_stage: Option<FailureStage>,
    provisioning_log: Option<String>,
    resource_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<RequestRow> for ResourceRequest {
    fn from(row: RequestRow) -> Self {
        Self {
            id: row.id,
            requester: row.requester,
            provider: row.provider,
            resource_type: row.resource_type,
            environment: row.environment,
            // A spec that no longer parses fails validation in the pipeline.
            spec: serde_json::from_str(&row.spec).unwrap_or(serde_json::Value::Null),
            quantity: row.quantity,
            status: row.status,
            approver: row.approver,
            reason: row.reason,
            provider_id: row.provider_id,
            module_id: row.module_id,
            credential_id: row.credential_id,
            zone_id: row.zone_id,
            region_id: row.region_id,
            approved_at: to_optional_datetime(row.approved_at),
            started_at: to_optional_datetime(row.started_at),
            completed_at: to_optional_datetime(row.completed_at),
            error_message: row.error_message,
            failure_stage: row.failure_stage,
            provisioning_log: row.provisioning_log,
            resource_id: row.resource_id,
            created_at: to_datetime(row.created_at),
            updated_at: to_datetime(row.updated_at),
        }
    }
}
