use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::node_config::{self, NodeConfig};
use crate::notify::{self, NotificationEvent, NotificationSink};
use crate::request::{CreateRequest, RequestFilters, RequestRow, RequestStatus, ResourceRequest};
use crate::resource::{Resource, ResourceRow, ResourceStatus};
use crate::worker::{Job, JobQueue};

/// User and approver actions on requests and resources.
///
/// Every status change is a conditional update on the expected current
/// status; when no row matches, the caller gets `NotFound` or `InvalidState`
/// and nothing is written.
#[derive(Clone)]
pub struct RequestService {
    pool: SqlitePool,
    queue: JobQueue,
    notifier: Arc<dyn NotificationSink>,
}

impl RequestService {
    pub fn new(pool: SqlitePool, queue: JobQueue, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            pool,
            queue,
            notifier,
        }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new request in `pending`
    pub async fn create_request(&self, req: CreateRequest) -> Result<ResourceRequest> {
        for (field, value) in [
            ("requester", &req.requester),
            ("provider", &req.provider),
            ("resource_type", &req.resource_type),
            ("environment", &req.environment),
        ] {
            if value.trim().is_empty() {
                return Err(OrchestratorError::InvalidInput(format!(
                    "{field} must not be empty"
                )));
            }
        }
        let quantity = req.quantity.unwrap_or(1);
        if quantity < 1 {
            return Err(OrchestratorError::InvalidInput(
                "quantity must be at least 1".to_string(),
            ));
        }
        if !req.spec.is_object() {
            return Err(OrchestratorError::InvalidInput(
                "spec must be a JSON object".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO resource_requests (id, requester, provider, resource_type, environment, spec, quantity, status,
                provider_id, module_id, credential_id, zone_id, region_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(req.requester.trim())
        .bind(req.provider.trim())
        .bind(req.resource_type.trim())
        .bind(req.environment.trim())
        .bind(serde_json::to_string(&req.spec)?)
        .bind(quantity)
        .bind(RequestStatus::Pending)
        .bind(&req.provider_id)
        .bind(&req.module_id)
        .bind(&req.credential_id)
        .bind(&req.zone_id)
        .bind(&req.region_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(request_id = %id, requester = %req.requester, "Request created");
        self.get_request(&id).await
    }

    pub async fn get_request(&self, id: &str) -> Result<ResourceRequest> {
        let row = sqlx::query_as::<_, RequestRow>("SELECT * FROM resource_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("request {id}")))?;

        Ok(row.into())
    }

    /// List requests with optional filters, newest first
    pub async fn list_requests(&self, filters: RequestFilters) -> Result<Vec<ResourceRequest>> {
        let mut query = "SELECT * FROM resource_requests WHERE 1=1".to_string();

        if filters.requester.is_some() {
            query.push_str(" AND requester = ?");
        }
        if filters.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY created_at DESC, rowid DESC");

        let mut q = sqlx::query_as::<_, RequestRow>(&query);

        if let Some(requester) = &filters.requester {
            q = q.bind(requester);
        }
        if let Some(status) = filters.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Approve a pending request and queue it for provisioning.
    ///
    /// Returns as soon as the job is queued; provisioning runs on the worker.
    pub async fn approve(
        &self,
        id: &str,
        approver: &str,
        reason: Option<&str>,
    ) -> Result<ResourceRequest> {
        if approver.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "approver must not be empty".to_string(),
            ));
        }
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE resource_requests
            SET status = ?, approver = ?, reason = ?, approved_at = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(RequestStatus::Approved)
        .bind(approver)
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::Pending)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.status_conflict(id, "approve", RequestStatus::Pending).await);
        }
        node_config::reset_pending(&mut *tx, id).await?;
        tx.commit().await?;

        let request = self.get_request(id).await?;
        info!(request_id = %id, approver, "Request approved");

        notify::send(
            &*self.notifier,
            NotificationEvent::RequestApproved,
            &request.requester,
            json!({ "request_id": id, "approver": approver, "reason": reason }),
        )
        .await;
        self.queue.enqueue(Job::Provision {
            request_id: id.to_string(),
        });

        Ok(request)
    }

    /// Reject a pending request. A reason is required.
    pub async fn reject(&self, id: &str, approver: &str, reason: &str) -> Result<ResourceRequest> {
        if reason.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "a rejection reason is required".to_string(),
            ));
        }
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE resource_requests
            SET status = ?, approver = ?, reason = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(RequestStatus::Rejected)
        .bind(approver)
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::Pending)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.status_conflict(id, "reject", RequestStatus::Pending).await);
        }

        let request = self.get_request(id).await?;
        info!(request_id = %id, approver, "Request rejected");

        notify::send(
            &*self.notifier,
            NotificationEvent::RequestRejected,
            &request.requester,
            json!({ "request_id": id, "approver": approver, "reason": reason }),
        )
        .await;

        Ok(request)
    }

    /// Move a failed request back to `approved` and queue it again.
    pub async fn retry(&self, id: &str) -> Result<ResourceRequest> {
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE resource_requests
            SET status = ?, approved_at = ?, started_at = NULL, completed_at = NULL,
                error_message = NULL, failure_stage = NULL, provisioning_log = NULL, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(RequestStatus::Approved)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::Failed)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.status_conflict(id, "retry", RequestStatus::Failed).await);
        }
        node_config::reset_pending(&mut *tx, id).await?;
        tx.commit().await?;

        info!(request_id = %id, "Request queued for retry");
        self.queue.enqueue(Job::Provision {
            request_id: id.to_string(),
        });

        self.get_request(id).await
    }

    /// Delete a request that never produced a resource.
    pub async fn delete_request(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM resource_requests WHERE id = ? AND status IN (?, ?, ?) AND resource_id IS NULL",
        )
        .bind(id)
        .bind(RequestStatus::Pending)
        .bind(RequestStatus::Rejected)
        .bind(RequestStatus::Failed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match self.current_status(id).await {
                Ok(Some(status)) => OrchestratorError::InvalidState(format!(
                    "request {id} is {status} and cannot be deleted"
                )),
                Ok(None) => OrchestratorError::NotFound(format!("request {id}")),
                Err(e) => e,
            });
        }

        info!(request_id = %id, "Request deleted");
        Ok(())
    }

    pub async fn get_resource(&self, id: &str) -> Result<Resource> {
        let row = sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("resource {id}")))?;

        Ok(row.into())
    }

    pub async fn list_resources(&self, owner: Option<&str>) -> Result<Vec<Resource>> {
        let rows = match owner {
            Some(owner) => {
                sqlx::query_as::<_, ResourceRow>(
                    "SELECT * FROM resources WHERE owner = ? ORDER BY created_at DESC, rowid DESC",
                )
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ResourceRow>(
                    "SELECT * FROM resources ORDER BY created_at DESC, rowid DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get_node_config(&self, request_id: &str) -> Result<NodeConfig> {
        node_config::for_request(&self.pool, request_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("node config for request {request_id}")))
    }

    /// Mark a resource for teardown and queue the destroy job.
    ///
    /// A resource in `error` (a failed earlier destroy) may be destroyed again.
    pub async fn destroy_resource(&self, id: &str) -> Result<Resource> {
        let result = sqlx::query(
            r#"
            UPDATE resources SET status = ?, error_message = NULL, updated_at = ?
            WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(ResourceStatus::Destroying)
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(ResourceStatus::Running)
        .bind(ResourceStatus::Error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let resource = self.get_resource(id).await?;
            return Err(OrchestratorError::InvalidState(format!(
                "resource {id} is {:?} and cannot be destroyed",
                resource.status
            )));
        }

        info!(resource_id = %id, "Resource queued for destroy");
        self.queue.enqueue(Job::Destroy {
            resource_id: id.to_string(),
        });

        self.get_resource(id).await
    }

    async fn current_status(&self, id: &str) -> Result<Option<RequestStatus>> {
        let status: Option<(RequestStatus,)> =
            sqlx::query_as("SELECT status FROM resource_requests WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(status.map(|(status,)| status))
    }

    /// Explain why a conditional update on `expected` matched no row.
    async fn status_conflict(
        &self,
        id: &str,
        action: &str,
        expected: RequestStatus,
    ) -> OrchestratorError {
        match self.current_status(id).await {
            Ok(Some(status)) => OrchestratorError::InvalidState(format!(
                "cannot {action} request {id}: status is {status}, expected {expected}"
            )),
            Ok(None) => OrchestratorError::NotFound(format!("request {id}")),
            Err(e) => e,
        }
    }
}
