//! The provisioning sequence for one request, and resource teardown.
//!
//! Every run starts with a conditional claim (`approved -> provisioning`), so a
//! request that is already being provisioned is skipped rather than run twice.
//! Failures at any step end the run with the request in `failed`, the failing
//! step in `failure_stage`, and any reserved address released.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use vm_gitstore::{CommitRecord, GitConfigStore};
use vm_iac::module_source::source_host;
use vm_iac::{
    GeneratorInput, IacExecutor, ModuleAuth, ModuleRef, NetworkAssignment, RegistryMirror,
    RenderedConfig, Stage, StageOutcome, ToolSecrets, VmSpec, WorkDir,
};

use crate::catalog::{self, GitRepository, RequestAggregate};
use crate::error::{OrchestratorError, Result};
use crate::ipam::{IpAllocation, IpamService};
use crate::node_config::{self, NodeConfigStatus};
use crate::notify::{self, NotificationEvent, NotificationSink};
use crate::request::{FailureStage, RequestStatus, ResourceRequest};
use crate::resource::{Resource, ResourceRow, ResourceStatus};

const INTERRUPTED_MESSAGE: &str = "interrupted: the service stopped before provisioning finished";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Parent directory for per-run working directories.
    pub work_root: PathBuf,
    pub registry: Option<RegistryMirror>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("provisiond"),
            registry: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Completed { resource_id: String },
    Failed { stage: FailureStage, message: String },
    /// The request was not in `approved` when the run tried to claim it.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    Failed { message: String },
    Skipped,
}

struct StageFailure {
    stage: FailureStage,
    message: String,
}

impl StageFailure {
    fn new(stage: FailureStage, message: impl fmt::Display) -> Self {
        Self {
            stage,
            message: message.to_string(),
        }
    }
}

/// Everything a successful run hands to the completion step.
struct Applied {
    name: String,
    outputs: BTreeMap<String, String>,
    state: Option<String>,
    allocation: Option<IpAllocation>,
    commit: Option<CommitRecord>,
}

pub struct Pipeline {
    pool: SqlitePool,
    ipam: IpamService,
    executor: Arc<dyn IacExecutor>,
    notifier: Arc<dyn NotificationSink>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        executor: Arc<dyn IacExecutor>,
        notifier: Arc<dyn NotificationSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ipam: IpamService::new(pool.clone()),
            pool,
            executor,
            notifier,
            settings,
        }
    }

    /// Share an IPAM service (and its per-pool locks) with other callers.
    pub fn with_ipam(mut self, ipam: IpamService) -> Self {
        self.ipam = ipam;
        self
    }

    pub fn ipam(&self) -> &IpamService {
        &self.ipam
    }

    /// Run the full provisioning sequence for an approved request.
    #[instrument(skip_all, fields(request_id = %request_id))]
    pub async fn provision(&self, request_id: &str) -> Result<ProvisionOutcome> {
        if !self.claim(request_id).await? {
            // Unknown ids are an error; anything else is another run's business.
            catalog::load_request(&self.pool, request_id).await?;
            debug!("Request is not approved, skipping run");
            return Ok(ProvisionOutcome::Skipped);
        }

        let aggregate = match catalog::load_aggregate(&self.pool, request_id).await {
            Ok(aggregate) => aggregate,
            Err(e) => {
                error!("Failed to load request configuration: {}", e);
                let request = catalog::load_request(&self.pool, request_id).await?;
                let failure = StageFailure::new(FailureStage::Validate, e);
                return self.fail(&request, failure, String::new()).await;
            }
        };

        info!("Provisioning started");
        notify::send(
            &*self.notifier,
            NotificationEvent::ProvisioningStarted,
            &aggregate.request.requester,
            json!({ "request_id": request_id }),
        )
        .await;

        let mut log = String::new();
        match self.attempt(&aggregate, &mut log).await {
            Ok(applied) => self.complete(&aggregate, applied, log).await,
            Err(failure) => self.fail(&aggregate.request, failure, log).await,
        }
    }

    async fn claim(&self, request_id: &str) -> Result<bool> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            "UPDATE resource_requests SET status = ?, started_at = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(RequestStatus::Provisioning)
        .bind(now)
        .bind(now)
        .bind(request_id)
        .bind(RequestStatus::Approved)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn attempt(
        &self,
        aggregate: &RequestAggregate,
        log: &mut String,
    ) -> std::result::Result<Applied, StageFailure> {
        let request = &aggregate.request;

        let spec = VmSpec::from_value(&request.spec)
            .map_err(|e| StageFailure::new(FailureStage::Validate, e))?;

        let (network, allocation) = self
            .assign_address(aggregate, &spec)
            .await
            .map_err(|e| StageFailure::new(FailureStage::Allocate, e))?;

        let config = self
            .render_config(aggregate, &spec, network.as_ref())
            .map_err(|e| StageFailure::new(FailureStage::Generate, e))?;
        node_config::record_generated(
            &self.pool,
            &request.id,
            &config.descriptor_file,
            &config.descriptor,
            &config.variables,
        )
        .await
        .map_err(|e| StageFailure::new(FailureStage::Generate, e))?;

        let commit = match &aggregate.git_repository {
            Some(repository) => {
                let record = self
                    .commit_config(repository, &request.id, &request.environment, &config)
                    .await
                    .map_err(|e| StageFailure::new(FailureStage::Commit, e))?;
                node_config::record_commit(&self.pool, &request.id, &record.path, &record.commit_id)
                    .await
                    .map_err(|e| StageFailure::new(FailureStage::Commit, e))?;
                Some(record)
            }
            None => {
                debug!("No default config repository registered, skipping commit");
                None
            }
        };

        // Removed on every exit path when `scratch` drops.
        let scratch = self
            .scratch_dir(&request.id)
            .map_err(|e| StageFailure::new(FailureStage::Init, e))?;
        let workdir = WorkDir::prepare(
            scratch.path(),
            &config,
            &tool_secrets(aggregate),
            module_auth(aggregate).as_ref(),
        )
        .map_err(|e| StageFailure::new(FailureStage::Init, e))?;

        // A retry after a partial apply picks up where that apply stopped.
        let previous_state = node_config::for_request(&self.pool, &request.id)
            .await
            .map_err(|e| StageFailure::new(FailureStage::Init, e))?
            .and_then(|node| node.state_snapshot);
        if let Some(state) = previous_state.as_deref() {
            workdir
                .restore_state(state)
                .map_err(|e| StageFailure::new(FailureStage::Init, e))?;
            debug!("Restored state saved by an earlier attempt");
        }

        for (stage, status) in [
            (Stage::Init, NodeConfigStatus::Initializing),
            (Stage::Plan, NodeConfigStatus::Planning),
        ] {
            let outcome = self
                .run_tracked_stage(&request.id, &workdir, stage, status, log)
                .await?;
            if !outcome.success {
                return Err(StageFailure::new(stage.into(), outcome.diagnostic()));
            }
        }

        let outcome = self
            .run_tracked_stage(
                &request.id,
                &workdir,
                Stage::Apply,
                NodeConfigStatus::Applying,
                log,
            )
            .await?;

        // Keep whatever state a partial apply left behind.
        let state = workdir
            .read_state()
            .map_err(|e| StageFailure::new(FailureStage::Record, e))?;
        if let Some(state) = state.as_deref() {
            node_config::record_state(
                &self.pool,
                &request.id,
                NodeConfigStatus::Applying,
                Some(state),
            )
            .await
            .map_err(|e| StageFailure::new(FailureStage::Record, e))?;
        }
        if !outcome.success {
            return Err(StageFailure::new(FailureStage::Apply, outcome.diagnostic()));
        }

        Ok(Applied {
            name: spec.name.clone(),
            outputs: outcome.outputs,
            state,
            allocation,
            commit,
        })
    }

    async fn run_tracked_stage(
        &self,
        request_id: &str,
        workdir: &WorkDir,
        stage: Stage,
        status: NodeConfigStatus,
        log: &mut String,
    ) -> std::result::Result<StageOutcome, StageFailure> {
        let failed_at = FailureStage::from(stage);
        node_config::set_status(&self.pool, request_id, status)
            .await
            .map_err(|e| StageFailure::new(failed_at, e))?;

        let outcome = self
            .run_stage(workdir, stage)
            .await
            .map_err(|e| StageFailure::new(failed_at, e))?;
        append_log(log, &outcome);
        Ok(outcome)
    }

    async fn assign_address(
        &self,
        aggregate: &RequestAggregate,
        spec: &VmSpec,
    ) -> Result<(Option<NetworkAssignment>, Option<IpAllocation>)> {
        let request_id = aggregate.request.id.as_str();
        let pool = match &aggregate.zone {
            Some(zone) => self.ipam.pool_for_zone(&zone.id).await?,
            None => None,
        };
        // Left over from an earlier attempt whose apply may have used it.
        let held = self.ipam.allocations_for(request_id).await?;

        match (spec.pinned_address(), pool) {
            (Some(address), Some(pool)) if pool.contains(address) => {
                let kept = held
                    .iter()
                    .find(|a| a.pool_id == pool.id && a.ip() == Some(address))
                    .cloned();
                let allocation = match kept {
                    Some(allocation) => {
                        debug!(address = %allocation.address, "Reusing address held from an earlier attempt");
                        allocation
                    }
                    None => {
                        self.release_all(&held).await?;
                        self.ipam
                            .allocate_specific(
                                &pool.id,
                                &address.to_string(),
                                Some(&spec.name),
                                Some(request_id),
                            )
                            .await?
                    }
                };
                let assignment = NetworkAssignment {
                    address,
                    prefix_len: pool.prefix_len(),
                    gateway: pool.gateway_addr(),
                };
                Ok((Some(assignment), Some(allocation)))
            }
            (Some(address), _) => {
                self.release_all(&held).await?;
                Ok((
                    Some(NetworkAssignment {
                        address,
                        prefix_len: None,
                        gateway: None,
                    }),
                    None,
                ))
            }
            (None, Some(pool)) => {
                let kept = held.iter().find(|a| a.pool_id == pool.id).cloned();
                let allocation = match kept {
                    Some(allocation) => {
                        debug!(address = %allocation.address, "Reusing address held from an earlier attempt");
                        allocation
                    }
                    None => {
                        self.release_all(&held).await?;
                        self.ipam
                            .allocate_next_available(&pool.id, Some(&spec.name), Some(request_id))
                            .await?
                    }
                };
                let address = allocation.ip().ok_or_else(|| {
                    OrchestratorError::InvalidState(format!(
                        "allocation {} holds unparsable address {}",
                        allocation.id, allocation.address
                    ))
                })?;
                let assignment = NetworkAssignment {
                    address,
                    prefix_len: pool.prefix_len(),
                    gateway: pool.gateway_addr(),
                };
                Ok((Some(assignment), Some(allocation)))
            }
            (None, None) => {
                self.release_all(&held).await?;
                Ok((None, None))
            }
        }
    }

    async fn release_all(&self, allocations: &[IpAllocation]) -> Result<()> {
        for allocation in allocations {
            self.ipam.release(&allocation.id).await?;
        }
        Ok(())
    }

    fn render_config(
        &self,
        aggregate: &RequestAggregate,
        spec: &VmSpec,
        network: Option<&NetworkAssignment>,
    ) -> vm_iac::Result<RenderedConfig> {
        let request = &aggregate.request;
        let provider = aggregate
            .provider
            .as_ref()
            .map(|p| p.kind.as_str())
            .unwrap_or(request.provider.as_str());
        let module = aggregate.module.as_ref().map(|m| ModuleRef {
            source: m.source.clone(),
            version: m.version.clone(),
        });

        vm_iac::render(&GeneratorInput {
            request_id: &request.id,
            provider,
            environment: &request.environment,
            spec,
            module: module.as_ref(),
            endpoint: aggregate
                .credential
                .as_ref()
                .and_then(|c| c.endpoint.as_deref()),
            network,
            registry: self.settings.registry.as_ref(),
        })
    }

    async fn commit_config(
        &self,
        repository: &GitRepository,
        request_id: &str,
        environment: &str,
        config: &RenderedConfig,
    ) -> Result<CommitRecord> {
        let store = GitConfigStore::new(repository.settings.clone());
        let request_id = request_id.to_string();
        let environment = environment.to_string();
        let files: Vec<(String, String)> = config
            .committed_files()
            .into_iter()
            .map(|(name, body)| (name.to_string(), body.to_string()))
            .collect();

        let record = tokio::task::spawn_blocking(move || {
            let files: Vec<(&str, &str)> = files
                .iter()
                .map(|(name, body)| (name.as_str(), body.as_str()))
                .collect();
            let message = format!("Pending config for request {request_id} ({environment})");
            store.commit_pending(&request_id, &environment, &files, &message)
        })
        .await
        .map_err(|e| anyhow::anyhow!("config commit task failed: {e}"))??;

        Ok(record)
    }

    fn scratch_dir(&self, label: &str) -> Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.settings.work_root)?;
        Ok(tempfile::Builder::new()
            .prefix(&format!("{label}-"))
            .tempdir_in(&self.settings.work_root)?)
    }

    async fn run_stage(&self, workdir: &WorkDir, stage: Stage) -> Result<StageOutcome> {
        let executor = Arc::clone(&self.executor);
        let workdir = workdir.clone();

        let outcome = tokio::task::spawn_blocking(move || executor.run_stage(&workdir, stage))
            .await
            .map_err(|e| anyhow::anyhow!("{stage} task failed: {e}"))??;

        Ok(outcome)
    }

    async fn complete(
        &self,
        aggregate: &RequestAggregate,
        applied: Applied,
        log: String,
    ) -> Result<ProvisionOutcome> {
        let request = &aggregate.request;
        let resource_id = Uuid::new_v4().to_string();

        match self
            .record_completion(aggregate, &resource_id, &applied, &log)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("Request left provisioning before completion was recorded");
                return Ok(ProvisionOutcome::Skipped);
            }
            Err(e) => {
                error!("Apply succeeded but recording the result failed: {}", e);
                return self
                    .fail(request, StageFailure::new(FailureStage::Record, e), log)
                    .await;
            }
        }

        if let Some(allocation) = &applied.allocation {
            if let Err(e) = self.ipam.confirm(&allocation.id, &resource_id).await {
                warn!(allocation_id = %allocation.id, "Failed to confirm IP allocation: {}", e);
            }
        }

        if let (Some(repository), Some(commit)) = (&aggregate.git_repository, &applied.commit) {
            let store = GitConfigStore::new(repository.settings.clone());
            let request_id = request.id.clone();
            let commit_id = commit.commit_id.clone();
            let tagged =
                tokio::task::spawn_blocking(move || store.mark_applied(&request_id, &commit_id))
                    .await;
            match tagged {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to mark config applied: {}", e),
                Err(e) => warn!("Config tag task failed: {}", e),
            }
        }

        info!(resource_id = %resource_id, "Provisioning completed");
        notify::send(
            &*self.notifier,
            NotificationEvent::ProvisioningCompleted,
            &request.requester,
            json!({
                "request_id": request.id,
                "resource_id": resource_id,
                "outputs": applied.outputs,
            }),
        )
        .await;

        Ok(ProvisionOutcome::Completed { resource_id })
    }

    /// Insert the resource and complete the request in one transaction.
    async fn record_completion(
        &self,
        aggregate: &RequestAggregate,
        resource_id: &str,
        applied: &Applied,
        log: &str,
    ) -> Result<bool> {
        let request = &aggregate.request;
        let now = Utc::now().timestamp();
        let external_id = applied
            .outputs
            .get("vm_id")
            .or_else(|| applied.outputs.get("id"))
            .cloned();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO resources (id, request_id, name, resource_type, provider, environment, status, outputs, owner, external_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(resource_id)
        .bind(&request.id)
        .bind(&applied.name)
        .bind(&request.resource_type)
        .bind(&request.provider)
        .bind(&request.environment)
        .bind(ResourceStatus::Running)
        .bind(serde_json::to_string(&applied.outputs)?)
        .bind(&request.requester)
        .bind(external_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE resource_requests
             SET status = ?, resource_id = ?, completed_at = ?, provisioning_log = ?,
                 error_message = NULL, failure_stage = NULL, updated_at = ?
             WHERE id = ? AND status = ? AND resource_id IS NULL",
        )
        .bind(RequestStatus::Completed)
        .bind(resource_id)
        .bind(now)
        .bind(log)
        .bind(now)
        .bind(&request.id)
        .bind(RequestStatus::Provisioning)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        node_config::record_applied(&mut *tx, &request.id, applied.state.as_deref()).await?;
        tx.commit().await?;

        Ok(true)
    }

    async fn fail(
        &self,
        request: &ResourceRequest,
        failure: StageFailure,
        log: String,
    ) -> Result<ProvisionOutcome> {
        let now = Utc::now().timestamp();
        warn!(stage = ?failure.stage, "Provisioning failed: {}", failure.message);

        let updated = sqlx::query(
            "UPDATE resource_requests
             SET status = ?, error_message = ?, failure_stage = ?, provisioning_log = ?,
                 completed_at = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(RequestStatus::Failed)
        .bind(&failure.message)
        .bind(failure.stage)
        .bind(&log)
        .bind(now)
        .bind(now)
        .bind(&request.id)
        .bind(RequestStatus::Provisioning)
        .execute(&self.pool)
        .await?;

        node_config::set_status(&self.pool, &request.id, NodeConfigStatus::Failed).await?;
        self.release_unless_applied(&request.id).await;

        if updated.rows_affected() > 0 {
            notify::send(
                &*self.notifier,
                NotificationEvent::ProvisioningFailed,
                &request.requester,
                json!({
                    "request_id": request.id,
                    "stage": failure.stage,
                    "error": failure.message,
                }),
            )
            .await;
        }

        Ok(ProvisionOutcome::Failed {
            stage: failure.stage,
            message: failure.message,
        })
    }

    /// Return a failed run's addresses to the pool, unless the saved state
    /// shows the tool created something that may be using them. Those stay
    /// reserved for the retry or the destroy.
    async fn release_unless_applied(&self, request_id: &str) {
        match node_config::for_request(&self.pool, request_id).await {
            Ok(Some(node)) if node.state_snapshot.as_deref().is_some_and(state_has_resources) => {
                info!("Saved state lists resources, keeping the reserved address");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read state snapshot, keeping the reserved address: {}", e);
                return;
            }
        }

        if let Err(e) = self.ipam.release_for_resource(request_id).await {
            warn!("Failed to release reserved IP address: {}", e);
        }
    }

    /// Tear down a resource already moved to `destroying`.
    #[instrument(skip_all, fields(resource_id = %resource_id))]
    pub async fn destroy(&self, resource_id: &str) -> Result<DestroyOutcome> {
        let resource: Resource =
            sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources WHERE id = ?")
                .bind(resource_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("resource {resource_id}")))?
                .into();

        if resource.status != ResourceStatus::Destroying {
            debug!(status = ?resource.status, "Resource is not marked for destroy, skipping");
            return Ok(DestroyOutcome::Skipped);
        }

        let aggregate = catalog::load_aggregate(&self.pool, &resource.request_id).await?;
        info!("Destroy started");

        let now = Utc::now().timestamp();
        match self.teardown(&aggregate, &resource).await {
            Ok(log) => {
                debug!(log_len = log.len(), "Destroy finished");
                sqlx::query(
                    "UPDATE resources SET status = ?, error_message = NULL, updated_at = ?
                     WHERE id = ? AND status = ?",
                )
                .bind(ResourceStatus::Destroyed)
                .bind(now)
                .bind(resource_id)
                .bind(ResourceStatus::Destroying)
                .execute(&self.pool)
                .await?;
                node_config::set_status(
                    &self.pool,
                    &resource.request_id,
                    NodeConfigStatus::Destroyed,
                )
                .await?;
                if let Err(e) = self.ipam.release_for_resource(resource_id).await {
                    warn!("Failed to release IP addresses: {}", e);
                }

                info!("Resource destroyed");
                notify::send(
                    &*self.notifier,
                    NotificationEvent::ResourceDestroyed,
                    &resource.owner,
                    json!({ "resource_id": resource_id, "request_id": resource.request_id }),
                )
                .await;
                Ok(DestroyOutcome::Destroyed)
            }
            Err(message) => {
                warn!("Destroy failed: {}", message);
                sqlx::query(
                    "UPDATE resources SET status = ?, error_message = ?, updated_at = ?
                     WHERE id = ? AND status = ?",
                )
                .bind(ResourceStatus::Error)
                .bind(&message)
                .bind(now)
                .bind(resource_id)
                .bind(ResourceStatus::Destroying)
                .execute(&self.pool)
                .await?;

                notify::send(
                    &*self.notifier,
                    NotificationEvent::ResourceDestroyFailed,
                    &resource.owner,
                    json!({ "resource_id": resource_id, "error": message }),
                )
                .await;
                Ok(DestroyOutcome::Failed { message })
            }
        }
    }

    async fn teardown(
        &self,
        aggregate: &RequestAggregate,
        resource: &Resource,
    ) -> std::result::Result<String, String> {
        let stored = node_config::for_request(&self.pool, &resource.request_id)
            .await
            .map_err(|e| e.to_string())?;

        let stored_config = stored.as_ref().and_then(|node| {
            match (&node.descriptor_file, &node.rendered_config, &node.variables) {
                (Some(file), Some(descriptor), Some(variables)) => Some(RenderedConfig::from_stored(
                    file,
                    descriptor.clone(),
                    variables.clone(),
                    self.settings.registry.as_ref(),
                )),
                _ => None,
            }
        });
        let config = match stored_config {
            Some(config) => config.map_err(|e| e.to_string())?,
            None => {
                let spec = VmSpec::from_value(&aggregate.request.spec).map_err(|e| e.to_string())?;
                self.render_config(aggregate, &spec, None)
                    .map_err(|e| e.to_string())?
            }
        };

        let scratch = self
            .scratch_dir(&resource.id)
            .map_err(|e| e.to_string())?;
        let workdir = WorkDir::prepare(
            scratch.path(),
            &config,
            &tool_secrets(aggregate),
            module_auth(aggregate).as_ref(),
        )
        .map_err(|e| e.to_string())?;
        if let Some(state) = stored.as_ref().and_then(|node| node.state_snapshot.as_deref()) {
            workdir.restore_state(state).map_err(|e| e.to_string())?;
        }

        let mut log = String::new();
        for stage in [Stage::Init, Stage::Destroy] {
            let outcome = self
                .run_stage(&workdir, stage)
                .await
                .map_err(|e| e.to_string())?;
            append_log(&mut log, &outcome);
            if !outcome.success {
                return Err(format!("{stage} failed: {}", outcome.diagnostic()));
            }
        }
        Ok(log)
    }

    /// Fail requests (and resources) a previous process left mid-flight.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stuck: Vec<(String, Option<NodeConfigStatus>)> = sqlx::query_as(
            "SELECT r.id, n.status FROM resource_requests r
             LEFT JOIN node_configs n ON n.request_id = r.id
             WHERE r.status = ?",
        )
        .bind(RequestStatus::Provisioning)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0;
        for (request_id, node_status) in stuck {
            let stage = match node_status {
                Some(NodeConfigStatus::Initializing) => Some(FailureStage::Init),
                Some(NodeConfigStatus::Planning) => Some(FailureStage::Plan),
                Some(NodeConfigStatus::Applying) => Some(FailureStage::Apply),
                _ => None,
            };
            let now = Utc::now().timestamp();

            let updated = sqlx::query(
                "UPDATE resource_requests
                 SET status = ?, error_message = ?, failure_stage = ?, completed_at = ?, updated_at = ?
                 WHERE id = ? AND status = ?",
            )
            .bind(RequestStatus::Failed)
            .bind(INTERRUPTED_MESSAGE)
            .bind(stage)
            .bind(now)
            .bind(now)
            .bind(&request_id)
            .bind(RequestStatus::Provisioning)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                continue;
            }
            node_config::set_status(&self.pool, &request_id, NodeConfigStatus::Failed).await?;
            self.release_unless_applied(&request_id).await;
            warn!(request_id = %request_id, stage = ?stage, "Marked interrupted request as failed");
            recovered += 1;
        }

        let destroying = sqlx::query(
            "UPDATE resources SET status = ?, error_message = ?, updated_at = ? WHERE status = ?",
        )
        .bind(ResourceStatus::Error)
        .bind("interrupted: the service stopped before destroy finished")
        .bind(Utc::now().timestamp())
        .bind(ResourceStatus::Destroying)
        .execute(&self.pool)
        .await?;
        if destroying.rows_affected() > 0 {
            warn!(count = destroying.rows_affected(), "Marked interrupted destroys as errored");
        }

        Ok(recovered)
    }
}

/// Whether a local state document records any managed resource. Unreadable
/// state counts as non-empty.
fn state_has_resources(state: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(state) {
        Ok(doc) => doc
            .get("resources")
            .and_then(|r| r.as_array())
            .is_some_and(|r| !r.is_empty()),
        Err(_) => true,
    }
}

fn tool_secrets(aggregate: &RequestAggregate) -> ToolSecrets {
    match &aggregate.credential {
        Some(credential) => ToolSecrets {
            username: credential.username.clone(),
            password: credential.secret.clone(),
            token: credential.token.clone(),
        },
        None => ToolSecrets::default(),
    }
}

fn module_auth(aggregate: &RequestAggregate) -> Option<ModuleAuth> {
    let module = aggregate.module.as_ref()?;
    let token = module.fetch_token.clone().filter(|t| !t.is_empty())?;
    Some(ModuleAuth {
        host: source_host(&module.source)?,
        username: module
            .fetch_username
            .clone()
            .unwrap_or_else(|| "git".to_string()),
        token,
    })
}

fn append_log(log: &mut String, outcome: &StageOutcome) {
    let _ = writeln!(
        log,
        "== {} ({}, {:.1}s) ==",
        outcome.stage,
        if outcome.success { "ok" } else { "failed" },
        outcome.duration.as_secs_f64()
    );
    for text in [&outcome.stdout, &outcome.stderr] {
        let text = text.trim_end();
        if !text.is_empty() {
            log.push_str(text);
            log.push('\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_has_resources() {
        assert!(!state_has_resources(r#"{"version": 4}"#));
        assert!(!state_has_resources(r#"{"version": 4, "resources": []}"#));
        assert!(state_has_resources(
            r#"{"version": 4, "resources": [{"type": "proxmox_vm_qemu", "name": "vm"}]}"#
        ));
        assert!(state_has_resources("not json"));
    }
}
