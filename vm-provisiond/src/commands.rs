//! Operator commands against the shared database.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use vm_iac::IacExecutor;
use vm_orchestrator::{
    CreatePool, CreateRequest, DestroyOutcome, IpamService, JobQueue, NotificationSink, Pipeline,
    PipelineSettings, RequestFilters, RequestService, RequestStatus,
};

use crate::cli::{Command, IpCommand, RequestCommand, ResourceCommand};

/// Everything a command or the daemon needs, wired to one pool.
#[derive(Clone)]
pub struct Services {
    pub pool: SqlitePool,
    pub requests: RequestService,
    pub ipam: IpamService,
    pub pipeline: Arc<Pipeline>,
}

impl Services {
    pub fn new(
        pool: SqlitePool,
        queue: JobQueue,
        executor: Arc<dyn IacExecutor>,
        notifier: Arc<dyn NotificationSink>,
        settings: PipelineSettings,
    ) -> Self {
        let ipam = IpamService::new(pool.clone());
        let pipeline = Pipeline::new(pool.clone(), executor, notifier.clone(), settings)
            .with_ipam(ipam.clone());

        Self {
            requests: RequestService::new(pool.clone(), queue, notifier),
            ipam,
            pipeline: Arc::new(pipeline),
            pool,
        }
    }
}

/// Run one operator command and return its result as JSON.
pub async fn execute(services: &Services, command: Command) -> Result<Value> {
    match command {
        Command::Serve => bail!("serve runs the daemon and has no one-shot form"),
        Command::Request(command) => request_command(services, command).await,
        Command::Resource(command) => resource_command(services, command).await,
        Command::Ip(command) => ip_command(services, command).await,
    }
}

async fn request_command(services: &Services, command: RequestCommand) -> Result<Value> {
    let requests = &services.requests;

    let value = match command {
        RequestCommand::Create(args) => {
            let spec: Value = serde_json::from_str(&args.spec).context("--spec is not valid JSON")?;
            let request = requests
                .create_request(CreateRequest {
                    requester: args.requester,
                    provider: args.provider,
                    resource_type: args.resource_type,
                    environment: args.environment,
                    spec,
                    quantity: args.quantity,
                    provider_id: args.provider_id,
                    module_id: args.module_id,
                    credential_id: args.credential_id,
                    zone_id: args.zone_id,
                    region_id: args.region_id,
                })
                .await?;
            serde_json::to_value(request)?
        }
        RequestCommand::Show { id, log } => {
            let mut request = requests.get_request(&id).await?;
            if !log {
                request.provisioning_log = None;
            }
            serde_json::to_value(request)?
        }
        RequestCommand::List { requester, status } => {
            let status = status
                .map(|s| s.parse::<RequestStatus>())
                .transpose()?;
            let mut list = requests
                .list_requests(RequestFilters { requester, status })
                .await?;
            for request in &mut list {
                request.provisioning_log = None;
            }
            serde_json::to_value(list)?
        }
        RequestCommand::Approve {
            id,
            approver,
            reason,
        } => serde_json::to_value(requests.approve(&id, &approver, reason.as_deref()).await?)?,
        RequestCommand::Reject {
            id,
            approver,
            reason,
        } => serde_json::to_value(requests.reject(&id, &approver, &reason).await?)?,
        RequestCommand::Retry { id } => serde_json::to_value(requests.retry(&id).await?)?,
        RequestCommand::Delete { id } => {
            requests.delete_request(&id).await?;
            json!({ "deleted": id })
        }
        RequestCommand::Config { id } => serde_json::to_value(requests.get_node_config(&id).await?)?,
    };

    Ok(value)
}

async fn resource_command(services: &Services, command: ResourceCommand) -> Result<Value> {
    let requests = &services.requests;

    let value = match command {
        ResourceCommand::List { owner } => {
            serde_json::to_value(requests.list_resources(owner.as_deref()).await?)?
        }
        ResourceCommand::Show { id } => serde_json::to_value(requests.get_resource(&id).await?)?,
        ResourceCommand::Destroy { id } => {
            requests.destroy_resource(&id).await?;
            let outcome = match services.pipeline.destroy(&id).await? {
                DestroyOutcome::Destroyed => json!({ "result": "destroyed" }),
                DestroyOutcome::Failed { message } => {
                    json!({ "result": "failed", "error": message })
                }
                DestroyOutcome::Skipped => json!({ "result": "skipped" }),
            };
            json!({
                "outcome": outcome,
                "resource": requests.get_resource(&id).await?,
            })
        }
    };

    Ok(value)
}

async fn ip_command(services: &Services, command: IpCommand) -> Result<Value> {
    let ipam = &services.ipam;

    let value = match command {
        IpCommand::CreatePool {
            name,
            cidr,
            start,
            end,
            gateway,
            zone_id,
        } => serde_json::to_value(
            ipam.create_pool(CreatePool {
                name,
                cidr,
                gateway,
                start_address: start,
                end_address: end,
                zone_id,
            })
            .await?,
        )?,
        IpCommand::Pools => serde_json::to_value(ipam.list_pools().await?)?,
        IpCommand::List { pool_id } => serde_json::to_value(ipam.list_allocations(&pool_id).await?)?,
        IpCommand::Allocate {
            pool_id,
            hostname,
            resource_ref,
        } => serde_json::to_value(
            ipam.allocate_next_available(&pool_id, hostname.as_deref(), resource_ref.as_deref())
                .await?,
        )?,
        IpCommand::AllocateSpecific {
            pool_id,
            address,
            hostname,
            resource_ref,
        } => serde_json::to_value(
            ipam.allocate_specific(
                &pool_id,
                &address,
                hostname.as_deref(),
                resource_ref.as_deref(),
            )
            .await?,
        )?,
        IpCommand::Release { allocation_id } => {
            serde_json::to_value(ipam.release(&allocation_id).await?)?
        }
        IpCommand::Available { pool_id } => {
            json!({ "pool_id": pool_id, "available": ipam.available_count(&pool_id).await? })
        }
    };

    Ok(value)
}
