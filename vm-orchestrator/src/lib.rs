//! Request orchestration for VM provisioning
//!
//! Owns the request state machine, the provisioning pipeline that drives the
//! infrastructure tool, and the IP address pools the pipeline draws from. It
//! is consumed by the `provisiond` binary but has no knowledge of how it is
//! invoked.

pub mod catalog;
pub mod db;
pub mod error;
pub mod ipam;
pub mod node_config;
pub mod notify;
pub mod pipeline;
pub mod request;
pub mod requests;
pub mod resource;
pub mod worker;

/// Fixtures for this crate's tests and for downstream integration tests.
pub mod test_utils;

pub use error::{OrchestratorError, Result};
pub use ipam::{AllocationStatus, CreatePool, IpAllocation, IpPool, IpamService, PoolStatus};
pub use node_config::{NodeConfig, NodeConfigStatus};
pub use notify::{LogNotifier, NotificationEvent, NotificationSink};
pub use pipeline::{DestroyOutcome, Pipeline, PipelineSettings, ProvisionOutcome};
pub use request::{CreateRequest, FailureStage, RequestFilters, RequestStatus, ResourceRequest};
pub use requests::RequestService;
pub use resource::{Resource, ResourceStatus};
pub use worker::{start_sweeper_task, sweep_approved, Job, JobQueue, ProvisioningWorker};
