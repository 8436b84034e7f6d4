//! Infrastructure-as-code layer for VM requests.
//!
//! Renders a request's VM spec into Terraform (or Terragrunt) configuration
//! and drives the external tool through its init/plan/apply/destroy stages.
//! Nothing in here touches the database; the orchestrator owns persistence.

pub mod error;
pub mod executor;
pub mod generator;
pub mod hcl;
pub mod module_source;
pub mod secret;
pub mod spec;
pub mod workdir;

// When the `test-helpers` feature is enabled, include the scripted executor.
#[cfg(feature = "test-helpers")]
pub mod mock;

pub use error::{IacError, Result};
pub use executor::{IacExecutor, Stage, StageOutcome, TerraformExecutor, WRAPPER_CONFIG_FILE};
pub use generator::{
    render, ConfigMode, GeneratorInput, ModuleRef, NetworkAssignment, RegistryMirror,
    RenderedConfig,
};
pub use secret::Secret;
pub use spec::{ProviderKind, VmSpec};
pub use workdir::{ModuleAuth, ToolSecrets, WorkDir};
