//! Version-controlled store for generated provisioning configuration.
//!
//! Rendered files are committed to `<base_path>/<environment>/<request_id>/`
//! of a registered repository as a "pending" commit. Once provisioning
//! succeeds the same commit is tagged `applied/<request_id>`.

pub mod error;
pub mod settings;
pub mod store;

pub use error::{Result, StoreError};
pub use settings::{config_path, AuthType, RepoSettings};
pub use store::{CommitRecord, GitConfigStore, APPLIED_TAG_PREFIX};
