//! Commit and tag operations against a configuration repository.
//!
//! Every operation clones into its own temporary directory, which is removed
//! when the operation returns, successful or not.
//!
//! Writers to one repository are serialized within the process. A push that
//! loses a race against another writer is rebuilt on the new branch tip and
//! retried; every request owns its own directory, so a rebuild never
//! conflicts.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use git2::build::RepoBuilder;
use git2::{
    Cred, CredentialType, FetchOptions, IndexAddOption, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature,
};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::settings::{config_path, AuthType, RepoSettings};

/// Tag prefix marking a commit whose configuration has been applied.
pub const APPLIED_TAG_PREFIX: &str = "applied";

const MAX_PUSH_ATTEMPTS: u32 = 8;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

static REPOSITORY_LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();

fn repository_lock(url: &str) -> Arc<Mutex<()>> {
    let locks = REPOSITORY_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut locks = locks.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(url.to_string()).or_default())
}

/// Where a request's files landed and which commit holds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub path: String,
    pub commit_id: String,
}

#[derive(Debug, Clone)]
pub struct GitConfigStore {
    settings: RepoSettings,
}

impl GitConfigStore {
    pub fn new(settings: RepoSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RepoSettings {
        &self.settings
    }

    /// Commit `files` under the request's directory and push the branch.
    ///
    /// When the files already match the branch head nothing is pushed and the
    /// head commit is returned.
    pub fn commit_pending(
        &self,
        request_id: &str,
        environment: &str,
        files: &[(&str, &str)],
        message: &str,
    ) -> Result<CommitRecord> {
        let relative = config_path(&self.settings.base_path, environment, request_id)?;
        for (name, _) in files {
            if name.contains('/') || name.contains('\\') || name.starts_with("..") {
                return Err(StoreError::InvalidPath((*name).to_string()));
            }
        }

        let lock = repository_lock(&self.settings.url);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.with_push_retry(request_id, || {
            self.try_commit(request_id, &relative, files, message)
        })
    }

    fn try_commit(
        &self,
        request_id: &str,
        relative: &Path,
        files: &[(&str, &str)],
        message: &str,
    ) -> Result<CommitRecord> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("cfg-{request_id}-"))
            .tempdir()?;
        let repo = self.clone_into(&scratch.path().join("repo"))?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| StoreError::InvalidPath("bare clone".to_string()))?
            .to_path_buf();

        let target = workdir.join(relative);
        fs::create_dir_all(&target)?;
        for (name, contents) in files {
            fs::write(target.join(name), contents)?;
        }

        let mut index = repo.index()?;
        index.add_all([relative], IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let head = repo.head()?.peel_to_commit()?;
        let path = relative.to_string_lossy().replace('\\', "/");
        if head.tree_id() == tree_id {
            debug!(request_id, path = %path, "Config unchanged, reusing head commit");
            return Ok(CommitRecord {
                path,
                commit_id: head.id().to_string(),
            });
        }

        let tree = repo.find_tree(tree_id)?;
        let signature = Signature::now(&self.settings.author_name, &self.settings.author_email)?;
        let commit_id = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &[&head])?;

        let branch_ref = format!("refs/heads/{}", self.settings.branch);
        self.push(&repo, &format!("{branch_ref}:{branch_ref}"))?;

        info!(request_id, path = %path, commit = %commit_id, "Committed pending config");
        Ok(CommitRecord {
            path,
            commit_id: commit_id.to_string(),
        })
    }

    /// Re-run `operation` from a fresh clone while the remote keeps moving
    /// underneath it.
    fn with_push_retry<T>(
        &self,
        request_id: &str,
        mut operation: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            match operation() {
                Err(e) if e.is_stale_branch() && attempt < MAX_PUSH_ATTEMPTS => {
                    warn!(
                        request_id,
                        attempt,
                        "Branch moved before push, rebuilding on the new tip: {}",
                        e
                    );
                    thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Tag `commit_id` as applied for `request_id` and push the tag.
    pub fn mark_applied(&self, request_id: &str, commit_id: &str) -> Result<()> {
        // Rejects request ids that would escape the tag namespace.
        config_path("", APPLIED_TAG_PREFIX, request_id)?;
        let oid = Oid::from_str(commit_id)?;

        let lock = repository_lock(&self.settings.url);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.with_push_retry(request_id, || self.try_tag(request_id, commit_id, oid))
    }

    fn try_tag(&self, request_id: &str, commit_id: &str, oid: Oid) -> Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("cfg-{request_id}-"))
            .tempdir()?;
        let repo = self.clone_into(&scratch.path().join("repo"))?;

        if repo.find_commit(oid).is_err() {
            // Shallow clones only carry the tip; fetch the commit itself.
            let mut remote = repo.find_remote("origin")?;
            let mut options = FetchOptions::new();
            options.remote_callbacks(credential_callbacks(&self.settings));
            remote.fetch(&[commit_id], Some(&mut options), None)?;
        }
        let commit = repo.find_commit(oid)?;

        let tag_name = format!("{APPLIED_TAG_PREFIX}/{request_id}");
        repo.tag_lightweight(&tag_name, commit.as_object(), true)?;

        let tag_ref = format!("refs/tags/{tag_name}");
        self.push(&repo, &format!("+{tag_ref}:{tag_ref}"))?;

        info!(request_id, commit = %commit_id, "Marked config applied");
        Ok(())
    }

    fn clone_into(&self, path: &Path) -> Result<Repository> {
        let url = self.settings.authenticated_url()?;
        let branch = self.settings.branch.clone();

        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(credential_callbacks(&self.settings));
        if self.settings.is_network_url() {
            fetch.depth(1);
        }

        let mut builder = RepoBuilder::new();
        builder.branch(&branch);
        builder.fetch_options(fetch);
        builder.remote_create(move |repo, name, url| {
            let refspec = format!("+refs/heads/{branch}:refs/remotes/{name}/{branch}");
            repo.remote_with_fetch(name, url, &refspec)
        });

        debug!(branch = %self.settings.branch, "Cloning config repository");
        Ok(builder.clone(&url, path)?)
    }

    fn push(&self, repo: &Repository, refspec: &str) -> Result<()> {
        let mut remote = repo.find_remote("origin")?;
        let mut rejection: Option<(String, String)> = None;
        {
            let mut callbacks = credential_callbacks(&self.settings);
            callbacks.push_update_reference(|reference, status| {
                if let Some(message) = status {
                    rejection = Some((reference.to_string(), message.to_string()));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            remote.push(&[refspec], Some(&mut options))?;
        }

        match rejection {
            Some((reference, message)) => Err(StoreError::PushRejected { reference, message }),
            None => Ok(()),
        }
    }
}

fn credential_callbacks(settings: &RepoSettings) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0;
    callbacks.credentials(move |_url, username_from_url, allowed| {
        attempts += 1;
        if attempts > 3 {
            return Err(git2::Error::from_str("repository authentication failed"));
        }
        match settings.auth {
            AuthType::Ssh if allowed.contains(CredentialType::SSH_KEY) => {
                Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
            }
            AuthType::Token | AuthType::Password
                if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) =>
            {
                let username = match settings.auth {
                    AuthType::Token => "oauth2",
                    _ => settings.username.as_deref().unwrap_or("git"),
                };
                Cred::userpass_plaintext(username, settings.token.as_deref().unwrap_or_default())
            }
            _ => Cred::default(),
        }
    });
    callbacks
}
