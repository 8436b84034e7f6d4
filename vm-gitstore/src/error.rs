use git2::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid repository URL: {0}")]
    Url(String),

    #[error("Invalid config path component: {0}")]
    InvalidPath(String),

    #[error("Push of {reference} rejected: {message}")]
    PushRejected { reference: String, message: String },
}

impl StoreError {
    /// The remote ref moved, or was mid-update, between clone and push.
    pub fn is_stale_branch(&self) -> bool {
        match self {
            StoreError::Git(e) => matches!(e.code(), ErrorCode::NotFastForward | ErrorCode::Locked),
            StoreError::PushRejected { message, .. } => {
                let message = message.to_ascii_lowercase();
                ["non-fast-forward", "fetch first", "stale info", "failed to lock"]
                    .iter()
                    .any(|needle| message.contains(needle))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::ErrorClass;

    #[test]
    fn test_stale_branch_classification() {
        let nff = git2::Error::new(ErrorCode::NotFastForward, ErrorClass::Reference, "cannot push");
        assert!(StoreError::from(nff).is_stale_branch());

        let rejected = StoreError::PushRejected {
            reference: "refs/heads/main".to_string(),
            message: "rejected (fetch first)".to_string(),
        };
        assert!(rejected.is_stale_branch());

        let denied = StoreError::PushRejected {
            reference: "refs/heads/main".to_string(),
            message: "pre-receive hook declined".to_string(),
        };
        assert!(!denied.is_stale_branch());

        let auth = git2::Error::new(ErrorCode::Auth, ErrorClass::Http, "bad credentials");
        assert!(!StoreError::from(auth).is_stale_branch());
    }
}
