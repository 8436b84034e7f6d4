use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Token,
    Password,
    Ssh,
}

impl FromStr for AuthType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(AuthType::None),
            "token" => Ok(AuthType::Token),
            "password" | "basic" => Ok(AuthType::Password),
            "ssh" => Ok(AuthType::Ssh),
            other => Err(StoreError::Url(format!("unsupported auth type '{other}'"))),
        }
    }
}

/// A registered configuration repository.
#[derive(Clone)]
pub struct RepoSettings {
    pub url: String,
    pub branch: String,
    pub auth: AuthType,
    pub username: Option<String>,
    pub token: Option<String>,
    /// Directory inside the repository that holds all request configs.
    pub base_path: String,
    pub author_name: String,
    pub author_email: String,
}

impl fmt::Debug for RepoSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoSettings")
            .field("url", &self.url)
            .field("branch", &self.branch)
            .field("auth", &self.auth)
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("base_path", &self.base_path)
            .finish()
    }
}

impl RepoSettings {
    pub fn new(url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            auth: AuthType::None,
            username: None,
            token: None,
            base_path: String::new(),
            author_name: "provisiond".to_string(),
            author_email: "provisiond@localhost".to_string(),
        }
    }

    pub fn with_auth(
        mut self,
        auth: AuthType,
        username: Option<String>,
        token: Option<String>,
    ) -> Self {
        self.auth = auth;
        self.username = username;
        self.token = token;
        self
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Remote URL with credentials embedded for token and password auth.
    pub fn authenticated_url(&self) -> Result<String> {
        let token = match (self.auth, self.token.as_deref()) {
            (AuthType::Token | AuthType::Password, Some(token)) if !token.is_empty() => token,
            _ => return Ok(self.url.clone()),
        };

        let mut url =
            Url::parse(&self.url).map_err(|e| StoreError::Url(format!("{}: {e}", self.url)))?;
        let username = match self.auth {
            AuthType::Token => "oauth2",
            _ => self.username.as_deref().unwrap_or("git"),
        };
        url.set_username(username)
            .and_then(|_| url.set_password(Some(token)))
            .map_err(|_| StoreError::Url(format!("{} cannot carry credentials", self.url)))?;
        Ok(url.to_string())
    }

    /// Network remotes are cloned shallow; local paths need full history.
    pub fn is_network_url(&self) -> bool {
        ["https://", "http://", "ssh://", "git://", "git@"]
            .iter()
            .any(|prefix| self.url.starts_with(prefix))
    }
}

/// `<base_path>/<environment>/<request_id>` inside the repository.
pub fn config_path(base_path: &str, environment: &str, request_id: &str) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    for part in base_path.split('/').filter(|p| !p.is_empty()) {
        path.push(checked_component(part)?);
    }
    path.push(checked_component(environment)?);
    path.push(checked_component(request_id)?);
    Ok(path)
}

fn checked_component(part: &str) -> Result<&str> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !part.contains('\\') => Ok(part),
        _ => Err(StoreError::InvalidPath(part.to_string())),
    }
}
