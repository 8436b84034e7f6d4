//! Read-only view of collaborator entities and the request aggregate.

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use vm_gitstore::{AuthType, RepoSettings};
use vm_iac::Secret;

use crate::error::{OrchestratorError, Result};
use crate::request::{RequestRow, ResourceRequest};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Region {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Zone {
    pub id: String,
    pub region_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProviderRecord {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub provider_id: Option<String>,
    pub name: String,
    pub endpoint: Option<String>,
    pub username: Option<String>,
    pub secret: Option<Secret>,
    pub token: Option<Secret>,
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: String,
    provider_id: Option<String>,
    name: String,
    endpoint: Option<String>,
    username: Option<String>,
    secret: Option<String>,
    token: Option<String>,
}

impl From<CredentialRow> for Credential {
    fn from(row: CredentialRow) -> Self {
        Self {
            id: row.id,
            provider_id: row.provider_id,
            name: row.name,
            endpoint: row.endpoint,
            username: row.username,
            secret: row.secret.map(Secret::new),
            token: row.token.map(Secret::new),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub id: String,
    pub name: String,
    pub source: String,
    pub version: Option<String>,
    pub fetch_username: Option<String>,
    pub fetch_token: Option<Secret>,
}

#[derive(sqlx::FromRow)]
struct ModuleRow {
    id: String,
    name: String,
    source: String,
    version: Option<String>,
    fetch_username: Option<String>,
    fetch_token: Option<String>,
}

impl From<ModuleRow> for ModuleRecord {
    fn from(row: ModuleRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            source: row.source,
            version: row.version,
            fetch_username: row.fetch_username,
            fetch_token: row.fetch_token.map(Secret::new),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitRepository {
    pub id: String,
    pub settings: RepoSettings,
}

#[derive(sqlx::FromRow)]
struct GitRepositoryRow {
    id: String,
    url: String,
    branch: String,
    auth_type: String,
    username: Option<String>,
    token: Option<String>,
    base_path: String,
}

impl TryFrom<GitRepositoryRow> for GitRepository {
    type Error = OrchestratorError;

    fn try_from(row: GitRepositoryRow) -> Result<Self> {
        let auth: AuthType = row.auth_type.parse()?;
        Ok(Self {
            id: row.id,
            settings: RepoSettings::new(row.url, row.branch)
                .with_auth(auth, row.username, row.token)
                .with_base_path(row.base_path),
        })
    }
}

/// A request together with every collaborator it references.
#[derive(Debug, Clone)]
pub struct RequestAggregate {
    pub request: ResourceRequest,
    pub provider: Option<ProviderRecord>,
    pub module: Option<ModuleRecord>,
    pub credential: Option<Credential>,
    pub zone: Option<Zone>,
    pub region: Option<Region>,
    pub git_repository: Option<GitRepository>,
}

pub async fn load_request(pool: &SqlitePool, request_id: &str) -> Result<ResourceRequest> {
    sqlx::query_as::<_, RequestRow>("SELECT * FROM resource_requests WHERE id = ?")
        .bind(request_id)
        .fetch_optional(pool)
        .await?
        .map(Into::into)
        .ok_or_else(|| OrchestratorError::NotFound(format!("request {request_id}")))
}

/// Load a request and its relations inside one read transaction.
pub async fn load_aggregate(pool: &SqlitePool, request_id: &str) -> Result<RequestAggregate> {
    let mut tx = pool.begin().await?;
    let aggregate = load_aggregate_in(&mut tx, request_id).await?;
    tx.commit().await?;
    Ok(aggregate)
}

async fn load_aggregate_in(conn: &mut SqliteConnection, request_id: &str) -> Result<RequestAggregate> {
    let request: ResourceRequest =
        sqlx::query_as::<_, RequestRow>("SELECT * FROM resource_requests WHERE id = ?")
            .bind(request_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("request {request_id}")))?
            .into();

    let provider = match &request.provider_id {
        Some(id) => Some(
            sqlx::query_as::<_, ProviderRecord>(
                "SELECT id, name, kind, version FROM providers WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("provider {id}")))?,
        ),
        None => None,
    };

    let module: Option<ModuleRecord> = match &request.module_id {
        Some(id) => Some(
            sqlx::query_as::<_, ModuleRow>(
                "SELECT id, name, source, version, fetch_username, fetch_token
                 FROM modules WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("module {id}")))?
            .into(),
        ),
        None => None,
    };

    const CREDENTIAL_COLUMNS: &str =
        "SELECT id, provider_id, name, endpoint, username, secret, token FROM credentials";
    let credential_row = match (&request.credential_id, &request.provider_id) {
        (Some(id), _) => Some(
            sqlx::query_as::<_, CredentialRow>(&format!("{CREDENTIAL_COLUMNS} WHERE id = ?"))
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("credential {id}")))?,
        ),
        // Without an explicit pick, the provider's oldest credential is used.
        (None, Some(provider_id)) => {
            sqlx::query_as::<_, CredentialRow>(&format!(
                "{CREDENTIAL_COLUMNS} WHERE provider_id = ? ORDER BY created_at, id LIMIT 1"
            ))
            .bind(provider_id)
            .fetch_optional(&mut *conn)
            .await?
        }
        (None, None) => None,
    };

    let zone = match &request.zone_id {
        Some(id) => Some(
            sqlx::query_as::<_, Zone>("SELECT id, region_id, name FROM zones WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("zone {id}")))?,
        ),
        None => None,
    };

    let region_id = request
        .region_id
        .clone()
        .or_else(|| zone.as_ref().map(|z| z.region_id.clone()));
    let region = match region_id {
        Some(id) => sqlx::query_as::<_, Region>("SELECT id, name FROM regions WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *conn)
            .await?,
        None => None,
    };

    let git_repository = sqlx::query_as::<_, GitRepositoryRow>(
        "SELECT id, url, branch, auth_type, username, token, base_path
         FROM git_repositories WHERE is_default = 1 ORDER BY created_at, id LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?
    .map(GitRepository::try_from)
    .transpose()?;

    Ok(RequestAggregate {
        request,
        provider,
        module,
        credential: credential_row.map(Into::into),
        zone,
        region,
        git_repository,
    })
}
