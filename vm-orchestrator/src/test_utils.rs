//! Fixtures shared by unit and integration tests.
//!
//! Collaborator rows (regions, zones, providers, credentials, modules and git
//! repositories) have no management operations here, so tests seed them
//! directly.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::notify::{NotificationEvent, NotificationSink};

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // Every connection to `sqlite::memory:` is its own database, so the pool
    // keeps exactly one connection alive for the lifetime of the test.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub async fn seed_region(pool: &SqlitePool, name: &str) -> String {
    let id = new_id();
    sqlx::query("INSERT INTO regions (id, name, created_at) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(name)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await
        .expect("Failed to seed region");
    id
}

pub async fn seed_zone(pool: &SqlitePool, region_id: &str, name: &str) -> String {
    let id = new_id();
    sqlx::query("INSERT INTO zones (id, region_id, name, created_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(region_id)
        .bind(name)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await
        .expect("Failed to seed zone");
    id
}

pub async fn seed_provider(pool: &SqlitePool, name: &str, kind: &str) -> String {
    let id = new_id();
    sqlx::query("INSERT INTO providers (id, name, kind, version, created_at) VALUES (?, ?, ?, NULL, ?)")
        .bind(&id)
        .bind(name)
        .bind(kind)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await
        .expect("Failed to seed provider");
    id
}

pub async fn seed_credential(
    pool: &SqlitePool,
    provider_id: &str,
    endpoint: &str,
    username: &str,
    secret: &str,
) -> String {
    let id = new_id();
    sqlx::query(
        "INSERT INTO credentials (id, provider_id, name, endpoint, username, secret, token, created_at)
         VALUES (?, ?, ?, ?, ?, ?, NULL, ?)",
    )
    .bind(&id)
    .bind(provider_id)
    .bind(format!("{username}@{endpoint}"))
    .bind(endpoint)
    .bind(username)
    .bind(secret)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await
    .expect("Failed to seed credential");
    id
}

pub async fn seed_module(
    pool: &SqlitePool,
    name: &str,
    source: &str,
    version: Option<&str>,
    fetch_token: Option<&str>,
) -> String {
    let id = new_id();
    sqlx::query(
        "INSERT INTO modules (id, name, source, version, fetch_username, fetch_token, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(source)
    .bind(version)
    .bind(fetch_token.map(|_| "deploy"))
    .bind(fetch_token)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await
    .expect("Failed to seed module");
    id
}

pub async fn seed_git_repository(pool: &SqlitePool, url: &str, branch: &str) -> String {
    let id = new_id();
    sqlx::query(
        "INSERT INTO git_repositories (id, url, branch, auth_type, base_path, is_default, created_at)
         VALUES (?, ?, ?, 'none', 'configs', 1, ?)",
    )
    .bind(&id)
    .bind(url)
    .bind(branch)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await
    .expect("Failed to seed git repository");
    id
}

/// Notification sink that keeps every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(NotificationEvent, String, Value)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(NotificationEvent, String, Value)> {
        self.events.lock().expect("notifier lock").clone()
    }

    pub fn kinds(&self) -> Vec<NotificationEvent> {
        self.events().into_iter().map(|(kind, _, _)| kind).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, event: NotificationEvent, user_id: &str, payload: Value) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("notifier lock poisoned"))?
            .push((event, user_id.to_string(), payload));
        Ok(())
    }
}
