//! IP address pools.
//!
//! A pool covers `[start_address, end_address]` inside a CIDR. Rows in
//! `ip_allocations` are created lazily the first time an address is handed
//! out and are reset to `available` on release, never deleted.
//!
//! Mutations on one pool are serialized twice: by an in-process async mutex
//! and by touching the pool row first so the SQLite write lock is held for
//! the whole transaction. `UNIQUE(pool_id, address)` is the final backstop.

mod address;

pub use address::Address;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::{to_datetime, to_optional_datetime};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Available,
    Reserved,
    Allocated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpPool {
    pub id: String,
    pub name: String,
    pub cidr: String,
    pub gateway: Option<String>,
    pub start_address: String,
    pub end_address: String,
    pub zone_id: Option<String>,
    pub status: PoolStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IpPool {
    pub fn prefix_len(&self) -> Option<u8> {
        IpNetwork::from_str(&self.cidr).ok().map(|n| n.prefix())
    }

    pub fn gateway_addr(&self) -> Option<IpAddr> {
        self.gateway.as_deref().and_then(|g| g.parse().ok())
    }

    fn bounds(&self) -> Result<(Address, Address)> {
        let start = parse_address(&self.start_address)?;
        let end = parse_address(&self.end_address)?;
        Ok((Address::from(start), Address::from(end)))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match self.bounds() {
            Ok((start, end)) => {
                let candidate = Address::from(ip);
                candidate.is_ipv4() == start.is_ipv4() && start <= candidate && candidate <= end
            }
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAllocation {
    pub id: String,
    pub pool_id: String,
    pub address: String,
    pub status: AllocationStatus,
    pub hostname: Option<String>,
    pub resource_ref: Option<String>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IpAllocation {
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreatePool {
    pub name: String,
    pub cidr: String,
    pub gateway: Option<String>,
    pub start_address: String,
    pub end_address: String,
    pub zone_id: Option<String>,
}

#[derive(sqlx::FromRow)]
struct PoolRow {
    id: String,
    name: String,
    cidr: String,
    gateway: Option<String>,
    start_address: String,
    end_address: String,
    zone_id: Option<String>,
    status: PoolStatus,
    created_at: i64,
    updated_at: i64,
}

impl From<PoolRow> for IpPool {
    fn from(row: PoolRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            cidr: row.cidr,
            gateway: row.gateway,
            start_address: row.start_address,
            end_address: row.end_address,
            zone_id: row.zone_id,
            status: row.status,
            created_at: to_datetime(row.created_at),
            updated_at: to_datetime(row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AllocationRow {
    id: String,
    pool_id: String,
    address: String,
    status: AllocationStatus,
    hostname: Option<String>,
    resource_ref: Option<String>,
    allocated_at: Option<i64>,
    updated_at: i64,
}

impl From<AllocationRow> for IpAllocation {
    fn from(row: AllocationRow) -> Self {
        Self {
            id: row.id,
            pool_id: row.pool_id,
            address: row.address,
            status: row.status,
            hostname: row.hostname,
            resource_ref: row.resource_ref,
            allocated_at: to_optional_datetime(row.allocated_at),
            updated_at: to_datetime(row.updated_at),
        }
    }
}

fn parse_address(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| OrchestratorError::InvalidInput(format!("'{value}' is not an IP address")))
}

#[derive(Clone)]
pub struct IpamService {
    pool: SqlitePool,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl IpamService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn pool_lock(&self, pool_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(pool_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Validate and store a new pool.
    pub async fn create_pool(&self, req: CreatePool) -> Result<IpPool> {
        if req.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput("pool name is required".into()));
        }
        let network = IpNetwork::from_str(req.cidr.trim())
            .map_err(|e| OrchestratorError::InvalidInput(format!("cidr '{}': {e}", req.cidr)))?;
        let start = parse_address(&req.start_address)?;
        let end = parse_address(&req.end_address)?;

        for (label, ip) in [("start", start), ("end", end)] {
            if ip.is_ipv4() != network.is_ipv4() {
                return Err(OrchestratorError::InvalidInput(format!(
                    "{label} address {ip} is not in the same family as {network}"
                )));
            }
            if !network.contains(ip) {
                return Err(OrchestratorError::InvalidInput(format!(
                    "{label} address {ip} is outside {network}"
                )));
            }
        }
        if Address::from(start) > Address::from(end) {
            return Err(OrchestratorError::InvalidInput(format!(
                "start address {start} is after end address {end}"
            )));
        }

        let gateway = match req.gateway.as_deref().map(str::trim).filter(|g| !g.is_empty()) {
            Some(gateway) => {
                let ip = parse_address(gateway)?;
                if ip.is_ipv4() != network.is_ipv4() || !network.contains(ip) {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "gateway {ip} is outside {network}"
                    )));
                }
                Some(ip.to_string())
            }
            None => None,
        };

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO ip_pools (id, name, cidr, gateway, start_address, end_address, zone_id, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(req.name.trim())
        .bind(network.to_string())
        .bind(gateway)
        .bind(start.to_string())
        .bind(end.to_string())
        .bind(&req.zone_id)
        .bind(PoolStatus::Active)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(pool_id = %id, cidr = %network, "Created IP pool");
        self.get_pool(&id).await
    }

    pub async fn get_pool(&self, id: &str) -> Result<IpPool> {
        let row = sqlx::query_as::<_, PoolRow>("SELECT * FROM ip_pools WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("ip pool {id}")))?;

        Ok(row.into())
    }

    pub async fn list_pools(&self) -> Result<Vec<IpPool>> {
        let rows = sqlx::query_as::<_, PoolRow>("SELECT * FROM ip_pools ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// The oldest active pool attached to a zone.
    pub async fn pool_for_zone(&self, zone_id: &str) -> Result<Option<IpPool>> {
        let row = sqlx::query_as::<_, PoolRow>(
            "SELECT * FROM ip_pools WHERE zone_id = ? AND status = ? ORDER BY created_at, id LIMIT 1",
        )
        .bind(zone_id)
        .bind(PoolStatus::Active)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    pub async fn set_pool_status(&self, id: &str, status: PoolStatus) -> Result<IpPool> {
        let result = sqlx::query("UPDATE ip_pools SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("ip pool {id}")));
        }
        self.get_pool(id).await
    }

    pub async fn list_allocations(&self, pool_id: &str) -> Result<Vec<IpAllocation>> {
        let rows = sqlx::query_as::<_, AllocationRow>(
            "SELECT * FROM ip_allocations WHERE pool_id = ?",
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await?;

        let mut allocations: Vec<IpAllocation> = rows.into_iter().map(|row| row.into()).collect();
        allocations.sort_by_key(|a| a.ip().map(Address::from));
        Ok(allocations)
    }

    pub async fn get_allocation(&self, id: &str) -> Result<IpAllocation> {
        let row = sqlx::query_as::<_, AllocationRow>("SELECT * FROM ip_allocations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("ip allocation {id}")))?;

        Ok(row.into())
    }

    /// Allocations currently held (reserved or allocated) by `resource_ref`.
    pub async fn allocations_for(&self, resource_ref: &str) -> Result<Vec<IpAllocation>> {
        let rows = sqlx::query_as::<_, AllocationRow>(
            "SELECT * FROM ip_allocations WHERE resource_ref = ? AND status != ?",
        )
        .bind(resource_ref)
        .bind(AllocationStatus::Available)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Reserve the lowest free address in the pool.
    #[instrument(skip(self))]
    pub async fn allocate_next_available(
        &self,
        pool_id: &str,
        hostname: Option<&str>,
        resource_ref: Option<&str>,
    ) -> Result<IpAllocation> {
        let lock = self.pool_lock(pool_id);
        let _guard = lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let pool = lock_pool(&mut tx, pool_id).await?;
        ensure_active(&pool)?;
        let (start, end) = pool.bounds()?;
        let taken = taken_addresses(&mut tx, pool_id).await?;

        let mut candidate = Some(start);
        let mut chosen = None;
        while let Some(address) = candidate {
            if address > end {
                break;
            }
            if !taken.contains(&address.to_string()) {
                chosen = Some(address);
                break;
            }
            candidate = address.successor();
        }

        let address = chosen.ok_or_else(|| OrchestratorError::PoolExhausted(pool_id.to_string()))?;
        let allocation = reserve(&mut tx, pool_id, address, hostname, resource_ref).await?;
        tx.commit().await?;

        info!(pool_id, address = %allocation.address, "Reserved IP address");
        Ok(allocation)
    }

    /// Reserve one chosen address.
    #[instrument(skip(self))]
    pub async fn allocate_specific(
        &self,
        pool_id: &str,
        address: &str,
        hostname: Option<&str>,
        resource_ref: Option<&str>,
    ) -> Result<IpAllocation> {
        let ip = parse_address(address)?;

        let lock = self.pool_lock(pool_id);
        let _guard = lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let pool = lock_pool(&mut tx, pool_id).await?;
        ensure_active(&pool)?;
        if !pool.contains(ip) {
            return Err(OrchestratorError::InvalidInput(format!(
                "{ip} is outside {}-{}",
                pool.start_address, pool.end_address
            )));
        }
        let taken = taken_addresses(&mut tx, pool_id).await?;
        if taken.contains(&ip.to_string()) {
            return Err(OrchestratorError::InvalidState(format!(
                "{ip} is already in use in pool {pool_id}"
            )));
        }

        let allocation = reserve(&mut tx, pool_id, Address::from(ip), hostname, resource_ref).await?;
        tx.commit().await?;

        info!(pool_id, address = %allocation.address, "Reserved requested IP address");
        Ok(allocation)
    }

    /// Move a reservation to allocated once its owner exists.
    pub async fn confirm(&self, allocation_id: &str, resource_ref: &str) -> Result<IpAllocation> {
        let current = self.get_allocation(allocation_id).await?;
        let lock = self.pool_lock(&current.pool_id);
        let _guard = lock.lock().await;
        let mut tx = self.pool.begin().await?;
        lock_pool(&mut tx, &current.pool_id).await?;

        let result = sqlx::query(
            "UPDATE ip_allocations SET status = ?, resource_ref = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(AllocationStatus::Allocated)
        .bind(resource_ref)
        .bind(Utc::now().timestamp())
        .bind(allocation_id)
        .bind(AllocationStatus::Reserved)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::InvalidState(format!(
                "allocation {allocation_id} is not reserved"
            )));
        }
        tx.commit().await?;

        self.get_allocation(allocation_id).await
    }

    /// Return an address to the pool. The row is kept for the audit trail.
    pub async fn release(&self, allocation_id: &str) -> Result<IpAllocation> {
        let current = self.get_allocation(allocation_id).await?;
        let lock = self.pool_lock(&current.pool_id);
        let _guard = lock.lock().await;
        let mut tx = self.pool.begin().await?;
        lock_pool(&mut tx, &current.pool_id).await?;

        sqlx::query(
            "UPDATE ip_allocations
             SET status = ?, hostname = NULL, resource_ref = NULL, allocated_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(AllocationStatus::Available)
        .bind(Utc::now().timestamp())
        .bind(allocation_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(allocation_id, address = %current.address, "Released IP address");
        self.get_allocation(allocation_id).await
    }

    /// Release everything held by `resource_ref`; returns how many rows changed.
    pub async fn release_for_resource(&self, resource_ref: &str) -> Result<usize> {
        let held = self.allocations_for(resource_ref).await?;
        for allocation in &held {
            self.release(&allocation.id).await?;
        }
        if !held.is_empty() {
            info!(resource_ref, count = held.len(), "Released IP addresses");
        }
        Ok(held.len())
    }

    /// Addresses in range that are not reserved or allocated.
    pub async fn available_count(&self, pool_id: &str) -> Result<u64> {
        let pool = self.get_pool(pool_id).await?;
        let (start, end) = pool.bounds()?;

        let (in_use,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM ip_allocations WHERE pool_id = ? AND status != ?",
        )
        .bind(pool_id)
        .bind(AllocationStatus::Available)
        .fetch_one(&self.pool)
        .await?;

        let total = start.span_to(&end);
        let available = total.saturating_sub(u128::try_from(in_use).unwrap_or_default());
        Ok(u64::try_from(available).unwrap_or(u64::MAX))
    }
}

/// Take the write lock for the pool's transaction, then read it.
async fn lock_pool(conn: &mut SqliteConnection, pool_id: &str) -> Result<IpPool> {
    let touched = sqlx::query("UPDATE ip_pools SET updated_at = ? WHERE id = ?")
        .bind(Utc::now().timestamp())
        .bind(pool_id)
        .execute(&mut *conn)
        .await?;
    if touched.rows_affected() == 0 {
        return Err(OrchestratorError::NotFound(format!("ip pool {pool_id}")));
    }

    let row = sqlx::query_as::<_, PoolRow>("SELECT * FROM ip_pools WHERE id = ?")
        .bind(pool_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.into())
}

fn ensure_active(pool: &IpPool) -> Result<()> {
    if pool.status != PoolStatus::Active {
        return Err(OrchestratorError::InvalidState(format!(
            "ip pool {} is disabled",
            pool.id
        )));
    }
    Ok(())
}

async fn taken_addresses(conn: &mut SqliteConnection, pool_id: &str) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT address FROM ip_allocations WHERE pool_id = ? AND status != ?")
            .bind(pool_id)
            .bind(AllocationStatus::Available)
            .fetch_all(&mut *conn)
            .await?;

    Ok(rows.into_iter().map(|(address,)| address).collect())
}

async fn reserve(
    conn: &mut SqliteConnection,
    pool_id: &str,
    address: Address,
    hostname: Option<&str>,
    resource_ref: Option<&str>,
) -> Result<IpAllocation> {
    let now = Utc::now().timestamp();
    let address = address.to_string();

    // Reuses a released row; an occupied row leaves zero rows affected.
    let result = sqlx::query(
        "INSERT INTO ip_allocations (id, pool_id, address, status, hostname, resource_ref, allocated_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(pool_id, address) DO UPDATE SET
             status = excluded.status,
             hostname = excluded.hostname,
             resource_ref = excluded.resource_ref,
             allocated_at = excluded.allocated_at,
             updated_at = excluded.updated_at
         WHERE ip_allocations.status = 'available'",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(pool_id)
    .bind(&address)
    .bind(AllocationStatus::Reserved)
    .bind(hostname)
    .bind(resource_ref)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(OrchestratorError::InvalidState(format!(
            "{address} is already in use in pool {pool_id}"
        )));
    }

    let row = sqlx::query_as::<_, AllocationRow>(
        "SELECT * FROM ip_allocations WHERE pool_id = ? AND address = ?",
    )
    .bind(pool_id)
    .bind(&address)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.into())
}
