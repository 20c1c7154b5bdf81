//! Per-VM `/24` subnet allocation from a configured third-octet range.
//!
//! Each VM gets one third octet in `[100, 254]`; the derived addresses are
//! gateway `192.168.X.1`, guest `192.168.X.2`, CIDR `192.168.X.0/24`.
//! Allocation is serialised under an in-process mutex plus the store's
//! writer lock, and the UNIQUE constraint on the octet column keeps
//! concurrent allocators in separate processes from handing out
//! duplicates.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Migration, Store};
use crate::error::{Error, Result};
use crate::id::now_rfc3339;

/// Lowest assignable third octet.
pub const OCTET_MIN: u8 = 100;
/// Highest assignable third octet.
pub const OCTET_MAX: u8 = 254;

/// One persisted allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetAllocation {
    pub vm_id: String,
    pub octet: u8,
    pub gateway_ip: String,
    pub guest_ip: String,
    pub subnet: String,
    pub created_at: String,
}

impl SubnetAllocation {
    fn derive(vm_id: &str, octet: u8) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            octet,
            gateway_ip: format!("192.168.{}.1", octet),
            guest_ip: format!("192.168.{}.2", octet),
            subnet: format!("192.168.{}.0/24", octet),
            created_at: now_rfc3339(),
        }
    }
}

#[derive(Clone)]
pub struct SubnetAllocator {
    store: Store,
    lock: Arc<Mutex<()>>,
}

impl SubnetAllocator {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn migrations() -> Vec<Migration> {
        vec![Migration {
            module: "subnet",
            version: 1,
            sql: "CREATE TABLE subnets (
                      vm_id      TEXT    PRIMARY KEY,
                      octet      INTEGER NOT NULL UNIQUE,
                      gateway_ip TEXT    NOT NULL,
                      guest_ip   TEXT    NOT NULL,
                      subnet     TEXT    NOT NULL,
                      created_at TEXT    NOT NULL
                  );",
        }]
    }

    /// Path of the store file backing the allocations, recorded in the
    /// lifecycle resources inventory.
    pub fn allocation_file(&self) -> String {
        self.store.path().display().to_string()
    }

    /// Allocate the lowest free third octet for `vm_id`.
    ///
    /// Re-allocating for a VM that already holds a subnet returns the
    /// existing allocation.
    pub fn allocate(&self, vm_id: &str) -> Result<SubnetAllocation> {
        let _guard = self.lock.lock().unwrap();

        if let Some(existing) = self.get(vm_id)? {
            return Ok(existing);
        }

        let allocation = self.store.with_tx(|tx| {
            let mut stmt = tx.prepare("SELECT octet FROM subnets ORDER BY octet")?;
            let taken: HashSet<i64> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);

            let Some(octet) =
                (OCTET_MIN..=OCTET_MAX).find(|octet| !taken.contains(&(*octet as i64)))
            else {
                // Sentinel row count signals exhaustion to the outer layer.
                return Ok(None);
            };

            let allocation = SubnetAllocation::derive(vm_id, octet);
            tx.execute(
                "INSERT INTO subnets (vm_id, octet, gateway_ip, guest_ip, subnet, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    allocation.vm_id,
                    allocation.octet as i64,
                    allocation.gateway_ip,
                    allocation.guest_ip,
                    allocation.subnet,
                    allocation.created_at,
                ],
            )?;
            Ok(Some(allocation))
        })?;

        match allocation {
            Some(allocation) => {
                info!(vm_id, octet = allocation.octet, subnet = %allocation.subnet, "subnet allocated");
                Ok(allocation)
            }
            None => Err(Error::SubnetExhausted),
        }
    }

    pub fn get(&self, vm_id: &str) -> Result<Option<SubnetAllocation>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT vm_id, octet, gateway_ip, guest_ip, subnet, created_at
                 FROM subnets WHERE vm_id = ?1",
                rusqlite::params![vm_id],
                row_to_allocation,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub fn list(&self) -> Result<Vec<SubnetAllocation>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT vm_id, octet, gateway_ip, guest_ip, subnet, created_at
                 FROM subnets ORDER BY octet",
            )?;
            let rows = stmt.query_map([], row_to_allocation)?;
            rows.collect()
        })
    }

    /// Release the allocation for `vm_id`. Idempotent.
    pub fn release(&self, vm_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap();
        let deleted = self.store.with_tx(|tx| {
            tx.execute("DELETE FROM subnets WHERE vm_id = ?1", rusqlite::params![vm_id])
        })?;
        Ok(deleted > 0)
    }

    /// Delete any allocation whose VM is unknown to the state store.
    /// Returns the IDs whose rows were removed.
    pub fn cleanup(&self, known_vm_ids: &HashSet<String>) -> Result<Vec<String>> {
        let _guard = self.lock.lock().unwrap();
        let stale: Vec<String> = self
            .list()?
            .into_iter()
            .map(|a| a.vm_id)
            .filter(|id| !known_vm_ids.contains(id))
            .collect();

        for vm_id in &stale {
            self.store.with_tx(|tx| {
                tx.execute("DELETE FROM subnets WHERE vm_id = ?1", rusqlite::params![vm_id])
            })?;
            info!(vm_id = %vm_id, "released orphaned subnet allocation");
        }
        Ok(stale)
    }
}

fn row_to_allocation(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubnetAllocation> {
    let octet: i64 = row.get(1)?;
    Ok(SubnetAllocation {
        vm_id: row.get(0)?,
        octet: octet as u8,
        gateway_ip: row.get(2)?,
        guest_ip: row.get(3)?,
        subnet: row.get(4)?,
        created_at: row.get(5)?,
    })
}
