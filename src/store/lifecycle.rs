//! Append-only lifecycle history with a per-VM head pointer.
//!
//! Every mutation inserts a new `(vm_id, version)` row; the head table
//! tracks the latest version and is updated in the same `BEGIN IMMEDIATE`
//! transaction as the insert. Versions are computed as `head + 1` inside
//! the transaction, never from auto-increment, so they are strictly
//! monotone per VM even under concurrent writers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Migration, Store};
use crate::error::{Error, Result};
use crate::id::now_rfc3339;
use crate::phase::Phase;

/// Concrete host artefacts tied to a VM, recorded for the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_path: Option<String>,
    /// Path of the store file holding this VM's subnet allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsock_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_table: Option<String>,
}

/// Outcome of one cleanup operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupStatus {
    Ok,
    Error,
}

/// One entry of the cleanup map, keyed by operation name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupEntry {
    pub status: CleanupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: String,
}

impl CleanupEntry {
    pub fn ok() -> Self {
        Self {
            status: CleanupStatus::Ok,
            error: None,
            updated_at: now_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: CleanupStatus::Error,
            error: Some(message.into()),
            updated_at: now_rfc3339(),
        }
    }
}

/// One version of a VM's lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub vm_id: String,
    pub version: i64,
    pub backend: String,
    pub phase: Phase,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub cleanup: BTreeMap<String, CleanupEntry>,
}

#[derive(Clone)]
pub struct LifecycleStore {
    store: Store,
}

impl LifecycleStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn migrations() -> Vec<Migration> {
        vec![Migration {
            module: "lifecycle",
            version: 1,
            sql: "CREATE TABLE lifecycle (
                      vm_id          TEXT    NOT NULL,
                      version        INTEGER NOT NULL,
                      backend        TEXT    NOT NULL,
                      phase          TEXT    NOT NULL,
                      updated_at     TEXT    NOT NULL,
                      last_error     TEXT,
                      resources_json TEXT    NOT NULL,
                      cleanup_json   TEXT    NOT NULL,
                      PRIMARY KEY (vm_id, version)
                  );
                  CREATE TABLE lifecycle_head (
                      vm_id        TEXT PRIMARY KEY,
                      last_version INTEGER NOT NULL
                  );",
        }]
    }

    /// The canonical (latest) record for a VM, if any history exists.
    pub fn latest(&self, vm_id: &str) -> Result<Option<LifecycleRecord>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT l.vm_id, l.version, l.backend, l.phase, l.updated_at,
                        l.last_error, l.resources_json, l.cleanup_json
                 FROM lifecycle l
                 JOIN lifecycle_head h ON h.vm_id = l.vm_id AND h.last_version = l.version
                 WHERE l.vm_id = ?1",
                rusqlite::params![vm_id],
                row_to_record,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    /// Full version history for a VM, oldest first.
    pub fn history(&self, vm_id: &str) -> Result<Vec<LifecycleRecord>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT vm_id, version, backend, phase, updated_at,
                        last_error, resources_json, cleanup_json
                 FROM lifecycle WHERE vm_id = ?1 ORDER BY version",
            )?;
            let rows = stmt.query_map(rusqlite::params![vm_id], row_to_record)?;
            rows.collect()
        })
    }

    /// Ensure a lifecycle record exists, creating version 1 in `creating`
    /// when the VM has no history. Returns the canonical record.
    pub fn ensure(&self, vm_id: &str, backend: &str) -> Result<LifecycleRecord> {
        if let Some(record) = self.latest(vm_id)? {
            return Ok(record);
        }
        let record = LifecycleRecord {
            vm_id: vm_id.to_string(),
            version: 1,
            backend: backend.to_string(),
            phase: Phase::Creating,
            updated_at: now_rfc3339(),
            last_error: None,
            resources: Resources::default(),
            cleanup: BTreeMap::new(),
        };
        self.append(&record)?;
        Ok(record)
    }

    /// Validate and apply a phase transition, appending a new version.
    pub fn transition(
        &self,
        vm_id: &str,
        phase: Phase,
        last_error: Option<&str>,
    ) -> Result<LifecycleRecord> {
        let Some(mut record) = self.latest(vm_id)? else {
            return Err(Error::VmNotFound(vm_id.to_string()));
        };
        if !record.phase.can_transition_to(phase) {
            return Err(Error::InvalidPhase {
                from: record.phase,
                to: phase,
            });
        }
        record.phase = phase;
        record.last_error = last_error.map(str::to_string);
        record.updated_at = now_rfc3339();
        record.version += 1;
        self.append(&record)?;
        Ok(record)
    }

    /// Mutate the resources inventory, appending a new version in the same
    /// phase.
    pub fn update_resources(
        &self,
        vm_id: &str,
        mutate: impl FnOnce(&mut Resources),
    ) -> Result<LifecycleRecord> {
        let Some(mut record) = self.latest(vm_id)? else {
            return Err(Error::VmNotFound(vm_id.to_string()));
        };
        mutate(&mut record.resources);
        record.updated_at = now_rfc3339();
        record.version += 1;
        self.append(&record)?;
        Ok(record)
    }

    /// Record the outcome of one cleanup operation, appending a new
    /// version in the same phase.
    pub fn record_cleanup(
        &self,
        vm_id: &str,
        operation: &str,
        entry: CleanupEntry,
    ) -> Result<LifecycleRecord> {
        let Some(mut record) = self.latest(vm_id)? else {
            return Err(Error::VmNotFound(vm_id.to_string()));
        };
        record.cleanup.insert(operation.to_string(), entry);
        record.updated_at = now_rfc3339();
        record.version += 1;
        self.append(&record)?;
        Ok(record)
    }

    /// Delete a VM's entire history. Only called after reconcile succeeds.
    pub fn delete(&self, vm_id: &str) -> Result<()> {
        self.store.with_tx(|tx| {
            tx.execute(
                "DELETE FROM lifecycle WHERE vm_id = ?1",
                rusqlite::params![vm_id],
            )?;
            tx.execute(
                "DELETE FROM lifecycle_head WHERE vm_id = ?1",
                rusqlite::params![vm_id],
            )?;
            Ok(())
        })
    }

    /// Insert a new version row and advance the head in one transaction.
    ///
    /// The version stored is `head + 1` as read inside the transaction;
    /// `record.version` is the caller's expectation and a mismatch means a
    /// concurrent writer won, surfaced as a constraint error by the
    /// primary key.
    fn append(&self, record: &LifecycleRecord) -> Result<()> {
        let resources_json = serde_json::to_string(&record.resources)?;
        let cleanup_json = serde_json::to_string(&record.cleanup)?;
        self.store.with_tx(|tx| {
            let head: i64 = tx
                .query_row(
                    "SELECT last_version FROM lifecycle_head WHERE vm_id = ?1",
                    rusqlite::params![record.vm_id],
                    |row| row.get(0),
                )
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(0),
                    other => Err(other),
                })?;
            let next = head + 1;

            tx.execute(
                "INSERT INTO lifecycle
                     (vm_id, version, backend, phase, updated_at, last_error,
                      resources_json, cleanup_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.vm_id,
                    next,
                    record.backend,
                    record.phase.as_str(),
                    record.updated_at,
                    record.last_error,
                    resources_json,
                    cleanup_json,
                ],
            )?;
            tx.execute(
                "INSERT INTO lifecycle_head (vm_id, last_version) VALUES (?1, ?2)
                 ON CONFLICT(vm_id) DO UPDATE SET last_version = ?2",
                rusqlite::params![record.vm_id, next],
            )?;
            Ok(())
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LifecycleRecord> {
    let phase_str: String = row.get(3)?;
    let resources_json: String = row.get(6)?;
    let cleanup_json: String = row.get(7)?;
    Ok(LifecycleRecord {
        vm_id: row.get(0)?,
        version: row.get(1)?,
        backend: row.get(2)?,
        phase: phase_str.parse().unwrap_or(Phase::CleanupFailed),
        updated_at: row.get(4)?,
        last_error: row.get(5)?,
        resources: serde_json::from_str(&resources_json).unwrap_or_default(),
        cleanup: serde_json::from_str(&cleanup_json).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (LifecycleStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Store::open(&dir.path().join("state.db"), &LifecycleStore::migrations()).unwrap();
        (LifecycleStore::new(store), dir)
    }

    #[test]
    fn ensure_creates_version_one() {
        let (store, _dir) = open_store();
        let record = store.ensure("vm-a", "firecracker").unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.phase, Phase::Creating);
        assert_eq!(record.backend, "firecracker");

        // Idempotent: a second ensure returns the same head.
        let again = store.ensure("vm-a", "firecracker").unwrap();
        assert_eq!(again.version, 1);
    }

    #[test]
    fn transitions_append_monotone_versions() {
        let (store, _dir) = open_store();
        store.ensure("vm-a", "firecracker").unwrap();
        store.transition("vm-a", Phase::Created, None).unwrap();
        store.transition("vm-a", Phase::Starting, None).unwrap();
        let head = store.transition("vm-a", Phase::Running, None).unwrap();
        assert_eq!(head.version, 4);

        let history = store.history("vm-a").unwrap();
        let versions: Vec<i64> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
        assert_eq!(history.last().unwrap().phase, Phase::Running);
    }

    #[test]
    fn illegal_transition_is_rejected_and_not_persisted() {
        let (store, _dir) = open_store();
        store.ensure("vm-a", "firecracker").unwrap();
        match store.transition("vm-a", Phase::Running, None) {
            Err(Error::InvalidPhase { from, to }) => {
                assert_eq!(from, Phase::Creating);
                assert_eq!(to, Phase::Running);
            }
            other => panic!("expected InvalidPhase, got {:?}", other.map(|_| ())),
        }
        assert_eq!(store.latest("vm-a").unwrap().unwrap().version, 1);
    }

    #[test]
    fn transition_on_unknown_vm_fails() {
        let (store, _dir) = open_store();
        assert!(matches!(
            store.transition("vm-nope", Phase::Cleaning, None),
            Err(Error::VmNotFound(_))
        ));
    }

    #[test]
    fn resources_carry_forward_across_versions() {
        let (store, _dir) = open_store();
        store.ensure("vm-a", "firecracker").unwrap();
        store
            .update_resources("vm-a", |res| {
                res.tap_name = Some("fc-abcd1234".to_string());
                res.rootfs_path = Some("/var/lib/matchlock/vm-a/rootfs.ext4".to_string());
            })
            .unwrap();
        let head = store.transition("vm-a", Phase::Created, None).unwrap();
        assert_eq!(head.resources.tap_name.as_deref(), Some("fc-abcd1234"));
        assert_eq!(
            head.resources.rootfs_path.as_deref(),
            Some("/var/lib/matchlock/vm-a/rootfs.ext4")
        );
    }

    #[test]
    fn cleanup_map_accumulates() {
        let (store, _dir) = open_store();
        store.ensure("vm-a", "firecracker").unwrap();
        store.transition("vm-a", Phase::Cleaning, None).unwrap();
        store
            .record_cleanup("vm-a", "subnet_release", CleanupEntry::ok())
            .unwrap();
        store
            .record_cleanup("vm-a", "tap_delete:fc-abcd1234", CleanupEntry::error("EPERM"))
            .unwrap();

        let head = store.latest("vm-a").unwrap().unwrap();
        assert_eq!(head.cleanup.len(), 2);
        assert_eq!(
            head.cleanup["subnet_release"].status,
            CleanupStatus::Ok
        );
        assert_eq!(
            head.cleanup["tap_delete:fc-abcd1234"].status,
            CleanupStatus::Error
        );
        assert_eq!(
            head.cleanup["tap_delete:fc-abcd1234"].error.as_deref(),
            Some("EPERM")
        );
    }

    #[test]
    fn last_error_is_recorded() {
        let (store, _dir) = open_store();
        store.ensure("vm-a", "firecracker").unwrap();
        let head = store
            .transition("vm-a", Phase::CreateFailed, Some("tap create failed"))
            .unwrap();
        assert_eq!(head.phase, Phase::CreateFailed);
        assert_eq!(head.last_error.as_deref(), Some("tap create failed"));
    }

    #[test]
    fn every_phase_reaches_cleaning() {
        let (store, _dir) = open_store();
        store.ensure("vm-a", "firecracker").unwrap();
        store
            .transition("vm-a", Phase::CreateFailed, Some("boom"))
            .unwrap();
        // Even a terminal failure state may enter cleaning directly.
        let head = store.transition("vm-a", Phase::Cleaning, None).unwrap();
        assert_eq!(head.phase, Phase::Cleaning);
    }

    #[test]
    fn delete_removes_history_and_head() {
        let (store, _dir) = open_store();
        store.ensure("vm-a", "firecracker").unwrap();
        store.transition("vm-a", Phase::Cleaning, None).unwrap();
        store.delete("vm-a").unwrap();
        assert!(store.latest("vm-a").unwrap().is_none());
        assert!(store.history("vm-a").unwrap().is_empty());
    }

    #[test]
    fn histories_are_per_vm() {
        let (store, _dir) = open_store();
        store.ensure("vm-a", "firecracker").unwrap();
        store.ensure("vm-b", "firecracker").unwrap();
        store.transition("vm-a", Phase::Created, None).unwrap();

        assert_eq!(store.latest("vm-a").unwrap().unwrap().version, 2);
        assert_eq!(store.latest("vm-b").unwrap().unwrap().version, 1);
    }
}
