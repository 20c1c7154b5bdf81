//! Persisted VM records: hypervisor PID, status, image, config blob.
//!
//! The status a reader observes is either `running` with a live
//! signallable PID, or it is rewritten to `crashed` lazily when the reader
//! finds a dead PID. Downgrade writes are issued only after the read
//! cursor has been fully drained, so a store that serialises writers
//! behind live readers cannot deadlock.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Migration, Store};
use crate::error::{Error, Result};
use crate::id::now_rfc3339;

/// Status of a registered VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    Crashed,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Crashed => "crashed",
        }
    }
}

impl std::str::FromStr for VmStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(VmStatus::Running),
            "stopped" => Ok(VmStatus::Stopped),
            "crashed" => Ok(VmStatus::Crashed),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the VM table.
#[derive(Debug, Clone)]
pub struct VmRecord {
    pub id: String,
    /// Hypervisor PID; 0 when not running.
    pub pid: i64,
    pub status: VmStatus,
    pub image: String,
    /// Opaque configuration blob.
    pub config: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct VmStore {
    store: Store,
}

impl VmStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn migrations() -> Vec<Migration> {
        vec![Migration {
            module: "vm",
            version: 1,
            sql: "CREATE TABLE vms (
                      id          TEXT PRIMARY KEY,
                      pid         INTEGER NOT NULL DEFAULT 0,
                      status      TEXT    NOT NULL,
                      image       TEXT    NOT NULL,
                      config_json TEXT    NOT NULL,
                      created_at  TEXT    NOT NULL,
                      updated_at  TEXT    NOT NULL
                  );",
        }]
    }

    /// Register a VM on first creation.
    pub fn register(
        &self,
        id: &str,
        pid: i64,
        image: &str,
        config: &serde_json::Value,
    ) -> Result<VmRecord> {
        let now = now_rfc3339();
        let status = if pid > 0 {
            VmStatus::Running
        } else {
            VmStatus::Stopped
        };
        let config_json = serde_json::to_string(config)?;
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO vms (id, pid, status, image, config_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![id, pid, status.as_str(), image, config_json, now],
            )?;
            Ok(())
        })?;
        Ok(VmRecord {
            id: id.to_string(),
            pid,
            status,
            image: image.to_string(),
            config: config.clone(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Record a clean shutdown: status `stopped`, PID cleared.
    pub fn unregister(&self, id: &str) -> Result<()> {
        self.set_status(id, VmStatus::Stopped, 0)
    }

    /// Update the hypervisor PID (marks the VM running when nonzero).
    pub fn set_pid(&self, id: &str, pid: i64) -> Result<()> {
        let status = if pid > 0 {
            VmStatus::Running
        } else {
            VmStatus::Stopped
        };
        self.set_status(id, status, pid)
    }

    fn set_status(&self, id: &str, status: VmStatus, pid: i64) -> Result<()> {
        let now = now_rfc3339();
        let updated = self.store.with_tx(|tx| {
            tx.execute(
                "UPDATE vms SET status = ?1, pid = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![status.as_str(), pid, now, id],
            )
        })?;
        if updated == 0 {
            return Err(Error::VmNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Fetch one VM, lazily downgrading a dead `running` row to `crashed`.
    pub fn get(&self, id: &str) -> Result<Option<VmRecord>> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT id, pid, status, image, config_json, created_at, updated_at
                 FROM vms WHERE id = ?1",
                rusqlite::params![id],
                row_to_record,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;

        let Some(mut record) = row else {
            return Ok(None);
        };
        if self.downgrade_if_dead(&mut record)? {
            info!(vm_id = %record.id, "marked crashed (dead pid observed)");
        }
        Ok(Some(record))
    }

    /// List every VM, lazily downgrading dead `running` rows.
    ///
    /// The crash writes happen strictly after the read query has returned
    /// all rows.
    pub fn list(&self) -> Result<Vec<VmRecord>> {
        let mut records = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, pid, status, image, config_json, created_at, updated_at
                 FROM vms ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], row_to_record)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        for record in records.iter_mut() {
            if self.downgrade_if_dead(record)? {
                info!(vm_id = %record.id, "marked crashed (dead pid observed)");
            }
        }
        Ok(records)
    }

    /// Delete the row. Only called after the reconciler has released the
    /// VM's host resources.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let deleted = self
            .store
            .with_tx(|tx| tx.execute("DELETE FROM vms WHERE id = ?1", rusqlite::params![id]))?;
        Ok(deleted > 0)
    }

    fn downgrade_if_dead(&self, record: &mut VmRecord) -> Result<bool> {
        if record.status != VmStatus::Running || pid_alive(record.pid) {
            return Ok(false);
        }
        let now = now_rfc3339();
        self.store.with_tx(|tx| {
            tx.execute(
                "UPDATE vms SET status = 'crashed', pid = 0, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, record.id],
            )
        })?;
        record.status = VmStatus::Crashed;
        record.pid = 0;
        record.updated_at = now;
        Ok(true)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<VmRecord> {
    let status_str: String = row.get(2)?;
    let config_json: String = row.get(4)?;
    Ok(VmRecord {
        id: row.get(0)?,
        pid: row.get(1)?,
        status: status_str.parse().unwrap_or(VmStatus::Crashed),
        image: row.get(3)?,
        config: serde_json::from_str(&config_json).unwrap_or(serde_json::Value::Null),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Probe with signal 0. ESRCH means dead; EPERM means alive but owned by
/// someone else.
pub fn pid_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (VmStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.db"), &VmStore::migrations()).unwrap();
        (VmStore::new(store), dir)
    }

    #[test]
    fn register_and_get() {
        let (store, _dir) = open_store();
        let config = serde_json::json!({"memory_mib": 512});
        store
            .register("vm-abcd1234", 0, "alpine:3.20", &config)
            .unwrap();

        let record = store.get("vm-abcd1234").unwrap().unwrap();
        assert_eq!(record.status, VmStatus::Stopped);
        assert_eq!(record.image, "alpine:3.20");
        assert_eq!(record.config["memory_mib"], 512);
        assert!(record.created_at.ends_with('Z'));
    }

    #[test]
    fn get_missing_returns_none() {
        let (store, _dir) = open_store();
        assert!(store.get("vm-missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_register_fails() {
        let (store, _dir) = open_store();
        let config = serde_json::Value::Null;
        store.register("vm-dup", 0, "img", &config).unwrap();
        assert!(store.register("vm-dup", 0, "img", &config).is_err());
    }

    #[test]
    fn running_with_live_pid_stays_running() {
        let (store, _dir) = open_store();
        let my_pid = std::process::id() as i64;
        store
            .register("vm-live", my_pid, "img", &serde_json::Value::Null)
            .unwrap();

        let record = store.get("vm-live").unwrap().unwrap();
        assert_eq!(record.status, VmStatus::Running);
        assert_eq!(record.pid, my_pid);
    }

    #[test]
    fn dead_pid_downgrades_to_crashed() {
        let (store, _dir) = open_store();
        // A PID far above pid_max cannot be alive.
        store
            .register("vm-dead", i32::MAX as i64 - 1, "img", &serde_json::Value::Null)
            .unwrap();

        let record = store.get("vm-dead").unwrap().unwrap();
        assert_eq!(record.status, VmStatus::Crashed);
        assert_eq!(record.pid, 0);

        // The downgrade is persisted, not just reported.
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, VmStatus::Crashed);
    }

    #[test]
    fn unregister_marks_stopped() {
        let (store, _dir) = open_store();
        let my_pid = std::process::id() as i64;
        store
            .register("vm-x", my_pid, "img", &serde_json::Value::Null)
            .unwrap();
        store.unregister("vm-x").unwrap();

        let record = store.get("vm-x").unwrap().unwrap();
        assert_eq!(record.status, VmStatus::Stopped);
        assert_eq!(record.pid, 0);
    }

    #[test]
    fn unregister_unknown_is_an_error() {
        let (store, _dir) = open_store();
        match store.unregister("vm-nope") {
            Err(Error::VmNotFound(id)) => assert_eq!(id, "vm-nope"),
            other => panic!("expected VmNotFound, got {:?}", other),
        }
    }

    #[test]
    fn remove_deletes_row() {
        let (store, _dir) = open_store();
        store
            .register("vm-rm", 0, "img", &serde_json::Value::Null)
            .unwrap();
        assert!(store.remove("vm-rm").unwrap());
        assert!(!store.remove("vm-rm").unwrap());
        assert!(store.get("vm-rm").unwrap().is_none());
    }

    #[test]
    fn list_orders_by_creation() {
        let (store, _dir) = open_store();
        for id in ["vm-a", "vm-b", "vm-c"] {
            store.register(id, 0, "img", &serde_json::Value::Null).unwrap();
        }
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["vm-a", "vm-b", "vm-c"]);
    }

    #[test]
    fn pid_probe() {
        assert!(pid_alive(std::process::id() as i64));
        assert!(!pid_alive(0));
        assert!(!pid_alive(-1));
        assert!(!pid_alive(i32::MAX as i64 - 1));
    }
}
