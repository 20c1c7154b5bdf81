//! Linux platform cleanup: TAP interfaces and nftables tables.

use tracing::debug;

use super::{firewall_candidates, tap_candidates, CleanupReport, Platform};
use crate::net::{firewall, tap};
use crate::store::lifecycle::LifecycleRecord;

pub struct LinuxPlatform;

impl Platform for LinuxPlatform {
    fn reconcile(&self, record: &LifecycleRecord, report: &mut CleanupReport) {
        let taps = tap_candidates(&record.vm_id, record);

        for name in &taps {
            let step = format!("tap_delete:{}", name);
            if !tap::exists(name) {
                debug!(tap = %name, "tap absent, nothing to delete");
                report.record_ok(step);
                continue;
            }
            match tap::delete(name) {
                Ok(()) => report.record_ok(step),
                Err(e) => report.record_error(step, e.to_string()),
            }
        }

        for table in firewall_candidates(record, &taps) {
            let step = format!("fw_delete:{}", table);
            // Missing tables and missing permissions are both skips.
            match firewall::delete_table(&table) {
                Ok(_) => report.record_ok(step),
                Err(e) => report.record_error(step, e.to_string()),
            }
        }
    }
}
