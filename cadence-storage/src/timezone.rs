//! Timezone change guard.
//!
//! Intervals are cut on local dates and journal facts sit at local midnight,
//! so both are wrong after the local zone changes. The zone name in use is
//! persisted as a constant and compared on startup.

use crate::session::Registry;
use cadence_core::{CadenceResult, FactUpdate, SourceKind, SourceType};

/// Constant key holding the zone name the store was last computed in.
pub const TIMEZONE_CONSTANT: &str = "timezone";

impl Registry {
    /// Compare the configured zone with the persisted one.
    ///
    /// On first use the name is recorded. On a change, journal facts are
    /// re-timed to local midnight in the new zone, every interval is deleted
    /// and the new name recorded, all in one transaction. Returns true if a
    /// change was handled.
    pub fn check_timezone(&self) -> CadenceResult<bool> {
        let current = self.zone().name().to_string();
        let stored = self.store().constant_get(TIMEZONE_CONSTANT)?;

        match stored {
            Some(previous) if previous == current => Ok(false),
            None => {
                tracing::info!(timezone = %current, "Recording timezone");
                let mut txn = self.begin();
                txn.set_constant(TIMEZONE_CONSTANT, current);
                txn.commit()?;
                Ok(false)
            }
            Some(previous) => {
                tracing::warn!(
                    previous = %previous,
                    current = %current,
                    "Timezone changed; rebuilding journal times and dropping intervals"
                );
                self.rebuild_for_zone(current)?;
                Ok(true)
            }
        }
    }

    fn rebuild_for_zone(&self, name: String) -> CadenceResult<()> {
        let store = self.store();
        let zone = self.zone();
        let mut txn = self.begin();

        let mut retimed = 0usize;
        for source in store.sources_by_type(SourceType::Journal)? {
            let SourceKind::Journal { date } = source.kind else {
                continue;
            };
            let midnight = zone.local_date_to_time(date);
            for fact in store.facts_by_source(source.source_id)? {
                if fact.time.is_some() && fact.time != Some(midnight) {
                    txn.update_fact(
                        fact.fact_id,
                        FactUpdate {
                            time: Some(Some(midnight)),
                            ..Default::default()
                        },
                    );
                    retimed += 1;
                }
            }
        }

        for record in store.all_intervals()? {
            txn.delete_source(record.source_id);
        }
        txn.set_constant(TIMEZONE_CONSTANT, name);

        let report = txn.commit()?;
        tracing::info!(
            retimed,
            intervals_deleted = report.intervals_deleted,
            "Timezone change applied"
        );
        Ok(())
    }
}
