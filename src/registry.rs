//! Case Registry (§4.6): the process-wide, insertion-ordered set of
//! live Case Files. Owns every `CaseFile` exclusively and hands out
//! lookups by `(pool_guid, vdev_guid)` or by physical path — no raw
//! pointers, no self-deregistering destructors (SPEC_FULL §9): Close is
//! expressed as a registry method that removes its own entry, not as
//! the Case File destroying itself.

use crate::case_file::{CaseFile, Ctx};
use crate::error::PersistError;
use crate::persist;
use crate::pool_view::PoolView;
use crate::timer::TimerWheel;
use crate::types::Guid;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key(Guid, Guid);

#[derive(Default)]
pub struct CaseRegistry {
    cases: IndexMap<Key, CaseFile>,
}

impl CaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn find(&self, pool_guid: Guid, vdev_guid: Guid) -> Option<&CaseFile> {
        self.cases.get(&Key(pool_guid, vdev_guid))
    }

    pub fn find_mut(&mut self, pool_guid: Guid, vdev_guid: Guid) -> Option<&mut CaseFile> {
        self.cases.get_mut(&Key(pool_guid, vdev_guid))
    }

    /// Lookup by last-observed physical path, used by the disk-arrival
    /// path to find a case that might match a newly inserted disk's
    /// slot.
    pub fn find_by_phys_path(&mut self, phys_path: &str) -> Option<&mut CaseFile> {
        self.cases.values_mut().find(|c| c.phys_path() == phys_path)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CaseFile> {
        self.cases.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CaseFile> {
        self.cases.values()
    }

    /// `create_if_missing`: insert a fresh Case File for
    /// `(pool_guid, vdev_guid)` if none exists yet, returning the
    /// (possibly pre-existing) entry.
    pub fn create_if_missing(
        &mut self,
        pool_guid: Guid,
        vdev_guid: Guid,
        vdev_state: crate::types::VdevState,
        phys_path: String,
    ) -> &mut CaseFile {
        self.cases
            .entry(Key(pool_guid, vdev_guid))
            .or_insert_with(|| CaseFile::new(pool_guid, vdev_guid, vdev_state, phys_path))
    }

    /// Remove a case from the registry. Expects the caller to have
    /// already called `CaseFile::close` (which purges events, persists
    /// the now-empty file, and stops the timer) before dropping it.
    fn remove(&mut self, pool_guid: Guid, vdev_guid: Guid) {
        self.cases.remove(&Key(pool_guid, vdev_guid));
    }

    /// Close and remove a case in one step.
    pub fn close(&mut self, pool_guid: Guid, vdev_guid: Guid, ctx: &mut Ctx) {
        if let Some(case) = self.cases.get_mut(&Key(pool_guid, vdev_guid)) {
            case.close(ctx);
        }
        self.remove(pool_guid, vdev_guid);
    }

    /// Drop a case without serialising/unlinking it — used only when a
    /// newly allocated case must be discarded because its persisted
    /// source turned out to be unusable (§4.6 step 6); an *existing*
    /// case is never dropped this way.
    fn drop_silently(&mut self, pool_guid: Guid, vdev_guid: Guid) {
        self.remove(pool_guid, vdev_guid);
    }

    /// Remove a case that has already closed itself (a dispatch method
    /// returning `Outcome { closed: true, .. }` has already cleared and
    /// persisted it) — drops the map entry without calling
    /// `CaseFile::close` a second time.
    pub fn forget(&mut self, pool_guid: Guid, vdev_guid: Guid) {
        self.remove(pool_guid, vdev_guid);
    }

    pub fn log_all(&self) {
        tracing::info!(count = self.cases.len(), "case registry dump requested");
        for case in self.cases.values() {
            tracing::info!(
                pool_guid = %case.pool_guid(),
                vdev_guid = %case.vdev_guid(),
                vdev_state = %case.vdev_state(),
                phys_path = case.phys_path(),
                events = case.events().len(),
                tentative = case.tentative_events().len(),
                "case"
            );
        }
    }

    /// `purge_all` (§4.6): serialise every live case then tear it down.
    /// Used at reconnect to force re-synchronisation from persisted
    /// state and current pool topology rather than trusting in-memory
    /// state built from a possibly-gapped event stream.
    pub fn purge_all(&mut self, case_dir: &Path, timers: &mut TimerWheel) {
        let keys: Vec<Key> = self.cases.keys().copied().collect();
        for key in keys {
            if let Some(case) = self.cases.get_mut(&key) {
                // purge_all tears cases down unconditionally; it does not
                // run CloseIfSolved's health check, it just persists
                // current state and drops the in-memory entry.
                if let Err(e) = persist::serialize(
                    case_dir,
                    case.pool_guid(),
                    case.vdev_guid(),
                    case.events(),
                    case.tentative_events(),
                ) {
                    tracing::error!(error = %e, "failed to persist case during purge");
                }
                timers.stop(case.id());
            }
            self.cases.remove(&key);
        }
    }

    /// `load_from_disk` (§4.6).
    pub fn load_from_disk(
        &mut self,
        case_dir: &Path,
        pool: &mut dyn PoolView,
        timers: &mut TimerWheel,
        grace: Duration,
    ) -> Result<(), PersistError> {
        for (pool_guid, vdev_guid, path) in persist::list_case_files(case_dir)? {
            self.load_one(case_dir, &path, pool_guid, vdev_guid, pool, timers, grace);
        }
        Ok(())
    }

    fn load_one(
        &mut self,
        case_dir: &Path,
        path: &Path,
        pool_guid: Guid,
        vdev_guid: Guid,
        pool: &mut dyn PoolView,
        timers: &mut TimerWheel,
        grace: Duration,
    ) {
        let existing = self.cases.contains_key(&Key(pool_guid, vdev_guid));

        if existing {
            let state = self.cases[&Key(pool_guid, vdev_guid)].vdev_state();
            if state.present_but_unhealthy() {
                // already degraded/faulted/healthy: the persisted history
                // is no longer useful against the live case.
                let _ = persist::unlink_if_present(path);
                return;
            }
        } else {
            let handle = match pool.pool_by_guid(pool_guid) {
                Some(h) => h,
                None => {
                    let _ = persist::unlink_if_present(path);
                    return;
                }
            };
            let vdev = match pool.find_vdev(handle, vdev_guid) {
                Some(v) => v,
                None => {
                    let _ = persist::unlink_if_present(path);
                    return;
                }
            };
            self.cases.insert(
                Key(pool_guid, vdev_guid),
                CaseFile::new(pool_guid, vdev_guid, vdev.state, vdev.phys_path),
            );
        }

        let lines = match persist::read_lines(path) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read case file, discarding");
                if !existing {
                    self.drop_silently(pool_guid, vdev_guid);
                }
                let _ = persist::unlink_if_present(path);
                return;
            }
        };

        let case = self.cases.get_mut(&Key(pool_guid, vdev_guid)).expect("just inserted or pre-existing");
        for tagged in &lines {
            match crate::event::parse(&tagged.line, crate::event::unix_now) {
                Ok(ev) => {
                    if tagged.tentative {
                        let ts = ev.timestamp().unwrap_or_else(crate::event::unix_now);
                        case.push_tentative(ev);
                        arm_from_timestamp(case.id(), ts, grace, timers);
                    } else {
                        case.push_committed(ev);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "malformed line in case file, discarding case");
                    if !existing {
                        self.drop_silently(pool_guid, vdev_guid);
                    }
                    let _ = persist::unlink_if_present(path);
                    return;
                }
            }
        }
    }
}

fn arm_from_timestamp(id: crate::timer::CaseId, event_ts: u64, grace: Duration, timers: &mut TimerWheel) {
    let now = crate::event::unix_now();
    let elapsed = now.saturating_sub(event_ts);
    let countdown = grace
        .checked_sub(Duration::from_secs(elapsed))
        .unwrap_or(Duration::from_micros(1))
        .max(Duration::from_micros(1));
    if !timers.is_pending(id) {
        timers.reset(id, countdown);
    } else if let Some(remaining) = timers.get(id).time_remaining() {
        if countdown < remaining {
            timers.reset(id, countdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool_view::mock::{MockPool, MockPoolView};
    use crate::types::VdevState;

    fn pool_with(pool_guid: u64, vdev_guid: u64, state: VdevState) -> MockPoolView {
        let mut mock = MockPoolView::new();
        mock.add_pool(MockPool {
            guid: Guid(pool_guid),
            vdevs: vec![crate::pool_view::VdevConfig {
                guid: Guid(vdev_guid),
                state,
                phys_path: "a/b".into(),
            }],
            spares: vec![],
            autoreplace: 0,
        });
        mock
    }

    #[test]
    fn restart_reconciliation_reloads_committed_and_tentative_split() {
        let dir = tempfile::tempdir().unwrap();
        let committed =
            "!class=a pool_guid=1 vdev_guid=2 timestamp=1\n!class=a pool_guid=1 vdev_guid=2 timestamp=2\n!class=a pool_guid=1 vdev_guid=2 timestamp=3\n";
        let tentative = format!(
            "tentative !class=b pool_guid=1 vdev_guid=2 timestamp={now}\ntentative !class=b pool_guid=1 vdev_guid=2 timestamp={now}\n",
            now = crate::event::unix_now()
        );
        std::fs::write(
            persist::file_path(dir.path(), Guid(1), Guid(2)),
            format!("{}{}", committed, tentative),
        )
        .unwrap();

        let mut pool = pool_with(1, 2, VdevState::CantOpen);
        let mut timers = TimerWheel::new();
        let mut registry = CaseRegistry::new();
        registry
            .load_from_disk(dir.path(), &mut pool, &mut timers, Duration::from_secs(60))
            .unwrap();

        let case = registry.find(Guid(1), Guid(2)).unwrap();
        assert_eq!(case.events().len(), 3);
        assert_eq!(case.tentative_events().len(), 2);
        assert!(timers.is_pending(case.id()));
    }

    #[test]
    fn stale_case_with_no_pool_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            persist::file_path(dir.path(), Guid(1), Guid(2)),
            "!class=a pool_guid=1 vdev_guid=2 timestamp=1\n",
        )
        .unwrap();

        let mut pool = MockPoolView::new();
        let mut timers = TimerWheel::new();
        let mut registry = CaseRegistry::new();
        registry
            .load_from_disk(dir.path(), &mut pool, &mut timers, Duration::from_secs(60))
            .unwrap();

        assert!(registry.is_empty());
        assert!(!persist::file_path(dir.path(), Guid(1), Guid(2)).exists());
    }

    #[test]
    fn existing_live_case_already_degraded_discards_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            persist::file_path(dir.path(), Guid(1), Guid(2)),
            "!class=a pool_guid=1 vdev_guid=2 timestamp=1\n",
        )
        .unwrap();

        let mut pool = pool_with(1, 2, VdevState::Degraded);
        let mut timers = TimerWheel::new();
        let mut registry = CaseRegistry::new();
        registry.create_if_missing(Guid(1), Guid(2), VdevState::Degraded, "a/b".into());

        registry
            .load_from_disk(dir.path(), &mut pool, &mut timers, Duration::from_secs(60))
            .unwrap();

        assert!(registry.find(Guid(1), Guid(2)).unwrap().events().is_empty());
        assert!(!persist::file_path(dir.path(), Guid(1), Guid(2)).exists());
    }
}
