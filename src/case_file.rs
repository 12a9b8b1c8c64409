//! Case File (§4.5): the central per-vdev fault-tracking state machine.
//!
//! A Case File is born in state *Watching* and stays there for its
//! whole life — there is no further named state beyond that; what
//! changes is its `events`/`tentative_events` buckets and the last
//! observed vdev state, until the case is solved and the registry
//! removes it (`Close`).

use crate::error::PersistError;
use crate::event::{Classification, Event};
use crate::persist;
use crate::pool_view::{Aux, DevType, OnlineFlags, PoolHandle, PoolView};
use crate::timer::{CaseId, TimerWheel};
use crate::types::{Guid, VdevState};
use std::path::Path;
use std::time::Duration;

/// Bundles the collaborators a Case File needs to act, so dispatch
/// methods take one reference instead of a long parameter list. None of
/// these are stored on the `CaseFile` itself (§5: no back-references,
/// no locks).
pub struct Ctx<'a> {
    pub pool: &'a mut dyn PoolView,
    pub timers: &'a mut TimerWheel,
    pub case_dir: &'a Path,
    pub grace: Duration,
    pub degrade_io_count: usize,
}

/// Result of dispatching one event or arrival to a Case File.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub consumed: bool,
    pub closed: bool,
    pub rescan_requested: bool,
}

#[derive(Debug, Clone)]
pub struct CaseFile {
    pool_guid: Guid,
    vdev_guid: Guid,
    vdev_state: VdevState,
    phys_path: String,
    events: Vec<Event>,
    tentative_events: Vec<Event>,
}

impl CaseFile {
    pub fn new(pool_guid: Guid, vdev_guid: Guid, vdev_state: VdevState, phys_path: String) -> Self {
        Self {
            pool_guid,
            vdev_guid,
            vdev_state,
            phys_path,
            events: vec![],
            tentative_events: vec![],
        }
    }

    pub fn pool_guid(&self) -> Guid {
        self.pool_guid
    }

    pub fn vdev_guid(&self) -> Guid {
        self.vdev_guid
    }

    pub fn phys_path(&self) -> &str {
        &self.phys_path
    }

    pub fn vdev_state(&self) -> VdevState {
        self.vdev_state
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn tentative_events(&self) -> &[Event] {
        &self.tentative_events
    }

    pub fn id(&self) -> CaseId {
        CaseId(self.pool_guid, self.vdev_guid)
    }

    /// Invariant 2 support: whether this case still carries history
    /// worth preserving even if the vdev has since become healthy.
    pub fn has_history(&self) -> bool {
        !self.events.is_empty() || !self.tentative_events.is_empty()
    }

    /// Append a previously-parsed event straight into a bucket, used
    /// when reloading from disk (§4.6 step 5) without re-running the
    /// grace/classification logic a live dispatch would apply.
    pub(crate) fn push_committed(&mut self, ev: Event) {
        self.events.push(ev);
    }

    pub(crate) fn push_tentative(&mut self, ev: Event) {
        self.tentative_events.push(ev);
    }

    fn persist(&self, dir: &Path) -> Result<(), PersistError> {
        persist::serialize(dir, self.pool_guid, self.vdev_guid, &self.events, &self.tentative_events)
    }

    /// Refresh `vdev_state`/`phys_path` from the Pool View. Returns the
    /// pool handle if the pool and vdev are still present.
    fn refresh(&mut self, pool: &dyn PoolView) -> Option<PoolHandle> {
        let handle = pool.pool_by_guid(self.pool_guid)?;
        let vdev = pool.find_vdev(handle, self.vdev_guid)?;
        self.vdev_state = vdev.state;
        self.phys_path = vdev.phys_path;
        Some(handle)
    }

    /// `reevaluate(event)` (§4.5).
    pub fn reevaluate(&mut self, event: &Event, ctx: &mut Ctx) -> Outcome {
        let handle = match self.refresh(ctx.pool) {
            Some(h) => h,
            None => {
                self.close(ctx);
                return Outcome {
                    consumed: false,
                    closed: true,
                    ..Default::default()
                };
            }
        };

        match event.classify() {
            Classification::VdevRemoved => {
                self.close(ctx);
                Outcome {
                    consumed: true,
                    closed: true,
                    ..Default::default()
                }
            }
            Classification::DeviceGone => {
                self.tentative_events.clear();
                ctx.timers.stop(self.id());
                let consumed = self.activate_spare(handle, ctx);
                let closed = self.close_if_solved(ctx);
                Outcome {
                    consumed: consumed || closed,
                    closed,
                    rescan_requested: true,
                }
            }
            Classification::SoftError => {
                self.tentative_events.push(event.clone());
                self.arm_or_tighten(event, ctx);
                let closed = self.close_if_solved(ctx);
                Outcome {
                    consumed: true,
                    closed,
                    ..Default::default()
                }
            }
            Classification::Ignored => {
                let closed = self.close_if_solved(ctx);
                Outcome {
                    consumed: closed,
                    closed,
                    ..Default::default()
                }
            }
        }
    }

    /// The disk-arrival path (§4.5): `reevaluate(dev_path, phys_path,
    /// new_vdev)`. `new_vdev` is `Some((pool_guid, vdev_guid))` when the
    /// arriving disk is known to belong to a freshly-created vdev.
    pub fn reevaluate_arrival(
        &mut self,
        dev_path: &str,
        phys_path: &str,
        new_vdev: Option<(Guid, Guid)>,
        ctx: &mut Ctx,
    ) -> Outcome {
        let handle = match self.refresh(ctx.pool) {
            Some(h) => h,
            None => {
                self.close(ctx);
                return Outcome {
                    consumed: false,
                    closed: true,
                    ..Default::default()
                };
            }
        };

        if self.vdev_state.present_but_unhealthy() {
            return Outcome::default();
        }

        if new_vdev == Some((self.pool_guid, self.vdev_guid)) {
            let _ = ctx.pool.online(handle, self.vdev_guid, OnlineFlags::check_remove_unspare());
            let closed = self.close_if_solved(ctx);
            return Outcome {
                consumed: true,
                closed,
                ..Default::default()
            };
        }

        if ctx.pool.get_prop_int(handle, crate::pool_view::PROP_AUTOREPLACE) != Some(1) {
            return Outcome::default();
        }
        if phys_path.is_empty() || phys_path != self.phys_path {
            return Outcome::default();
        }
        if ctx.pool.label_disk(handle, dev_path).is_err() {
            return Outcome::default();
        }
        let consumed = self.replace(handle, DevType::Disk, dev_path, ctx);
        Outcome {
            consumed,
            ..Default::default()
        }
    }

    /// ActivateSpare (§4.5.1).
    fn activate_spare(&mut self, handle: PoolHandle, ctx: &mut Ctx) -> bool {
        let spares = ctx.pool.spares(handle);
        let eligible = spares
            .into_iter()
            .find(|s| s.state == VdevState::Healthy && s.aux != Aux::Spared);
        match eligible {
            Some(spare) => {
                let path = spare.path.clone();
                self.replace(handle, spare.dev_type, &path, ctx)
            }
            None => false,
        }
    }

    /// Grace-period coalescing (§4.5.2). `GRACE` is `ctx.grace`; the
    /// deadline is measured from the *first* event in the burst, never
    /// extended by later arrivals.
    fn arm_or_tighten(&mut self, event: &Event, ctx: &mut Ctx) {
        let now = crate::event::unix_now();
        let event_ts = event.timestamp().unwrap_or(now);
        let elapsed = now.saturating_sub(event_ts);
        let countdown = ctx
            .grace
            .checked_sub(Duration::from_secs(elapsed))
            .unwrap_or(Duration::from_micros(1))
            .max(Duration::from_micros(1));

        let id = self.id();
        if !ctx.timers.is_pending(id) {
            ctx.timers.reset(id, countdown);
        } else if let Some(remaining) = ctx.timers.get(id).time_remaining() {
            if countdown < remaining {
                ctx.timers.reset(id, countdown);
            }
        }
    }

    /// `on_grace_expired` (§4.5.3), invoked by the event loop once the
    /// timer wheel reports this case's id as due.
    pub fn on_grace_expired(&mut self, ctx: &mut Ctx) -> Outcome {
        let mut spliced = std::mem::take(&mut self.tentative_events);
        spliced.append(&mut self.events);
        self.events = spliced;

        if self.events.len() > ctx.degrade_io_count {
            let handle = match self.refresh(ctx.pool) {
                Some(h) => h,
                None => {
                    self.close(ctx);
                    return Outcome {
                        closed: true,
                        ..Default::default()
                    };
                }
            };
            match ctx.pool.degrade(handle, self.vdev_guid, Aux::ErrExceeded) {
                Ok(()) => {
                    self.close(ctx);
                    return Outcome {
                        closed: true,
                        ..Default::default()
                    };
                }
                Err(e) => {
                    tracing::error!(
                        pool_guid = %self.pool_guid,
                        vdev_guid = %self.vdev_guid,
                        error = %e,
                        "degrade() failed, leaving case open for retry"
                    );
                }
            }
        }

        if let Err(e) = self.persist(ctx.case_dir) {
            tracing::error!(error = %e, "failed to persist case file");
        }
        Outcome::default()
    }

    /// CloseIfSolved (§4.5.4).
    fn close_if_solved(&mut self, ctx: &mut Ctx) -> bool {
        if !self.events.is_empty() || !self.tentative_events.is_empty() {
            return false;
        }
        if self.vdev_state.present_but_unhealthy() {
            self.close(ctx);
            true
        } else {
            if let Err(e) = self.persist(ctx.case_dir) {
                tracing::error!(error = %e, "failed to clear stale case file");
            }
            false
        }
    }

    /// Replace (§4.5.5). Builds a single-child root config and invokes
    /// `attach(..., replace=true)`. Preserves the source's "returns true
    /// on a well-formed attempt" convention even when the underlying
    /// attach call itself fails (SPEC_FULL §9) — only a failure to
    /// construct the replacement config, which cannot occur in this
    /// implementation, would return `false`.
    fn replace(&mut self, handle: PoolHandle, dev_type: DevType, path: &str, ctx: &mut Ctx) -> bool {
        match ctx.pool.attach(handle, self.vdev_guid, path, dev_type, true) {
            Ok(()) => {
                tracing::info!(vdev_guid = %self.vdev_guid, path, "replacement attached");
            }
            Err(e) => {
                tracing::error!(vdev_guid = %self.vdev_guid, path, error = %e, "attach failed");
            }
        }
        true
    }

    /// Close (§4.5.6): purge events, serialise (unlinking the now-empty
    /// file), stop the timer, and leave the case ready for the registry
    /// to drop from its map.
    pub fn close(&mut self, ctx: &mut Ctx) {
        self.events.clear();
        self.tentative_events.clear();
        if let Err(e) = self.persist(ctx.case_dir) {
            tracing::error!(error = %e, "failed to unlink case file on close");
        }
        ctx.timers.stop(self.id());
    }
}
