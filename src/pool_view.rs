//! Pool View (§4.3): a read-only façade over the pool-management
//! library, plus the handful of administrative actions the Case Engine
//! invokes. This is the only interface the Case Engine uses to talk to
//! pools/vdevs/spares — real deployments back it with the native pool
//! library; tests back it with [`mock::MockPoolView`].

use crate::error::PoolLibError;
use crate::types::{Guid, VdevState};

/// Opaque handle to a pool, returned by [`PoolView::pool_by_guid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolHandle(pub Guid);

/// Read-only snapshot of one vdev's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdevConfig {
    pub guid: Guid,
    pub state: VdevState,
    pub phys_path: String,
}

/// Type of a replacement/spare device, used by `attach`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevType {
    Disk,
    File,
}

/// Auxiliary state recorded alongside a spare's health, mirroring the
/// pool library's notion of "this spare is already in use elsewhere".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aux {
    None,
    Spared,
    ErrExceeded,
}

/// A pool's configured spare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpareConfig {
    pub state: VdevState,
    pub aux: Aux,
    pub path: String,
    pub dev_type: DevType,
}

/// Flags accepted by [`PoolView::online`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OnlineFlags {
    pub check_remove: bool,
    pub unspare: bool,
}

impl OnlineFlags {
    pub const NONE: Self = Self {
        check_remove: false,
        unspare: false,
    };

    pub const fn check_remove_unspare() -> Self {
        Self {
            check_remove: true,
            unspare: true,
        }
    }
}

/// Well-known pool integer properties read via `get_prop_int`.
pub const PROP_AUTOREPLACE: &str = "autoreplace";

/// The only interfaces the Case Engine uses (§4.3). Implementations may
/// wrap a native pool library or, for tests, hold an in-memory model.
pub trait PoolView {
    fn pool_by_guid(&self, pool_guid: Guid) -> Option<PoolHandle>;

    fn vdevs(&self, pool: PoolHandle) -> Vec<VdevConfig>;

    fn find_vdev(&self, pool: PoolHandle, vdev_guid: Guid) -> Option<VdevConfig> {
        self.vdevs(pool).into_iter().find(|v| v.guid == vdev_guid)
    }

    fn spares(&self, pool: PoolHandle) -> Vec<SpareConfig>;

    fn get_prop_int(&self, pool: PoolHandle, prop: &str) -> Option<i64>;

    /// All pool GUIDs currently known, used by startup enumeration and
    /// Missed-Event Detection (§4.7).
    fn pool_guids(&self) -> Vec<Guid>;

    fn online(
        &mut self,
        pool: PoolHandle,
        vdev_guid: Guid,
        flags: OnlineFlags,
    ) -> Result<VdevState, PoolLibError>;

    fn degrade(&mut self, pool: PoolHandle, vdev_guid: Guid, aux: Aux) -> Result<(), PoolLibError>;

    fn attach(
        &mut self,
        pool: PoolHandle,
        from_vdev_guid: Guid,
        new_path: &str,
        dev_type: DevType,
        replace: bool,
    ) -> Result<(), PoolLibError>;

    fn label_disk(&mut self, pool: PoolHandle, dev_path: &str) -> Result<(), PoolLibError>;
}

/// In-memory test double standing in for the real pool library.
pub mod mock {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    pub struct MockPool {
        pub guid: Guid,
        pub vdevs: Vec<VdevConfig>,
        pub spares: Vec<SpareConfig>,
        pub autoreplace: i64,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Online {
            pool: Guid,
            vdev: Guid,
            flags: OnlineFlags,
        },
        Degrade {
            pool: Guid,
            vdev: Guid,
            aux: Aux,
        },
        Attach {
            pool: Guid,
            from: Guid,
            path: String,
            replace: bool,
        },
        Label {
            pool: Guid,
            path: String,
        },
    }

    /// Records every action invoked on it so tests can assert on the
    /// exact sequence of pool-library calls the Case Engine made.
    #[derive(Debug, Default)]
    pub struct MockPoolView {
        pub pools: HashMap<u64, MockPool>,
        pub calls: Vec<Call>,
        pub fail_degrade: bool,
        pub fail_attach: bool,
        pub fail_label: bool,
    }

    impl MockPoolView {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_pool(&mut self, pool: MockPool) {
            self.pools.insert(pool.guid.0, pool);
        }

        pub fn set_vdev_state(&mut self, pool_guid: Guid, vdev_guid: Guid, state: VdevState) {
            if let Some(p) = self.pools.get_mut(&pool_guid.0) {
                if let Some(v) = p.vdevs.iter_mut().find(|v| v.guid == vdev_guid) {
                    v.state = state;
                }
            }
        }
    }

    impl PoolView for MockPoolView {
        fn pool_by_guid(&self, pool_guid: Guid) -> Option<PoolHandle> {
            self.pools.get(&pool_guid.0).map(|p| PoolHandle(p.guid))
        }

        fn vdevs(&self, pool: PoolHandle) -> Vec<VdevConfig> {
            self.pools
                .get(&pool.0 .0)
                .map(|p| p.vdevs.clone())
                .unwrap_or_default()
        }

        fn spares(&self, pool: PoolHandle) -> Vec<SpareConfig> {
            self.pools
                .get(&pool.0 .0)
                .map(|p| p.spares.clone())
                .unwrap_or_default()
        }

        fn get_prop_int(&self, pool: PoolHandle, prop: &str) -> Option<i64> {
            let p = self.pools.get(&pool.0 .0)?;
            match prop {
                PROP_AUTOREPLACE => Some(p.autoreplace),
                _ => None,
            }
        }

        fn pool_guids(&self) -> Vec<Guid> {
            self.pools.values().map(|p| p.guid).collect()
        }

        fn online(
            &mut self,
            pool: PoolHandle,
            vdev_guid: Guid,
            flags: OnlineFlags,
        ) -> Result<VdevState, PoolLibError> {
            self.calls.push(Call::Online {
                pool: pool.0,
                vdev: vdev_guid,
                flags,
            });
            let p = self
                .pools
                .get_mut(&pool.0 .0)
                .ok_or(PoolLibError::PoolNotFound { pool_guid: pool.0 })?;
            let v = p
                .vdevs
                .iter_mut()
                .find(|v| v.guid == vdev_guid)
                .ok_or(PoolLibError::VdevNotFound {
                    pool_guid: pool.0,
                    vdev_guid,
                })?;
            v.state = VdevState::Healthy;
            Ok(v.state)
        }

        fn degrade(&mut self, pool: PoolHandle, vdev_guid: Guid, aux: Aux) -> Result<(), PoolLibError> {
            self.calls.push(Call::Degrade {
                pool: pool.0,
                vdev: vdev_guid,
                aux,
            });
            if self.fail_degrade {
                return Err(PoolLibError::DegradeFailed { vdev_guid });
            }
            let p = self
                .pools
                .get_mut(&pool.0 .0)
                .ok_or(PoolLibError::PoolNotFound { pool_guid: pool.0 })?;
            let v = p
                .vdevs
                .iter_mut()
                .find(|v| v.guid == vdev_guid)
                .ok_or(PoolLibError::VdevNotFound {
                    pool_guid: pool.0,
                    vdev_guid,
                })?;
            v.state = VdevState::Degraded;
            Ok(())
        }

        fn attach(
            &mut self,
            pool: PoolHandle,
            from_vdev_guid: Guid,
            new_path: &str,
            _dev_type: DevType,
            replace: bool,
        ) -> Result<(), PoolLibError> {
            self.calls.push(Call::Attach {
                pool: pool.0,
                from: from_vdev_guid,
                path: new_path.to_string(),
                replace,
            });
            if self.fail_attach {
                return Err(PoolLibError::AttachFailed {
                    vdev_guid: from_vdev_guid,
                    path: new_path.to_string(),
                });
            }
            if let Some(p) = self.pools.get_mut(&pool.0 .0) {
                if let Some(v) = p.vdevs.iter_mut().find(|v| v.guid == from_vdev_guid) {
                    v.state = VdevState::Healthy;
                }
            }
            Ok(())
        }

        fn label_disk(&mut self, pool: PoolHandle, dev_path: &str) -> Result<(), PoolLibError> {
            self.calls.push(Call::Label {
                pool: pool.0,
                path: dev_path.to_string(),
            });
            if self.fail_label {
                return Err(PoolLibError::LabelFailed {
                    path: dev_path.to_string(),
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    fn sample_pool() -> MockPool {
        MockPool {
            guid: Guid(1),
            vdevs: vec![VdevConfig {
                guid: Guid(2),
                state: VdevState::Removed,
                phys_path: "a/b".into(),
            }],
            spares: vec![SpareConfig {
                state: VdevState::Healthy,
                aux: Aux::None,
                path: "/dev/spare0".into(),
                dev_type: DevType::Disk,
            }],
            autoreplace: 1,
        }
    }

    #[test]
    fn find_vdev_locates_by_guid() {
        let mut mock = MockPoolView::new();
        mock.add_pool(sample_pool());
        let handle = mock.pool_by_guid(Guid(1)).unwrap();
        let vdev = mock.find_vdev(handle, Guid(2)).unwrap();
        assert_eq!(vdev.phys_path, "a/b");
    }

    #[test]
    fn degrade_records_call_and_mutates_state() {
        let mut mock = MockPoolView::new();
        mock.add_pool(sample_pool());
        let handle = mock.pool_by_guid(Guid(1)).unwrap();
        mock.degrade(handle, Guid(2), Aux::ErrExceeded).unwrap();
        assert_eq!(
            mock.calls[0],
            Call::Degrade {
                pool: Guid(1),
                vdev: Guid(2),
                aux: Aux::ErrExceeded
            }
        );
        assert_eq!(mock.find_vdev(handle, Guid(2)).unwrap().state, VdevState::Degraded);
    }
}
