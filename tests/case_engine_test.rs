//! End-to-end exercises of the daemon loop pieces, as opposed to the
//! per-module unit tests living alongside each module: a soft-error
//! burst degrading a vdev, a hot-unplug/spare-activation sequence, and
//! restart reconciliation picking persisted cases back up.

use std::time::Duration;
use zpoold::daemon::{Config, Daemon};
use zpoold::event;
use zpoold::pool_view::mock::{MockPool, MockPoolView};
use zpoold::pool_view::{SpareConfig, VdevConfig};
use zpoold::types::{Guid, VdevState};

fn config(dir: &std::path::Path, grace: Duration) -> Config {
    Config {
        case_dir: dir.to_path_buf(),
        grace,
        degrade_io_count: 5,
        reconnect_backoff: Duration::from_millis(1),
    }
}

fn pool_with_vdev(state: VdevState) -> MockPoolView {
    let mut pool = MockPoolView::new();
    pool.add_pool(MockPool {
        guid: Guid(1),
        vdevs: vec![VdevConfig {
            guid: Guid(2),
            state,
            phys_path: "a/b".into(),
        }],
        spares: vec![],
        autoreplace: 0,
    });
    pool
}

#[test]
fn soft_error_burst_through_the_daemon_degrades_the_vdev() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool_with_vdev(VdevState::Degraded);
    let signals = zpoold::signals::SignalHandler::install().unwrap();
    let mut daemon = Daemon::new(pool, signals, config(dir.path(), Duration::from_millis(5)));

    for _ in 0..6 {
        let ev = event::parse(
            "!class=ereport.fs.zfs.io pool_guid=1 vdev_guid=2",
            event::unix_now,
        )
        .unwrap();
        daemon.dispatch_event(ev);
    }
    assert!(daemon.registry().find(Guid(1), Guid(2)).is_some());

    std::thread::sleep(Duration::from_millis(20));
    daemon.process_due_timers();

    assert!(daemon.registry().find(Guid(1), Guid(2)).is_none());
    assert!(daemon
        .pool()
        .calls
        .iter()
        .any(|c| matches!(c, zpoold::pool_view::mock::Call::Degrade { .. })));
}

#[test]
fn hot_unplug_activates_spare_and_is_closed_once_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = pool_with_vdev(VdevState::Removed);
    pool.pools.get_mut(&1).unwrap().spares.push(SpareConfig {
        state: VdevState::Healthy,
        aux: zpoold::pool_view::Aux::None,
        path: "/dev/spare0".into(),
        dev_type: zpoold::pool_view::DevType::Disk,
    });
    let signals = zpoold::signals::SignalHandler::install().unwrap();
    let mut daemon = Daemon::new(pool, signals, config(dir.path(), Duration::from_secs(60)));

    let ev = event::parse(
        "!class=resource.fs.zfs.removed pool_guid=1 vdev_guid=2",
        event::unix_now,
    )
    .unwrap();
    daemon.dispatch_event(ev);

    assert_eq!(
        daemon.pool().pools.get(&1).unwrap().vdevs[0].state,
        VdevState::Healthy
    );
    assert!(daemon.registry().find(Guid(1), Guid(2)).is_some());

    // A follow-up event refreshes the case's view of the vdev and finds
    // it healthy with no pending history, closing it.
    let followup = event::parse(
        "!class=ereport.fs.zfs.probe_failure pool_guid=1 vdev_guid=2",
        event::unix_now,
    )
    .unwrap();
    daemon.dispatch_event(followup);
    assert!(daemon.registry().find(Guid(1), Guid(2)).is_none());
}

#[test]
fn missed_event_detection_reopens_persisted_case_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let case_path = zpoold::persist::file_path(dir.path(), Guid(1), Guid(2));
    std::fs::write(&case_path, "!class=ereport.fs.zfs.io pool_guid=1 vdev_guid=2 timestamp=1\n").unwrap();

    let pool = pool_with_vdev(VdevState::Degraded);
    let signals = zpoold::signals::SignalHandler::install().unwrap();
    let mut daemon = Daemon::new(pool, signals, config(dir.path(), Duration::from_secs(60)));
    let mut transport = zpoold::transport::Loopback::new();

    daemon.missed_event_detection(&mut transport);

    let case = daemon.registry().find(Guid(1), Guid(2)).unwrap();
    assert_eq!(case.events().len(), 1);
}
