use humantime::Duration as HumanDuration;
use std::path::PathBuf;
use std::process::ExitCode;
use structopt::StructOpt;
use tracing::{error, info};
use zpoold::daemon::{Config, Daemon};
use zpoold::error::StartupError;
use zpoold::pidfile::PidFile;
use zpoold::pool_view::PoolView;
use zpoold::signals::SignalHandler;
use zpoold::transport::UnixTransport;

#[derive(Debug, StructOpt)]
#[structopt(name = "zpoold", about = "Storage-pool fault-management daemon")]
struct CliArgs {
    /// Directory holding persisted case files.
    #[structopt(long, default_value = "/var/db/zpoold")]
    case_dir: PathBuf,

    /// PID file path; acquiring its lock fails if another instance
    /// already holds it.
    #[structopt(long, default_value = "/var/run/zpoold.pid")]
    pid_file: PathBuf,

    /// Unix domain socket the kernel event transport is reachable at.
    #[structopt(long, default_value = "/var/run/devd.pipe")]
    socket: PathBuf,

    /// Grace period a soft-error burst is coalesced over before acting.
    #[structopt(long, default_value = "60s")]
    grace: HumanDuration,

    /// Number of coalesced soft errors within the grace period that
    /// triggers a degrade.
    #[structopt(long, default_value = "50")]
    degrade_io_count: usize,

    /// Backoff between failed event-transport connection attempts.
    #[structopt(long, default_value = "30s")]
    reconnect_backoff: HumanDuration,
}

fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }
}

/// Stand-in Pool View backing the real pool-management library; wired
/// up here so `main` has a concrete type to hand to `Daemon`. Carries no
/// state of its own beyond what a real binding would: a live daemon
/// queries the pool library directly rather than caching topology.
struct NativePoolView;

impl PoolView for NativePoolView {
    fn pool_by_guid(&self, _pool_guid: zpoold::types::Guid) -> Option<zpoold::pool_view::PoolHandle> {
        None
    }

    fn vdevs(&self, _pool: zpoold::pool_view::PoolHandle) -> Vec<zpoold::pool_view::VdevConfig> {
        vec![]
    }

    fn spares(&self, _pool: zpoold::pool_view::PoolHandle) -> Vec<zpoold::pool_view::SpareConfig> {
        vec![]
    }

    fn get_prop_int(&self, _pool: zpoold::pool_view::PoolHandle, _prop: &str) -> Option<i64> {
        None
    }

    fn pool_guids(&self) -> Vec<zpoold::types::Guid> {
        vec![]
    }

    fn online(
        &mut self,
        _pool: zpoold::pool_view::PoolHandle,
        _vdev_guid: zpoold::types::Guid,
        _flags: zpoold::pool_view::OnlineFlags,
    ) -> Result<zpoold::types::VdevState, zpoold::error::PoolLibError> {
        Err(zpoold::error::PoolLibError::OnlineFailed { vdev_guid: _vdev_guid })
    }

    fn degrade(
        &mut self,
        _pool: zpoold::pool_view::PoolHandle,
        vdev_guid: zpoold::types::Guid,
        _aux: zpoold::pool_view::Aux,
    ) -> Result<(), zpoold::error::PoolLibError> {
        Err(zpoold::error::PoolLibError::DegradeFailed { vdev_guid })
    }

    fn attach(
        &mut self,
        _pool: zpoold::pool_view::PoolHandle,
        vdev_guid: zpoold::types::Guid,
        new_path: &str,
        _dev_type: zpoold::pool_view::DevType,
        _replace: bool,
    ) -> Result<(), zpoold::error::PoolLibError> {
        Err(zpoold::error::PoolLibError::AttachFailed {
            vdev_guid,
            path: new_path.to_string(),
        })
    }

    fn label_disk(
        &mut self,
        _pool: zpoold::pool_view::PoolHandle,
        dev_path: &str,
    ) -> Result<(), zpoold::error::PoolLibError> {
        Err(zpoold::error::PoolLibError::LabelFailed {
            path: dev_path.to_string(),
        })
    }
}

fn run() -> Result<(), StartupError> {
    let cli_args = CliArgs::from_args();
    info!("starting with options: {:?}", &cli_args);

    let _pid_file = PidFile::acquire(&cli_args.pid_file)?;
    let signals = SignalHandler::install()?;

    std::fs::create_dir_all(&cli_args.case_dir).ok();

    let config = Config {
        case_dir: cli_args.case_dir.clone(),
        grace: cli_args.grace.into(),
        degrade_io_count: cli_args.degrade_io_count,
        reconnect_backoff: cli_args.reconnect_backoff.into(),
    };

    let mut daemon = Daemon::new(NativePoolView, signals, config);
    let socket = cli_args.socket.clone();
    daemon.run(move || {
        UnixTransport::connect(&socket).map(|t| Box::new(t) as Box<dyn zpoold::transport::EventTransport>)
    })
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}
