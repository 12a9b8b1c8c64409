//! Error taxonomy for the Case Engine, following the error-handling design
//! in the corpus: one `snafu`-derived enum per fallible subsystem rather
//! than a single catch-all.

use snafu::Snafu;

/// Failures parsing a single event line (§4.2). `DiscardedEventType`
/// (NOMATCH) is not logged by the caller; `InvalidFormat` is logged at
/// `INFO` and the line dropped without disrupting the buffer.
#[derive(Debug, Snafu, PartialEq, Eq, Clone)]
#[snafu(visibility = "pub(crate)")]
pub enum ParseError {
    #[snafu(display("malformed event line: {}", reason))]
    InvalidFormat { reason: String },

    #[snafu(display("unknown event header '{}'", header))]
    UnknownEventType { header: char },

    #[snafu(display("discarded NOMATCH event"))]
    DiscardedEventType,
}

/// Failures reported by the pool-management library collaborator
/// (§4.3). These are logged at `ERR` and leave the owning Case File
/// open so that a later event may retry the same action.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility = "pub(crate)")]
pub enum PoolLibError {
    #[snafu(display("pool '{}' not found", pool_guid))]
    PoolNotFound { pool_guid: crate::types::Guid },

    #[snafu(display("vdev '{}' not found in pool '{}'", vdev_guid, pool_guid))]
    VdevNotFound {
        pool_guid: crate::types::Guid,
        vdev_guid: crate::types::Guid,
    },

    #[snafu(display("online() failed for vdev '{}'", vdev_guid))]
    OnlineFailed { vdev_guid: crate::types::Guid },

    #[snafu(display("degrade() failed for vdev '{}'", vdev_guid))]
    DegradeFailed { vdev_guid: crate::types::Guid },

    #[snafu(display("attach() failed for vdev '{}' path '{}'", vdev_guid, path))]
    AttachFailed {
        vdev_guid: crate::types::Guid,
        path: String,
    },

    #[snafu(display("label_disk() failed for '{}'", path))]
    LabelFailed { path: String },
}

/// Failures persisting or reloading a case file from disk (§4.6).
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum PersistError {
    #[snafu(display("failed to read case directory '{}': {}", dir.display(), source))]
    ReadDir {
        dir: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to open case file '{}': {}", path.display(), source))]
    Open {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to write case file '{}': {}", path.display(), source))]
    Write {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to unlink case file '{}': {}", path.display(), source))]
    Unlink {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("case file name '{}' does not match pool_<guid>_vdev_<guid>.case", name))]
    BadFileName { name: String },
}

/// Fatal startup failures (§7): these propagate out of `main` and exit
/// the process non-zero with the error chain printed.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum StartupError {
    #[snafu(display("failed to install signal handler: {}", source))]
    SignalInstall { source: std::io::Error },

    #[snafu(display("failed to create self-pipe: {}", source))]
    SelfPipe { source: nix::Error },

    #[snafu(display("failed to acquire PID file '{}': already running as pid {}", path.display(), pid))]
    AlreadyRunning { path: std::path::PathBuf, pid: i32 },

    #[snafu(display("failed to write PID file '{}': {}", path.display(), source))]
    PidFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to connect event transport: {}", source))]
    TransportConnect { source: std::io::Error },
}
