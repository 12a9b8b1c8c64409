//! On-disk persistence for case files (§4.6).
//!
//! One file per case, named `pool_<PGUID>_vdev_<VGUID>.case`. Contents
//! are raw event lines, committed events first then tentative events
//! (each tentative line prefixed with the literal `"tentative "`).
//! Serialising with both buckets empty unlinks the file — there is
//! never an empty file on disk.

use crate::error::{self, PersistError};
use crate::event::Event;
use crate::types::Guid;
use snafu::ResultExt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const TENTATIVE_PREFIX: &str = "tentative ";

pub fn file_name(pool_guid: Guid, vdev_guid: Guid) -> String {
    format!("pool_{}_vdev_{}.case", pool_guid.0, vdev_guid.0)
}

pub fn file_path(dir: &Path, pool_guid: Guid, vdev_guid: Guid) -> PathBuf {
    dir.join(file_name(pool_guid, vdev_guid))
}

/// Parse the `(pool_guid, vdev_guid)` identity out of a case file's
/// basename, e.g. `pool_1_vdev_2.case`.
pub fn parse_file_name(name: &str) -> Result<(Guid, Guid), PersistError> {
    let bad = || error::BadFileName { name: name.to_string() }.build();
    let rest = name.strip_suffix(".case").ok_or_else(bad)?;
    let rest = rest.strip_prefix("pool_").ok_or_else(bad)?;
    let (pool_part, rest) = rest.split_once("_vdev_").ok_or_else(bad)?;
    let pool_guid: u64 = pool_part.parse().map_err(|_| bad())?;
    let vdev_guid: u64 = rest.parse().map_err(|_| bad())?;
    Ok((Guid(pool_guid), Guid(vdev_guid)))
}

/// Serialise rule (§4.6): if both buckets are empty, unlink the file;
/// otherwise truncate-create, write committed events then tentative
/// events (tagged), and close.
pub fn serialize(
    dir: &Path,
    pool_guid: Guid,
    vdev_guid: Guid,
    events: &[Event],
    tentative: &[Event],
) -> Result<(), PersistError> {
    let path = file_path(dir, pool_guid, vdev_guid);
    if events.is_empty() && tentative.is_empty() {
        return unlink_if_present(&path);
    }
    let mut f = fs::File::create(&path).context(error::Write { path: path.clone() })?;
    for ev in events {
        f.write_all(ev.to_line().as_bytes())
            .context(error::Write { path: path.clone() })?;
    }
    for ev in tentative {
        f.write_all(TENTATIVE_PREFIX.as_bytes())
            .context(error::Write { path: path.clone() })?;
        f.write_all(ev.to_line().as_bytes())
            .context(error::Write { path: path.clone() })?;
    }
    Ok(())
}

/// Unlink using the full directory-qualified path, always — the
/// original implementation's bug of unlinking a bare filename in one
/// error branch is deliberately not reproduced here (SPEC_FULL §9).
pub fn unlink_if_present(path: &Path) -> Result<(), PersistError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PersistError::Unlink {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// A line read back from disk, tagged with which bucket it belongs to.
pub struct TaggedLine {
    pub tentative: bool,
    pub line: String,
}

/// Read a case file's lines, splitting off the `tentative ` prefix.
pub fn read_lines(path: &Path) -> Result<Vec<TaggedLine>, PersistError> {
    let contents = fs::read_to_string(path).context(error::Open { path: path.to_path_buf() })?;
    Ok(contents
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| match l.strip_prefix(TENTATIVE_PREFIX) {
            Some(rest) => TaggedLine {
                tentative: true,
                line: rest.to_string(),
            },
            None => TaggedLine {
                tentative: false,
                line: l.to_string(),
            },
        })
        .collect())
}

/// Enumerate case files in `dir` matching the `pool_%u_vdev_%u.case`
/// pattern, returning their parsed identity alongside the path.
pub fn list_case_files(dir: &Path) -> Result<Vec<(Guid, Guid, PathBuf)>, PersistError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(source) => {
            return Err(PersistError::ReadDir {
                dir: dir.to_path_buf(),
                source,
            })
        }
    };
    let mut out = vec![];
    for entry in entries {
        let entry = entry.context(error::ReadDir { dir: dir.to_path_buf() })?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if let Ok((pool_guid, vdev_guid)) = parse_file_name(name) {
            out.push((pool_guid, vdev_guid, entry.path()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::parse;

    #[test]
    fn round_trips_filename() {
        let name = file_name(Guid(1), Guid(2));
        assert_eq!(name, "pool_1_vdev_2.case");
        assert_eq!(parse_file_name(&name).unwrap(), (Guid(1), Guid(2)));
    }

    #[test]
    fn rejects_malformed_filename() {
        assert!(parse_file_name("pool_1.case").is_err());
        assert!(parse_file_name("pool_x_vdev_2.case").is_err());
        assert!(parse_file_name("pool_1_vdev_2.txt").is_err());
    }

    #[test]
    fn serialize_then_read_round_trips_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let committed = vec![parse("!class=a pool_guid=1 vdev_guid=2 timestamp=1\n", || 1).unwrap()];
        let tentative = vec![parse("!class=b pool_guid=1 vdev_guid=2 timestamp=2\n", || 2).unwrap()];
        serialize(dir.path(), Guid(1), Guid(2), &committed, &tentative).unwrap();

        let path = file_path(dir.path(), Guid(1), Guid(2));
        let lines = read_lines(&path).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(!lines[0].tentative);
        assert!(lines[1].tentative);
    }

    #[test]
    fn serialize_with_empty_buckets_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = file_path(dir.path(), Guid(5), Guid(6));
        std::fs::write(&path, "!class=a\n").unwrap();
        serialize(dir.path(), Guid(5), Guid(6), &[], &[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn list_case_files_filters_non_matching_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pool_1_vdev_2.case"), "!class=a\n").unwrap();
        std::fs::write(dir.path().join("not-a-case-file.txt"), "x").unwrap();
        let found = list_case_files(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!((found[0].0, found[0].1), (Guid(1), Guid(2)));
    }
}
