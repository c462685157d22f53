// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pgwarden PID file.
//!
//! One file per data directory: the first line is the supervisor PID, and
//! each following line is `service-name pid` for a running child service.
//! The file enforces single-instance startup and lets `pgwarden stop`,
//! `reload` and `status` find the supervisor to signal.

use camino::{Utf8Path, Utf8PathBuf};
use std::fmt::Write as _;
use std::fs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("PID file {path} I/O")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("PID file {path} is malformed: {detail}")]
    Malformed { path: Utf8PathBuf, detail: String },
}

/// Parsed contents of a PID file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PidFile {
    pub supervisor_pid: u32,
    pub services: Vec<(String, u32)>,
}

impl PidFile {
    pub fn new(supervisor_pid: u32) -> PidFile {
        PidFile { supervisor_pid, services: Vec::new() }
    }

    fn render(&self) -> String {
        let mut out = format!("{}\n", self.supervisor_pid);
        for (name, pid) in &self.services {
            writeln!(out, "{} {}", name, pid).unwrap();
        }
        out
    }

    fn parse(path: &Utf8Path, contents: &str) -> Result<PidFile, PidFileError> {
        let malformed = |detail: String| PidFileError::Malformed {
            path: path.to_owned(),
            detail,
        };

        let mut lines = contents.lines();
        let supervisor_pid = lines
            .next()
            .ok_or_else(|| malformed("empty file".to_string()))?
            .trim()
            .parse::<u32>()
            .map_err(|e| malformed(format!("bad supervisor pid: {}", e)))?;

        let mut services = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, pid) = line.split_once(' ').ok_or_else(|| {
                malformed(format!("bad service line {:?}", line))
            })?;
            let pid = pid.trim().parse::<u32>().map_err(|e| {
                malformed(format!("bad pid in {:?}: {}", line, e))
            })?;
            services.push((name.to_string(), pid));
        }

        Ok(PidFile { supervisor_pid, services })
    }
}

/// Returns whether the given process is currently running.
pub fn process_running(pid: u32) -> bool {
    // This only checks for existence of the process; it sends no signal.
    0 == (unsafe { libc::kill(pid as libc::pid_t, 0) })
}

/// Writes the PID file, creating parent directories as needed.
pub fn write(path: &Utf8Path, pidfile: &PidFile) -> Result<(), PidFileError> {
    let io_err = |err| PidFileError::Io { path: path.to_owned(), err };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, pidfile.render()).map_err(io_err)
}

/// Reads the PID file; `Ok(None)` when it does not exist.
pub fn read(path: &Utf8Path) -> Result<Option<PidFile>, PidFileError> {
    match fs::read_to_string(path) {
        Ok(contents) => PidFile::parse(path, &contents).map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PidFileError::Io { path: path.to_owned(), err }),
    }
}

/// Returns the PID of a live supervisor already holding this PID file, if
/// any.  A stale file (dead PID) is not an obstacle to starting.
pub fn live_owner(path: &Utf8Path) -> Result<Option<u32>, PidFileError> {
    match read(path)? {
        Some(pidfile) if process_running(pidfile.supervisor_pid) => {
            Ok(Some(pidfile.supervisor_pid))
        }
        _ => Ok(None),
    }
}

/// Whether the PID file still names `expected_pid` as the supervisor.
/// Both the supervisor and the keeper loop verify this periodically and
/// shut down when somebody else took over the data directory.
pub fn owned_by(path: &Utf8Path, expected_pid: u32) -> bool {
    matches!(read(path), Ok(Some(p)) if p.supervisor_pid == expected_pid)
}

pub fn remove(path: &Utf8Path) -> Result<(), PidFileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PidFileError::Io { path: path.to_owned(), err }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join("pgwarden.pid")).unwrap()
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir);
        let mut pidfile = PidFile::new(4242);
        pidfile.services.push(("postgres".to_string(), 4243));
        pidfile.services.push(("keeper".to_string(), 4244));

        write(&path, &pidfile).unwrap();
        assert_eq!(read(&path).unwrap().unwrap(), pidfile);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(&scratch_path(&dir)).unwrap().is_none());
    }

    #[test]
    fn malformed_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir);
        for contents in ["", "notapid\n", "123\nkeeper\n", "123\nkeeper x\n"]
        {
            fs::write(&path, contents).unwrap();
            assert!(
                read(&path).is_err(),
                "contents {:?} should not parse",
                contents
            );
        }
    }

    #[test]
    fn ownership_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir);
        let our_pid = std::process::id();
        write(&path, &PidFile::new(our_pid)).unwrap();
        assert!(owned_by(&path, our_pid));
        assert!(!owned_by(&path, our_pid + 1));
    }

    #[test]
    fn live_owner_ignores_stale_pids() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir);

        // our own pid is alive
        let our_pid = std::process::id();
        write(&path, &PidFile::new(our_pid)).unwrap();
        assert_eq!(live_owner(&path).unwrap(), Some(our_pid));

        // pid 0 is never a valid child; kill(0, 0) targets the process
        // group, so use an unlikely-but-valid pid instead
        let mut stale = PidFile::new(u32::MAX / 2);
        stale.services.clear();
        write(&path, &stale).unwrap();
        assert_eq!(live_owner(&path).unwrap(), None);
    }

    #[test]
    fn remove_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch_path(&dir);
        remove(&path).unwrap();
        write(&path, &PidFile::new(1)).unwrap();
        remove(&path).unwrap();
        assert!(read(&path).unwrap().is_none());
    }
}
