// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The keeper's persistent state file.
//!
//! The file is a single fixed-width little-endian record behind a
//! magic/version header.  It is rewritten after every tick via
//! write-temp-then-rename with fsyncs on both the file and the containing
//! directory, so a reader never observes a partial record.  A corrupt or
//! newer-versioned file is fatal: the keeper refuses to run rather than
//! guess about its own identity.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeZone, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use thiserror::Error;
use warden_common::lsn::Lsn;
use warden_common::roles::NodeRole;

/// `b"PWKS"`, little-endian.
pub const STATE_FILE_MAGIC: u32 = u32::from_le_bytes(*b"PWKS");
pub const STATE_FILE_VERSION: u32 = 1;

/// Magic plus version.
const HEADER_LEN: usize = 8;
/// Header plus the eleven fixed-width fields of the current layout.
const RECORD_LEN: usize = 72;

#[derive(Debug, Error)]
pub enum StateError {
    /// Header mismatch or undecodable record.  Operator intervention
    /// required; the keeper must not run.
    #[error("state file {path} is corrupt: {detail}")]
    Corrupt { path: Utf8PathBuf, detail: String },

    #[error("state file {path} has unsupported version {version}")]
    VersionUnsupported { path: Utf8PathBuf, version: u32 },

    #[error("state file I/O on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Everything the keeper persists between ticks.
#[derive(Clone, Debug, PartialEq)]
pub struct KeeperState {
    pub current_node_id: i64,
    pub current_group: i32,
    pub current_role: NodeRole,
    pub assigned_role: NodeRole,
    pub last_monitor_contact: Option<DateTime<Utc>>,
    pub last_secondary_contact: Option<DateTime<Utc>>,
    /// Replay/flush LSN as last reported to the monitor.
    pub xlog_location: Lsn,
    pub pg_control_version: u32,
    pub catalog_version: u32,
    pub system_identifier: u64,
    /// Opaque monotone counter of the monitor's view of the group.
    pub current_nodes_version: i32,
}

impl KeeperState {
    /// The state of a node that has not registered yet.
    pub fn new() -> KeeperState {
        KeeperState {
            current_node_id: -1,
            current_group: -1,
            current_role: NodeRole::Init,
            assigned_role: NodeRole::Init,
            last_monitor_contact: None,
            last_secondary_contact: None,
            xlog_location: Lsn::INVALID,
            pg_control_version: 0,
            catalog_version: 0,
            system_identifier: 0,
            current_nodes_version: 0,
        }
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        let mut off = 0;
        let mut put = |bytes: &[u8]| {
            buf[off..off + bytes.len()].copy_from_slice(bytes);
            off += bytes.len();
        };
        put(&STATE_FILE_MAGIC.to_le_bytes());
        put(&STATE_FILE_VERSION.to_le_bytes());
        put(&self.current_node_id.to_le_bytes());
        put(&self.current_group.to_le_bytes());
        put(&self.current_role.code().to_le_bytes());
        put(&self.assigned_role.code().to_le_bytes());
        put(&timestamp_secs(&self.last_monitor_contact).to_le_bytes());
        put(&timestamp_secs(&self.last_secondary_contact).to_le_bytes());
        put(&self.xlog_location.0.to_le_bytes());
        put(&self.pg_control_version.to_le_bytes());
        put(&self.catalog_version.to_le_bytes());
        put(&self.system_identifier.to_le_bytes());
        put(&self.current_nodes_version.to_le_bytes());
        assert_eq!(off, RECORD_LEN);
        buf
    }

    /// Decodes a record, dispatching on the header version.  Returns the
    /// version the record was found in, so the store can rewrite old
    /// records in the current layout.
    ///
    /// Versioning is asymmetric: a record written by a NEWER keeper is
    /// refused (we cannot know what its fields mean), while a record in
    /// any OLDER released layout is decoded by its own arm below and then
    /// upgraded on the next write.
    fn decode(
        path: &Utf8Path,
        buf: &[u8],
    ) -> Result<(KeeperState, u32), StateError> {
        let corrupt = |detail: String| StateError::Corrupt {
            path: path.to_owned(),
            detail,
        };

        if buf.len() < HEADER_LEN {
            return Err(corrupt(format!(
                "expected at least {} bytes, found {}",
                HEADER_LEN,
                buf.len()
            )));
        }

        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != STATE_FILE_MAGIC {
            return Err(corrupt(format!("bad magic {:#010x}", magic)));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version > STATE_FILE_VERSION {
            return Err(StateError::VersionUnsupported {
                path: path.to_owned(),
                version,
            });
        }

        let body = &buf[HEADER_LEN..];
        let state = match version {
            STATE_FILE_VERSION => Self::decode_v1(path, body)?,
            // One arm per superseded layout goes here.  Version 1 is the
            // first released layout, so anything older was never written
            // by a keeper.
            _ => {
                return Err(corrupt(format!(
                    "version {} was never a released layout",
                    version
                )))
            }
        };
        Ok((state, version))
    }

    /// The version-1 field layout.
    fn decode_v1(
        path: &Utf8Path,
        buf: &[u8],
    ) -> Result<KeeperState, StateError> {
        let corrupt = |detail: String| StateError::Corrupt {
            path: path.to_owned(),
            detail,
        };

        if buf.len() != RECORD_LEN - HEADER_LEN {
            return Err(corrupt(format!(
                "expected {} bytes of fields, found {}",
                RECORD_LEN - HEADER_LEN,
                buf.len()
            )));
        }

        let mut off = 0;
        let mut take = |n: usize| {
            let slice = &buf[off..off + n];
            off += n;
            slice
        };
        let take_u32 = |slice: &[u8]| {
            u32::from_le_bytes(slice.try_into().unwrap())
        };
        let take_u64 = |slice: &[u8]| {
            u64::from_le_bytes(slice.try_into().unwrap())
        };

        let current_node_id =
            i64::from_le_bytes(take(8).try_into().unwrap());
        let current_group =
            i32::from_le_bytes(take(4).try_into().unwrap());
        let current_role_code = take_u32(take(4));
        let assigned_role_code = take_u32(take(4));
        let last_monitor_contact =
            i64::from_le_bytes(take(8).try_into().unwrap());
        let last_secondary_contact =
            i64::from_le_bytes(take(8).try_into().unwrap());
        let xlog_location = take_u64(take(8));
        let pg_control_version = take_u32(take(4));
        let catalog_version = take_u32(take(4));
        let system_identifier = take_u64(take(8));
        let current_nodes_version =
            i32::from_le_bytes(take(4).try_into().unwrap());

        let current_role = NodeRole::from_code(current_role_code)
            .ok_or_else(|| {
                corrupt(format!("bad role code {}", current_role_code))
            })?;
        let assigned_role = NodeRole::from_code(assigned_role_code)
            .ok_or_else(|| {
                corrupt(format!("bad role code {}", assigned_role_code))
            })?;

        Ok(KeeperState {
            current_node_id,
            current_group,
            current_role,
            assigned_role,
            last_monitor_contact: secs_timestamp(last_monitor_contact),
            last_secondary_contact: secs_timestamp(last_secondary_contact),
            xlog_location: Lsn(xlog_location),
            pg_control_version,
            catalog_version,
            system_identifier,
            current_nodes_version,
        })
    }
}

impl Default for KeeperState {
    fn default() -> Self {
        KeeperState::new()
    }
}

fn timestamp_secs(ts: &Option<DateTime<Utc>>) -> i64 {
    ts.map(|t| t.timestamp()).unwrap_or(0)
}

fn secs_timestamp(secs: i64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        None
    } else {
        Utc.timestamp_opt(secs, 0).single()
    }
}

/// Reads and writes the state file for one data directory.
#[derive(Clone, Debug)]
pub struct StateStore {
    path: Utf8PathBuf,
}

impl StateStore {
    pub fn new(path: Utf8PathBuf) -> StateStore {
        StateStore { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.as_std_path().exists()
    }

    pub fn read(&self) -> Result<KeeperState, StateError> {
        let io_err = |err| StateError::Io { path: self.path.clone(), err };
        let mut file = File::open(&self.path).map_err(io_err)?;
        let mut buf = Vec::with_capacity(RECORD_LEN);
        file.read_to_end(&mut buf).map_err(io_err)?;
        let (state, version) = KeeperState::decode(&self.path, &buf)?;
        if version < STATE_FILE_VERSION {
            // second half of the upgrade: the record was read in its old
            // layout, persist it in the current one
            self.write(&state)?;
        }
        Ok(state)
    }

    /// Writes the record durably: temp file, fsync, rename over the
    /// destination, fsync the directory.
    pub fn write(&self, state: &KeeperState) -> Result<(), StateError> {
        let io_err = |err| StateError::Io { path: self.path.clone(), err };

        let parent = self
            .path
            .parent()
            .ok_or_else(|| StateError::Corrupt {
                path: self.path.clone(),
                detail: "state path has no parent directory".to_string(),
            })?;
        fs::create_dir_all(parent).map_err(io_err)?;

        let temp_path = self.temp_path();
        {
            let mut temp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(io_err)?;
            temp.write_all(&state.encode()).map_err(io_err)?;
            temp.sync_all().map_err(io_err)?;
        }
        fs::rename(&temp_path, &self.path).map_err(io_err)?;
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(io_err)?;
        Ok(())
    }

    /// Creates the file for a node that has not registered yet.  Refuses
    /// to clobber an existing record.
    pub fn init(&self) -> Result<KeeperState, StateError> {
        if self.exists() {
            return self.read();
        }
        let state = KeeperState::new();
        self.write(&state)?;
        Ok(state)
    }

    /// Removes the state file, for `drop node`.
    pub fn drop_file(&self) -> Result<(), StateError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(StateError::Io { path: self.path.clone(), err })
            }
        }
    }

    fn temp_path(&self) -> Utf8PathBuf {
        let mut name = self
            .path
            .file_name()
            .unwrap_or("pgwarden.state")
            .to_string();
        name.push_str(".new");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn scratch_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(
            dir.path().join("pgwarden.state"),
        )
        .unwrap();
        (dir, StateStore::new(path))
    }

    fn sample_state() -> KeeperState {
        KeeperState {
            current_node_id: 3,
            current_group: 0,
            current_role: NodeRole::Secondary,
            assigned_role: NodeRole::PreparePromotion,
            last_monitor_contact: Some(
                Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            ),
            last_secondary_contact: None,
            xlog_location: "16/B374D848".parse().unwrap(),
            pg_control_version: 1300,
            catalog_version: 202307071,
            system_identifier: 7_234_890_123_456_789_012,
            current_nodes_version: 9,
        }
    }

    #[test]
    fn write_read_identity() {
        let (_dir, store) = scratch_store();
        let state = sample_state();
        store.write(&state).unwrap();
        assert_eq!(store.read().unwrap(), state);
    }

    #[test]
    fn init_is_idempotent() {
        let (_dir, store) = scratch_store();
        let first = store.init().unwrap();
        assert_eq!(first.current_node_id, -1);
        assert_eq!(first.current_role, NodeRole::Init);

        // a second init must not reset an existing record
        let mut registered = first.clone();
        registered.current_node_id = 42;
        store.write(&registered).unwrap();
        assert_eq!(store.init().unwrap().current_node_id, 42);
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let (_dir, store) = scratch_store();
        store.write(&sample_state()).unwrap();

        let contents = fs::read(store.path()).unwrap();
        fs::write(store.path(), &contents[..contents.len() - 1]).unwrap();

        assert!(matches!(
            store.read(),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let (_dir, store) = scratch_store();
        store.write(&sample_state()).unwrap();

        let mut contents = fs::read(store.path()).unwrap();
        contents[0] ^= 0xFF;
        fs::write(store.path(), &contents).unwrap();

        assert!(matches!(
            store.read(),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn newer_version_is_refused() {
        let (_dir, store) = scratch_store();
        store.write(&sample_state()).unwrap();

        let mut contents = fs::read(store.path()).unwrap();
        contents[4..8]
            .copy_from_slice(&(STATE_FILE_VERSION + 1).to_le_bytes());
        fs::write(store.path(), &contents).unwrap();

        assert!(matches!(
            store.read(),
            Err(StateError::VersionUnsupported { version, .. })
                if version == STATE_FILE_VERSION + 1
        ));
    }

    #[test]
    fn older_version_takes_the_upgrade_path() {
        let (_dir, store) = scratch_store();
        store.write(&sample_state()).unwrap();

        // Version 0 predates the first released layout, so the upgrade
        // dispatch has no arm for it; what matters here is that an older
        // version is NOT refused as "unsupported" the way a newer one
        // is, but lands in the per-layout dispatch.
        let mut contents = fs::read(store.path()).unwrap();
        contents[4..8].copy_from_slice(&0u32.to_le_bytes());
        fs::write(store.path(), &contents).unwrap();

        match store.read() {
            Err(StateError::Corrupt { detail, .. }) => {
                assert!(detail.contains("never a released layout"));
            }
            other => panic!(
                "older version must hit the upgrade dispatch, got {:?}",
                other.map(|_| ())
            ),
        }
    }

    #[test]
    fn drop_file_tolerates_absence() {
        let (_dir, store) = scratch_store();
        store.drop_file().unwrap();
        store.write(&sample_state()).unwrap();
        store.drop_file().unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let (_dir, store) = scratch_store();
        store.write(&sample_state()).unwrap();
        assert!(!store.temp_path().as_std_path().exists());
    }
}
