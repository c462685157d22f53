// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with the keeper configuration.
//!
//! The configuration file is TOML, one per data directory (see
//! [`crate::paths`]).  Role and node id never live here: they belong to
//! the monitor and the state file, and a reload can never overwrite them.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_common::node::DEFAULT_FORMATION;

/// Seconds between two node_active calls.
const DEFAULT_NODE_ACTIVE_INTERVAL: u64 = 5;
/// Seconds without monitor or standby contact before a primary stops
/// accepting writes on its own.
const DEFAULT_NETWORK_PARTITION_TIMEOUT: u64 = 20;
/// Consecutive failed node_active calls before the keeper starts warning
/// loudly.  The keeper never self-demotes on this alone.
const DEFAULT_MONITOR_RETRY_WARN_TICKS: u32 = 20;
/// Bytes of replay lag under which a catching-up standby is considered
/// caught up (16MB, one WAL segment).
const DEFAULT_CATCHUP_THRESHOLD_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub keeper: KeeperSection,
    pub postgresql: PostgresqlSection,
    #[serde(default)]
    pub replication: ReplicationSection,
    #[serde(default)]
    pub ssl: SslSection,
    #[serde(default)]
    pub timeout: TimeoutSection,
}

/// `[keeper]`: this node's identity and its monitor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeeperSection {
    /// Connection URI of the monitor, e.g.
    /// `postgres://autoctl_node@monitor.internal/pg_auto_failover`.
    /// Absent on monitor nodes.
    pub monitor: Option<String>,
    #[serde(default = "default_formation")]
    pub formation: String,
    /// Group within the formation; assigned by the monitor when absent.
    pub group: Option<i32>,
    pub nodename: String,
    /// Host other nodes use to reach this one.
    pub hostname: String,
}

/// `[postgresql]`: the local instance under management.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostgresqlSection {
    pub pgdata: Utf8PathBuf,
    #[serde(default = "default_pgport")]
    pub pgport: u16,
    #[serde(default = "default_dbname")]
    pub dbname: String,
    #[serde(default = "default_listen_addresses")]
    pub listen_addresses: String,
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
    /// Leave pg_hba.conf alone and only warn about the rules we need.
    #[serde(default)]
    pub skip_hba: bool,
    /// Directory holding `pg_ctl` and friends; taken from `$PATH` when
    /// absent.
    pub bindir: Option<Utf8PathBuf>,
}

/// `[replication]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSection {
    #[serde(default = "default_maximum_backup_rate")]
    pub maximum_backup_rate: String,
    /// Directory pg_basebackup writes into before the data directory is
    /// swapped; sibling of PGDATA when absent.
    pub backup_directory: Option<Utf8PathBuf>,
}

/// `[ssl]`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SslSection {
    #[serde(default)]
    pub active: bool,
    pub cert_file: Option<Utf8PathBuf>,
    pub key_file: Option<Utf8PathBuf>,
    pub ca_file: Option<Utf8PathBuf>,
}

/// `[timeout]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_node_active_interval")]
    pub node_active_interval_secs: u64,
    #[serde(default = "default_network_partition_timeout")]
    pub network_partition_timeout_secs: u64,
    #[serde(default = "default_monitor_retry_warn_ticks")]
    pub monitor_retry_warn_ticks: u32,
    #[serde(default = "default_catchup_threshold")]
    pub catchup_threshold_bytes: u64,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        ReplicationSection {
            maximum_backup_rate: default_maximum_backup_rate(),
            backup_directory: None,
        }
    }
}

impl Default for TimeoutSection {
    fn default() -> Self {
        TimeoutSection {
            node_active_interval_secs: default_node_active_interval(),
            network_partition_timeout_secs:
                default_network_partition_timeout(),
            monitor_retry_warn_ticks: default_monitor_retry_warn_ticks(),
            catchup_threshold_bytes: default_catchup_threshold(),
        }
    }
}

fn default_formation() -> String {
    DEFAULT_FORMATION.to_string()
}
fn default_pgport() -> u16 {
    5432
}
fn default_dbname() -> String {
    "postgres".to_string()
}
fn default_listen_addresses() -> String {
    "*".to_string()
}
fn default_auth_method() -> String {
    "trust".to_string()
}
fn default_maximum_backup_rate() -> String {
    "100M".to_string()
}
fn default_node_active_interval() -> u64 {
    DEFAULT_NODE_ACTIVE_INTERVAL
}
fn default_network_partition_timeout() -> u64 {
    DEFAULT_NETWORK_PARTITION_TIMEOUT
}
fn default_monitor_retry_warn_ticks() -> u32 {
    DEFAULT_MONITOR_RETRY_WARN_TICKS
}
fn default_catchup_threshold() -> u64 {
    DEFAULT_CATCHUP_THRESHOLD_BYTES
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Failed to write config to {path}: {err}")]
    Write {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }

    /// Writes the configuration, creating parent directories as needed.
    /// Used by `pgwarden create`.
    pub fn write_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let rendered = toml::to_string_pretty(self)
            .expect("config serialization is infallible");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                ConfigError::Write { path: path.into(), err }
            })?;
        }
        std::fs::write(path, rendered)
            .map_err(|err| ConfigError::Write { path: path.into(), err })
    }

    pub fn node_active_interval(&self) -> Duration {
        Duration::from_secs(self.timeout.node_active_interval_secs)
    }

    pub fn network_partition_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.network_partition_timeout_secs)
    }

    /// Integrates a reloaded configuration.  Only fields that are safe to
    /// change while running are accepted; everything else keeps its
    /// previous value.  Returns true when anything changed.
    pub fn accept_new(&mut self, new: Config) -> bool {
        let mut changed = false;

        if new.keeper.nodename != self.keeper.nodename {
            self.keeper.nodename = new.keeper.nodename;
            changed = true;
        }
        if new.keeper.hostname != self.keeper.hostname {
            self.keeper.hostname = new.keeper.hostname;
            changed = true;
        }
        if new.keeper.monitor != self.keeper.monitor {
            self.keeper.monitor = new.keeper.monitor;
            changed = true;
        }
        if new.postgresql.pgport != self.postgresql.pgport {
            self.postgresql.pgport = new.postgresql.pgport;
            changed = true;
        }
        if new.ssl != self.ssl {
            self.ssl = new.ssl;
            changed = true;
        }
        if new.timeout != self.timeout {
            self.timeout = new.timeout;
            changed = true;
        }
        // pgdata, formation and group are identity: never reloadable.
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [keeper]
            monitor = "postgres://autoctl_node@monitor/pg_auto_failover"
            nodename = "node-a"
            hostname = "10.0.0.1"

            [postgresql]
            pgdata = "/srv/pg/node-a"
        "#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.keeper.formation, "default");
        assert_eq!(config.keeper.group, None);
        assert_eq!(config.postgresql.pgport, 5432);
        assert_eq!(config.postgresql.dbname, "postgres");
        assert_eq!(config.postgresql.auth_method, "trust");
        assert!(!config.postgresql.skip_hba);
        assert_eq!(config.timeout.node_active_interval_secs, 5);
        assert_eq!(
            config.timeout.catchup_threshold_bytes,
            16 * 1024 * 1024
        );
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("pgwarden.cfg");
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        config.write_file(&path).unwrap();
        let reread = Config::from_file(&path).unwrap();
        assert_eq!(config, reread);
    }

    #[test]
    fn reload_accepts_safe_fields_only() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        let mut new = config.clone();
        new.keeper.hostname = "10.0.0.99".to_string();
        new.keeper.formation = "other".to_string();
        new.postgresql.pgdata = Utf8PathBuf::from("/elsewhere");

        assert!(config.accept_new(new));
        assert_eq!(config.keeper.hostname, "10.0.0.99");
        // identity fields kept
        assert_eq!(config.keeper.formation, "default");
        assert_eq!(config.postgresql.pgdata, "/srv/pg/node-a");
    }

    #[test]
    fn reload_reports_no_change() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        let new = config.clone();
        assert!(!config.accept_new(new));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::from_file("/nonexistent/pgwarden.cfg")
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
