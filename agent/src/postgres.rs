// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driving the local Postgres instance.
//!
//! Every operation here is a primitive the FSM composes: probe, start,
//! stop, promote, follow, rewind.  Each one checks its postcondition
//! before doing work, so a transition interrupted by a crash can simply
//! run again.  Failures are categorized: transient ones are retried on
//! the next tick and never advance the FSM.

use camino::{Utf8Path, Utf8PathBuf};
use slog::{debug, info, o, warn, Logger};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_postgres::NoTls;
use warden_common::lsn::Lsn;
use warden_common::node::NodeAddress;
use warden_common::poll;

/// Replication rules and `primary_conninfo` use this role.
pub const REPLICATION_USER: &str = "pgwarden_replicator";

/// Configuration keys we own live in this file inside PGDATA, included
/// from postgresql.conf.
const MANAGED_CONF: &str = "pgwarden.conf";
const MANAGED_CONF_INCLUDE: &str = "include 'pgwarden.conf'";

/// How long to wait for a server to accept connections after start or
/// promote.
const PG_START_TIMEOUT: Duration = Duration::from_secs(30);
const PG_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PgError {
    /// Retry on the next tick: server restarting, tool busy, connection
    /// refused.
    #[error("transient postgres failure: {detail}")]
    Transient { detail: String },

    /// A configuration file is missing or malformed; operator action is
    /// required.
    #[error("postgres configuration error: {detail}")]
    Config { detail: String },

    /// The data directory is unusable.
    #[error("fatal postgres failure: {detail}")]
    Fatal { detail: String },
}

impl PgError {
    fn transient(detail: impl Into<String>) -> PgError {
        PgError::Transient { detail: detail.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PgError::Transient { .. })
    }
}

/// Snapshot of the local instance, refreshed every tick.  When the server
/// is unreachable the default "not running" snapshot stands in; the
/// monitor tolerates it.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalPostgresState {
    pub pg_is_running: bool,
    pub is_in_recovery: bool,
    pub current_lsn: Lsn,
    /// `sync_state` of our first standby, from pg_stat_replication; empty
    /// on standbys and on primaries without standbys.
    pub pgsr_sync_state: String,
    /// On a standby: bytes received but not yet replayed.
    pub wal_lag_bytes: Option<u64>,
    /// On a primary: number of connected standbys.
    pub standby_count: usize,
}

impl Default for LocalPostgresState {
    fn default() -> Self {
        LocalPostgresState {
            pg_is_running: false,
            is_in_recovery: false,
            current_lsn: Lsn::INVALID,
            pgsr_sync_state: String::new(),
            wal_lag_bytes: None,
            standby_count: 0,
        }
    }
}

/// Values captured from pg_controldata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlData {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version: u32,
}

/// Handle on one data directory and the server (maybe) running from it.
#[derive(Clone, Debug)]
pub struct PostgresController {
    pgdata: Utf8PathBuf,
    pgport: u16,
    dbname: String,
    listen_addresses: String,
    bindir: Option<Utf8PathBuf>,
    maximum_backup_rate: String,
    log: Logger,
}

impl PostgresController {
    pub fn new(
        log: &Logger,
        pgdata: Utf8PathBuf,
        pgport: u16,
        dbname: String,
        listen_addresses: String,
        bindir: Option<Utf8PathBuf>,
        maximum_backup_rate: String,
    ) -> PostgresController {
        PostgresController {
            pgdata,
            pgport,
            dbname,
            listen_addresses,
            bindir,
            maximum_backup_rate,
            log: log.new(o!("component" => "PostgresController")),
        }
    }

    pub fn pgdata(&self) -> &Utf8Path {
        &self.pgdata
    }

    pub fn pgport(&self) -> u16 {
        self.pgport
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    pub fn hba_path(&self) -> Utf8PathBuf {
        self.pgdata.join("pg_hba.conf")
    }

    fn standby_signal_path(&self) -> Utf8PathBuf {
        self.pgdata.join("standby.signal")
    }

    fn managed_conf_path(&self) -> Utf8PathBuf {
        self.pgdata.join(MANAGED_CONF)
    }

    fn tool(&self, name: &str) -> Command {
        let program = match &self.bindir {
            Some(bindir) => bindir.join(name).to_string(),
            None => name.to_string(),
        };
        let mut command = Command::new(program);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command
    }

    /// Runs a tool to completion, mapping a non-zero exit to a transient
    /// error carrying stderr.  Callers escalate the category when they
    /// know better.
    async fn run_tool(
        &self,
        name: &str,
        command: &mut Command,
    ) -> Result<String, PgError> {
        debug!(self.log, "running {}", name);
        let output = command.output().await.map_err(|err| {
            PgError::transient(format!("failed to spawn {}: {}", name, err))
        })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(PgError::transient(format!(
                "{} exited with {}: {}",
                name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            )))
        }
    }

    async fn connect_local(
        &self,
    ) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
        let mut config = tokio_postgres::Config::new();
        config
            .host("127.0.0.1")
            .port(self.pgport)
            .dbname(&self.dbname)
            .user(&whoami())
            .application_name("pgwarden")
            .connect_timeout(Duration::from_secs(2));
        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            let _ = connection.await;
        });
        Ok(client)
    }

    /// Refreshes the local state snapshot.  An unreachable server is a
    /// valid observation (the default "not running" snapshot); a server
    /// that accepts the connection but fails the probe query is an
    /// error, left to the caller to log at the cadence it wants.
    pub async fn probe(&self) -> Result<LocalPostgresState, PgError> {
        let client = match self.connect_local().await {
            Ok(client) => client,
            Err(error) => {
                debug!(self.log, "local probe: server unreachable";
                    "error" => %error);
                return Ok(LocalPostgresState::default());
            }
        };

        let row = match client
            .query_one(
                "SELECT pg_is_in_recovery(), \
                     (CASE WHEN pg_is_in_recovery() \
                        THEN pg_last_wal_replay_lsn() \
                        ELSE pg_current_wal_flush_lsn() END)::text, \
                     (CASE WHEN pg_is_in_recovery() \
                        THEN pg_wal_lsn_diff(pg_last_wal_receive_lsn(), \
                                             pg_last_wal_replay_lsn()) \
                        ELSE NULL END)::bigint",
                &[],
            )
            .await
        {
            Ok(row) => row,
            Err(error) => {
                debug!(self.log, "local probe query failed";
                    "error" => %error);
                return Err(PgError::transient(format!(
                    "probe query failed: {}",
                    error
                )));
            }
        };

        let is_in_recovery: bool = row.get(0);
        let current_lsn = row
            .get::<_, Option<String>>(1)
            .and_then(|s| s.parse::<Lsn>().ok())
            .unwrap_or(Lsn::INVALID);
        let wal_lag_bytes = row
            .get::<_, Option<i64>>(2)
            .and_then(|lag| u64::try_from(lag).ok());

        let (pgsr_sync_state, standby_count) = if is_in_recovery {
            (String::new(), 0)
        } else {
            match client
                .query(
                    "SELECT sync_state FROM pg_stat_replication \
                         ORDER BY application_name",
                    &[],
                )
                .await
            {
                Ok(rows) => {
                    let first = rows
                        .first()
                        .map(|row| row.get::<_, String>(0))
                        .unwrap_or_default();
                    (first, rows.len())
                }
                Err(_) => (String::new(), 0),
            }
        };

        Ok(LocalPostgresState {
            pg_is_running: true,
            is_in_recovery,
            current_lsn,
            pgsr_sync_state,
            wal_lag_bytes,
            standby_count,
        })
    }

    pub async fn is_running(&self) -> bool {
        let mut command = self.tool("pg_ctl");
        command.arg("status").arg("-D").arg(self.pgdata.as_str());
        matches!(
            command.output().await,
            Ok(output) if output.status.success()
        )
    }

    /// Starts the server if needed and waits for it to accept
    /// connections.
    pub async fn ensure_running(&self) -> Result<(), PgError> {
        if self.is_running().await {
            return Ok(());
        }
        info!(self.log, "starting postgres"; "pgdata" => self.pgdata.as_str());
        let options = format!(
            "-p {} -h '{}'",
            self.pgport, self.listen_addresses
        );
        let mut command = self.tool("pg_ctl");
        command
            .arg("start")
            .arg("-D")
            .arg(self.pgdata.as_str())
            .arg("-w")
            .arg("-o")
            .arg(options)
            .arg("-l")
            .arg(self.pgdata.join("startup.log").as_str());
        self.run_tool("pg_ctl start", &mut command).await?;
        self.wait_until_reachable().await
    }

    /// Stops the server if needed.  `immediate` maps to Postgres'
    /// immediate shutdown mode; the default is fast.
    pub async fn ensure_stopped(&self, immediate: bool) -> Result<(), PgError> {
        if !self.is_running().await {
            return Ok(());
        }
        let mode = if immediate { "immediate" } else { "fast" };
        info!(self.log, "stopping postgres"; "mode" => mode);
        let mut command = self.tool("pg_ctl");
        command
            .arg("stop")
            .arg("-D")
            .arg(self.pgdata.as_str())
            .arg("-m")
            .arg(mode)
            .arg("-w");
        self.run_tool("pg_ctl stop", &mut command).await.map(|_| ())
    }

    pub async fn reload(&self) -> Result<(), PgError> {
        let mut command = self.tool("pg_ctl");
        command.arg("reload").arg("-D").arg(self.pgdata.as_str());
        self.run_tool("pg_ctl reload", &mut command).await.map(|_| ())
    }

    /// Promotes a standby and waits until the server reports a writable
    /// state.  A server already out of recovery is left alone.
    pub async fn promote(&self) -> Result<(), PgError> {
        let state = self.probe().await.unwrap_or_default();
        if state.pg_is_running && !state.is_in_recovery {
            return Ok(());
        }
        info!(self.log, "promoting postgres");
        let mut command = self.tool("pg_ctl");
        command
            .arg("promote")
            .arg("-D")
            .arg(self.pgdata.as_str())
            .arg("-w");
        self.run_tool("pg_ctl promote", &mut command).await?;

        poll::wait_for_condition::<(), PgError, _, _>(
            || async {
                match self.probe().await {
                    Ok(state)
                        if state.pg_is_running
                            && !state.is_in_recovery =>
                    {
                        Ok(())
                    }
                    _ => Err(poll::CondCheckError::NotYet),
                }
            },
            &PG_POLL_INTERVAL,
            &PG_START_TIMEOUT,
        )
        .await
        .map_err(|_| {
            PgError::transient("server still in recovery after promote")
        })
    }

    /// Configures this node as a standby of `primary` and (re)starts it.
    /// Already-correct configuration makes this a cheap restartable
    /// no-op.
    pub async fn follow(
        &self,
        primary: &NodeAddress,
        slot_name: &str,
        application_name: &str,
    ) -> Result<(), PgError> {
        let conninfo = format!(
            "host={} port={} user={} application_name={}",
            primary.host, primary.port, REPLICATION_USER, application_name,
        );

        let mut changed = false;
        changed |=
            self.set_conf_key("primary_conninfo", &conninfo)?;
        changed |=
            self.set_conf_key("primary_slot_name", slot_name)?;
        self.ensure_managed_conf_included()?;

        let signal = self.standby_signal_path();
        if !signal.as_std_path().exists() {
            std::fs::write(&signal, "").map_err(|err| PgError::Config {
                detail: format!(
                    "failed to write {}: {}",
                    signal, err
                ),
            })?;
            changed = true;
        }

        if changed {
            info!(self.log, "following new primary"; "primary" => %primary);
            self.ensure_stopped(false).await?;
        }
        self.ensure_running().await
    }

    /// Rewinds this data directory against the new primary.  Per the
    /// failover protocol a failed rewind falls back to a fresh base
    /// backup: a diverged timeline is not worth more retries.
    pub async fn rewind(&self, source: &NodeAddress) -> Result<(), PgError> {
        self.ensure_stopped(false).await?;

        let source_server = format!(
            "host={} port={} user={} dbname={}",
            source.host, source.port, REPLICATION_USER, self.dbname,
        );
        let mut command = self.tool("pg_rewind");
        command
            .arg("--target-pgdata")
            .arg(self.pgdata.as_str())
            .arg("--source-server")
            .arg(&source_server);

        match self.run_tool("pg_rewind", &mut command).await {
            Ok(_) => Ok(()),
            Err(error) => {
                warn!(self.log,
                    "pg_rewind failed, falling back to base backup";
                    "error" => %error);
                self.basebackup(source).await
            }
        }
    }

    /// Replaces the data directory with a fresh base backup taken from
    /// `source`.
    pub async fn basebackup(
        &self,
        source: &NodeAddress,
    ) -> Result<(), PgError> {
        self.ensure_stopped(false).await?;

        let backup_dir = Utf8PathBuf::from(format!("{}.backup", self.pgdata));
        if backup_dir.as_std_path().exists() {
            std::fs::remove_dir_all(&backup_dir).map_err(|err| {
                PgError::Fatal {
                    detail: format!(
                        "failed to clear {}: {}",
                        backup_dir, err
                    ),
                }
            })?;
        }

        info!(self.log, "taking base backup"; "source" => %source);
        let mut command = self.tool("pg_basebackup");
        command
            .arg("-h")
            .arg(&source.host)
            .arg("-p")
            .arg(source.port.to_string())
            .arg("-U")
            .arg(REPLICATION_USER)
            .arg("-D")
            .arg(backup_dir.as_str())
            .arg("--wal-method=stream")
            .arg("--max-rate")
            .arg(&self.maximum_backup_rate);
        self.run_tool("pg_basebackup", &mut command).await?;

        // Swap directories only once the backup is complete.
        if self.pgdata.as_std_path().exists() {
            std::fs::remove_dir_all(&self.pgdata).map_err(|err| {
                PgError::Fatal {
                    detail: format!(
                        "failed to remove {}: {}",
                        self.pgdata, err
                    ),
                }
            })?;
        }
        std::fs::rename(&backup_dir, &self.pgdata).map_err(|err| {
            PgError::Fatal {
                detail: format!(
                    "failed to move {} into place: {}",
                    backup_dir, err
                ),
            }
        })?;
        Ok(())
    }

    /// Creates the data directory when it does not exist yet.
    pub async fn initdb(&self, auth_method: &str) -> Result<(), PgError> {
        if self.pgdata.join("PG_VERSION").as_std_path().exists() {
            return Ok(());
        }
        info!(self.log, "running initdb"; "pgdata" => self.pgdata.as_str());
        let mut command = self.tool("initdb");
        command
            .arg("-D")
            .arg(self.pgdata.as_str())
            .arg("--auth")
            .arg(auth_method);
        self.run_tool("initdb", &mut command).await.map_err(|error| {
            // a failed initdb leaves nothing worth retrying into
            PgError::Fatal { detail: error.to_string() }
        })?;
        Ok(())
    }

    /// Captures system identifier and version numbers from
    /// pg_controldata.
    pub async fn controldata(&self) -> Result<ControlData, PgError> {
        let mut command = self.tool("pg_controldata");
        command.arg("-D").arg(self.pgdata.as_str());
        let stdout = self.run_tool("pg_controldata", &mut command).await?;
        parse_controldata(&stdout).ok_or_else(|| PgError::Fatal {
            detail: format!(
                "pg_controldata output for {} is missing expected fields",
                self.pgdata
            ),
        })
    }

    pub async fn create_replication_slot(
        &self,
        name: &str,
    ) -> Result<(), PgError> {
        let client = self.connect_local().await.map_err(|e| {
            PgError::transient(format!("cannot connect for slot: {}", e))
        })?;
        let existing = client
            .query(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&name],
            )
            .await
            .map_err(|e| PgError::transient(e.to_string()))?;
        if !existing.is_empty() {
            return Ok(());
        }
        client
            .execute(
                "SELECT pg_create_physical_replication_slot($1)",
                &[&name],
            )
            .await
            .map_err(|e| PgError::transient(e.to_string()))?;
        debug!(self.log, "created replication slot"; "slot" => name);
        Ok(())
    }

    pub async fn drop_replication_slot(
        &self,
        name: &str,
    ) -> Result<(), PgError> {
        let client = self.connect_local().await.map_err(|e| {
            PgError::transient(format!("cannot connect for slot: {}", e))
        })?;
        let existing = client
            .query(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&name],
            )
            .await
            .map_err(|e| PgError::transient(e.to_string()))?;
        if existing.is_empty() {
            return Ok(());
        }
        client
            .execute("SELECT pg_drop_replication_slot($1)", &[&name])
            .await
            .map_err(|e| PgError::transient(e.to_string()))?;
        debug!(self.log, "dropped replication slot"; "slot" => name);
        Ok(())
    }

    /// Commits a new `synchronous_standby_names` and reloads.  The empty
    /// string turns synchronous replication off.
    pub async fn set_synchronous_standby_names(
        &self,
        expression: &str,
    ) -> Result<(), PgError> {
        let changed =
            self.set_conf_key("synchronous_standby_names", expression)?;
        self.ensure_managed_conf_included()?;
        if changed {
            info!(self.log, "synchronous_standby_names updated";
                "value" => expression);
            self.reload().await?;
        }
        Ok(())
    }

    /// Flips `default_transaction_read_only`.  Used while a promoted
    /// candidate waits for the monitor's go-ahead before taking writes.
    pub async fn set_default_transaction_read_only(
        &self,
        value: &str,
    ) -> Result<(), PgError> {
        let changed =
            self.set_conf_key("default_transaction_read_only", value)?;
        self.ensure_managed_conf_included()?;
        if changed {
            self.reload().await?;
        }
        Ok(())
    }

    /// Clears replication settings and the standby signal, for a node
    /// resuming primary duty.
    pub fn clear_standby_setup(&self) -> Result<bool, PgError> {
        let mut changed = false;
        changed |= self.set_conf_key("primary_conninfo", "")?;
        changed |= self.set_conf_key("primary_slot_name", "")?;
        let signal = self.standby_signal_path();
        if signal.as_std_path().exists() {
            std::fs::remove_file(&signal).map_err(|err| PgError::Config {
                detail: format!("failed to remove {}: {}", signal, err),
            })?;
            changed = true;
        }
        Ok(changed)
    }

    /// Sets `key = 'value'` in the managed configuration file, returning
    /// whether the file changed.  Writing goes through a temp file and
    /// rename so a reload never sees a torn file.
    fn set_conf_key(&self, key: &str, value: &str) -> Result<bool, PgError> {
        let path = self.managed_conf_path();
        let current = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                String::new()
            }
            Err(err) => {
                return Err(PgError::Config {
                    detail: format!("failed to read {}: {}", path, err),
                })
            }
        };

        let rendered = format!("{} = '{}'", key, value.replace('\'', "''"));
        let mut lines: Vec<String> = Vec::new();
        let mut found = false;
        for line in current.lines() {
            if line.trim_start().starts_with(&format!("{} ", key))
                || line.trim_start().starts_with(&format!("{}=", key))
            {
                if found {
                    continue;
                }
                found = true;
                lines.push(rendered.clone());
            } else {
                lines.push(line.to_string());
            }
        }
        if !found {
            lines.push(rendered);
        }

        let new_contents = format!("{}\n", lines.join("\n"));
        if new_contents == current {
            return Ok(false);
        }

        let temp = path.with_extension("conf.new");
        std::fs::write(&temp, &new_contents).map_err(|err| {
            PgError::Config {
                detail: format!("failed to write {}: {}", temp, err),
            }
        })?;
        std::fs::rename(&temp, &path).map_err(|err| PgError::Config {
            detail: format!("failed to rename {}: {}", temp, err),
        })?;
        Ok(true)
    }

    /// Makes sure postgresql.conf includes our managed file.
    fn ensure_managed_conf_included(&self) -> Result<(), PgError> {
        let conf_path = self.pgdata.join("postgresql.conf");
        let contents =
            std::fs::read_to_string(&conf_path).map_err(|err| {
                PgError::Config {
                    detail: format!("failed to read {}: {}", conf_path, err),
                }
            })?;
        if contents
            .lines()
            .any(|line| line.trim() == MANAGED_CONF_INCLUDE)
        {
            return Ok(());
        }
        let mut new_contents = contents;
        if !new_contents.ends_with('\n') {
            new_contents.push('\n');
        }
        new_contents.push_str(MANAGED_CONF_INCLUDE);
        new_contents.push('\n');
        std::fs::write(&conf_path, new_contents).map_err(|err| {
            PgError::Config {
                detail: format!("failed to write {}: {}", conf_path, err),
            }
        })
    }

    async fn wait_until_reachable(&self) -> Result<(), PgError> {
        poll::wait_for_condition::<(), PgError, _, _>(
            || async {
                match self.connect_local().await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(poll::CondCheckError::NotYet),
                }
            },
            &PG_POLL_INTERVAL,
            &PG_START_TIMEOUT,
        )
        .await
        .map_err(|_| {
            PgError::transient("server did not accept connections in time")
        })
    }
}

fn whoami() -> String {
    std::env::var("PGUSER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "postgres".to_string())
}

/// Pulls the three values we persist out of pg_controldata output.
fn parse_controldata(output: &str) -> Option<ControlData> {
    let mut data = ControlData::default();
    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match label.trim() {
            "Database system identifier" => {
                data.system_identifier = value.parse().ok()?;
            }
            "pg_control version number" => {
                data.pg_control_version = value.parse().ok()?;
            }
            "Catalog version number" => {
                data.catalog_version = value.parse().ok()?;
            }
            _ => (),
        }
    }
    if data.system_identifier == 0 {
        None
    } else {
        Some(data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;

    fn test_controller(pgdata: Utf8PathBuf) -> PostgresController {
        PostgresController::new(
            &Logger::root(slog::Discard, o!()),
            pgdata,
            5432,
            "postgres".to_string(),
            "*".to_string(),
            None,
            "100M".to_string(),
        )
    }

    fn scratch_pgdata() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let pgdata =
            Utf8PathBuf::from_path_buf(dir.path().join("data")).unwrap();
        std::fs::create_dir_all(&pgdata).unwrap();
        std::fs::write(pgdata.join("postgresql.conf"), "port = 5432\n")
            .unwrap();
        (dir, pgdata)
    }

    #[test]
    fn controldata_parsing() {
        let output = "\
pg_control version number:            1300
Catalog version number:               202307071
Database system identifier:           7234890123456789012
Database cluster state:               in production
";
        let data = parse_controldata(output).unwrap();
        assert_eq!(data.pg_control_version, 1300);
        assert_eq!(data.catalog_version, 202307071);
        assert_eq!(data.system_identifier, 7_234_890_123_456_789_012);
    }

    #[test]
    fn controldata_requires_system_identifier() {
        assert_eq!(parse_controldata("Database cluster state: shut down"), None);
        assert_eq!(parse_controldata(""), None);
    }

    #[test]
    fn set_conf_key_creates_updates_and_noops() {
        let (_dir, pgdata) = scratch_pgdata();
        let controller = test_controller(pgdata.clone());

        assert!(controller
            .set_conf_key("synchronous_standby_names", "*")
            .unwrap());
        let conf =
            std::fs::read_to_string(pgdata.join(MANAGED_CONF)).unwrap();
        assert_eq!(conf, "synchronous_standby_names = '*'\n");

        // same value: no change
        assert!(!controller
            .set_conf_key("synchronous_standby_names", "*")
            .unwrap());

        // new value replaces in place, other keys kept
        assert!(controller
            .set_conf_key("primary_slot_name", "pgwarden_2")
            .unwrap());
        assert!(controller
            .set_conf_key("synchronous_standby_names", "")
            .unwrap());
        let conf =
            std::fs::read_to_string(pgdata.join(MANAGED_CONF)).unwrap();
        assert_eq!(
            conf,
            "synchronous_standby_names = ''\nprimary_slot_name = 'pgwarden_2'\n"
        );
    }

    #[test]
    fn conf_values_with_quotes_are_escaped() {
        let (_dir, pgdata) = scratch_pgdata();
        let controller = test_controller(pgdata.clone());
        controller.set_conf_key("primary_conninfo", "host='h' port=5432")
            .unwrap();
        let conf =
            std::fs::read_to_string(pgdata.join(MANAGED_CONF)).unwrap();
        assert_eq!(
            conf,
            "primary_conninfo = 'host=''h'' port=5432'\n"
        );
    }

    #[test]
    fn include_line_is_appended_once() {
        let (_dir, pgdata) = scratch_pgdata();
        let controller = test_controller(pgdata.clone());

        controller.ensure_managed_conf_included().unwrap();
        controller.ensure_managed_conf_included().unwrap();

        let conf =
            std::fs::read_to_string(pgdata.join("postgresql.conf")).unwrap();
        assert_eq!(
            conf.matches(MANAGED_CONF_INCLUDE).count(),
            1,
            "include line must appear exactly once: {:?}",
            conf
        );
    }

    #[test]
    fn clear_standby_setup_removes_signal() {
        let (_dir, pgdata) = scratch_pgdata();
        let controller = test_controller(pgdata.clone());
        std::fs::write(pgdata.join("standby.signal"), "").unwrap();
        controller.set_conf_key("primary_conninfo", "host=old").unwrap();

        assert!(controller.clear_standby_setup().unwrap());
        assert!(!pgdata.join("standby.signal").as_std_path().exists());

        // second call is a no-op
        assert!(!controller.clear_standby_setup().unwrap());
    }
}
