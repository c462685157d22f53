// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Editing pg_hba.conf.
//!
//! The keeper appends two rules per peer node: one for the `replication`
//! pseudo-database and one for the monitored database.  Appends are
//! idempotent: a rule already present (matched at the start of a line) is
//! never appended again, so re-running an edit leaves the file
//! byte-identical.

use camino::Utf8Path;
use slog::{debug, warn, Logger};
use std::fmt;
use std::fs;
use std::net::{IpAddr, ToSocketAddrs};
use thiserror::Error;
use warden_common::node::NodeAddress;

/// Marker appended after every rule we own.
const HBA_LINE_COMMENT: &str = " # Auto-generated by pgwarden";

#[derive(Debug, Error)]
pub enum HbaError {
    #[error("failed to read {path}")]
    Read {
        path: String,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to write {path}")]
    Write {
        path: String,
        #[source]
        err: std::io::Error,
    },
}

/// The database column of a rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HbaDatabase {
    Replication,
    Named(String),
}

impl fmt::Display for HbaDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HbaDatabase::Replication => f.write_str("replication"),
            HbaDatabase::Named(name) => f.write_str(name),
        }
    }
}

/// One host rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HbaRule {
    pub ssl: bool,
    pub database: HbaDatabase,
    pub username: String,
    /// IP address or hostname of the peer; IPs get their single-host CIDR
    /// suffix when rendered.
    pub address: String,
    pub auth_method: String,
}

impl HbaRule {
    /// Renders the rule line, without the trailing marker comment.
    pub fn render(&self) -> String {
        let host_type = if self.ssl { "hostssl" } else { "host" };
        format!(
            "{} {} {} {} {}",
            host_type,
            self.database,
            self.username,
            format_address(&self.address),
            self.auth_method,
        )
    }
}

/// A plain IP address becomes a single-host CIDR (`/32` for IPv4, `/128`
/// for IPv6); anything else is taken to be a hostname and kept bare.
fn format_address(address: &str) -> String {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => format!("{}/32", ip),
        Ok(IpAddr::V6(ip)) => format!("{}/128", ip),
        Err(_) => address.to_string(),
    }
}

/// Postgres matches HBA hostnames against the reverse lookup of the
/// client address.  We cannot check that from here, but a name that does
/// not even resolve forward is certainly going to fail; warn early.
fn check_hostname(log: &Logger, address: &str) {
    if address.parse::<IpAddr>().is_ok() {
        return;
    }
    let resolves = (address, 0u16)
        .to_socket_addrs()
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false);
    if !resolves {
        warn!(log, "HBA hostname {:?} does not resolve; \
             Postgres will reject connections matched by name", address);
    }
}

/// Ensures the rule is present in the HBA file.  Returns true when the
/// file was modified.  With `skip_edits` (the `--skip-pg-hba` mode), the
/// file is left alone and the needed rule is only logged.
pub fn ensure_host_rule_exists(
    log: &Logger,
    hba_path: &Utf8Path,
    rule: &HbaRule,
    skip_edits: bool,
) -> Result<bool, HbaError> {
    let line = rule.render();
    let contents = fs::read_to_string(hba_path).map_err(|err| {
        HbaError::Read { path: hba_path.to_string(), err }
    })?;

    if line_exists(&contents, &line) {
        debug!(log, "HBA rule already present"; "rule" => line.as_str());
        return Ok(false);
    }

    if skip_edits {
        warn!(log, "skipping HBA edit, add this rule yourself";
            "rule" => line.as_str(), "path" => hba_path.as_str());
        return Ok(false);
    }

    check_hostname(log, &rule.address);

    let mut new_contents = contents;
    if !new_contents.is_empty() && !new_contents.ends_with('\n') {
        new_contents.push('\n');
    }
    new_contents.push_str(&line);
    new_contents.push_str(HBA_LINE_COMMENT);
    new_contents.push('\n');

    // write-temp-then-rename, so that Postgres never reloads a torn file
    let temp_path = hba_path.with_extension("conf.new");
    fs::write(&temp_path, &new_contents).map_err(|err| HbaError::Write {
        path: temp_path.to_string(),
        err,
    })?;
    fs::rename(&temp_path, hba_path).map_err(|err| HbaError::Write {
        path: hba_path.to_string(),
        err,
    })?;

    debug!(log, "appended HBA rule"; "rule" => line.as_str());
    Ok(true)
}

/// Ensures the two rules for one peer: replication plus the monitored
/// database.
pub fn ensure_rules_for_peer(
    log: &Logger,
    hba_path: &Utf8Path,
    dbname: &str,
    username: &str,
    peer: &NodeAddress,
    ssl: bool,
    auth_method: &str,
    skip_edits: bool,
) -> Result<bool, HbaError> {
    let mut changed = false;
    for database in
        [HbaDatabase::Replication, HbaDatabase::Named(dbname.to_string())]
    {
        let rule = HbaRule {
            ssl,
            database,
            username: username.to_string(),
            address: peer.host.clone(),
            auth_method: auth_method.to_string(),
        };
        changed |=
            ensure_host_rule_exists(log, hba_path, &rule, skip_edits)?;
    }
    Ok(changed)
}

/// True when `line` appears at the start of the file or right after a
/// newline.  Matching on the rendered rule (not the marker comment) also
/// recognizes rules the operator added by hand.
fn line_exists(contents: &str, line: &str) -> bool {
    contents
        .match_indices(line)
        .any(|(idx, _)| idx == 0 || contents.as_bytes()[idx - 1] == b'\n')
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::o;
    use warden_common::lsn::Lsn;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn scratch_hba(contents: &str) -> (tempfile::TempDir, camino::Utf8PathBuf)
    {
        let dir = tempfile::tempdir().unwrap();
        let path =
            camino::Utf8PathBuf::from_path_buf(dir.path().join("pg_hba.conf"))
                .unwrap();
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    fn sample_rule() -> HbaRule {
        HbaRule {
            ssl: false,
            database: HbaDatabase::Replication,
            username: "pgwarden_replicator".to_string(),
            address: "10.0.0.2".to_string(),
            auth_method: "trust".to_string(),
        }
    }

    #[test]
    fn renders_cidr_for_ip_addresses() {
        assert_eq!(
            sample_rule().render(),
            "host replication pgwarden_replicator 10.0.0.2/32 trust"
        );

        let v6 = HbaRule { address: "fd00::2".to_string(), ..sample_rule() };
        assert_eq!(
            v6.render(),
            "host replication pgwarden_replicator fd00::2/128 trust"
        );

        let name =
            HbaRule { address: "pg-2.internal".to_string(), ..sample_rule() };
        assert_eq!(
            name.render(),
            "host replication pgwarden_replicator pg-2.internal trust"
        );
    }

    #[test]
    fn hostssl_when_ssl() {
        let rule = HbaRule { ssl: true, ..sample_rule() };
        assert!(rule.render().starts_with("hostssl "));
    }

    #[test]
    fn append_then_noop() {
        let log = test_logger();
        let (_dir, path) = scratch_hba("local all all trust\n");
        let rule = sample_rule();

        assert!(ensure_host_rule_exists(&log, &path, &rule, false).unwrap());
        let after_first = fs::read(&path).unwrap();
        assert!(String::from_utf8_lossy(&after_first)
            .contains("# Auto-generated by pgwarden"));

        // second call must leave the file byte-identical
        assert!(!ensure_host_rule_exists(&log, &path, &rule, false).unwrap());
        assert_eq!(fs::read(&path).unwrap(), after_first);
    }

    #[test]
    fn substring_in_midline_does_not_count() {
        let log = test_logger();
        let rule = sample_rule();
        // the rule text occurs, but not at a line start
        let (_dir, path) =
            scratch_hba(&format!("# disabled: {}\n", rule.render()));

        assert!(ensure_host_rule_exists(&log, &path, &rule, false).unwrap());
        let contents = fs::read_to_string(&path).unwrap();
        assert!(line_exists(&contents, &rule.render()));
    }

    #[test]
    fn operator_added_rule_is_recognized() {
        let log = test_logger();
        let rule = sample_rule();
        let (_dir, path) = scratch_hba(&format!("{}\n", rule.render()));

        assert!(!ensure_host_rule_exists(&log, &path, &rule, false).unwrap());
    }

    #[test]
    fn skip_mode_never_writes() {
        let log = test_logger();
        let (_dir, path) = scratch_hba("local all all trust\n");
        let before = fs::read(&path).unwrap();

        assert!(!ensure_host_rule_exists(&log, &path, &sample_rule(), true)
            .unwrap());
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn peer_rules_come_in_pairs() {
        let log = test_logger();
        let (_dir, path) = scratch_hba("");
        let peer = NodeAddress {
            node_id: 2,
            nodename: "node-b".to_string(),
            host: "10.0.0.2".to_string(),
            port: 5432,
            reported_lsn: Lsn::INVALID,
        };

        assert!(ensure_rules_for_peer(
            &log, &path, "appdb", "pgwarden_replicator", &peer, false,
            "scram-sha-256", false,
        )
        .unwrap());

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains(
            "host replication pgwarden_replicator 10.0.0.2/32 scram-sha-256"
        ));
        assert!(contents.contains(
            "host appdb pgwarden_replicator 10.0.0.2/32 scram-sha-256"
        ));
        assert_eq!(contents.lines().count(), 2);
    }
}
