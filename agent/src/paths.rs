// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Where pgwarden keeps its files for a given data directory.
//!
//! Each Postgres data directory gets its own configuration and state
//! directories, derived from the XDG base directories so that several
//! keepers can coexist on one host:
//!
//! ```text
//! $XDG_CONFIG_HOME/pgwarden/<escaped pgdata>/pgwarden.cfg
//! $XDG_DATA_HOME/pgwarden/<escaped pgdata>/pgwarden.state
//! $XDG_DATA_HOME/pgwarden/<escaped pgdata>/pgwarden.init
//! $XDG_DATA_HOME/pgwarden/<escaped pgdata>/pgwarden.pid
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use std::env;

/// All the paths the keeper reads or writes outside of PGDATA itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paths {
    pub config: Utf8PathBuf,
    pub state: Utf8PathBuf,
    pub init: Utf8PathBuf,
    pub pid: Utf8PathBuf,
}

impl Paths {
    /// Computes the file layout for `pgdata`, honoring `XDG_CONFIG_HOME`
    /// and `XDG_DATA_HOME` overrides.
    pub fn for_pgdata(pgdata: &Utf8Path) -> Paths {
        let escaped = escape_pgdata(pgdata);
        let config_home = xdg_dir("XDG_CONFIG_HOME", ".config");
        let data_home = xdg_dir("XDG_DATA_HOME", ".local/share");

        let config_dir = config_home.join("pgwarden").join(&escaped);
        let data_dir = data_home.join("pgwarden").join(&escaped);

        Paths {
            config: config_dir.join("pgwarden.cfg"),
            state: data_dir.join("pgwarden.state"),
            init: data_dir.join("pgwarden.init"),
            pid: data_dir.join("pgwarden.pid"),
        }
    }

    /// The PGDATA value, from `--pgdata` or the environment.
    pub fn resolve_pgdata(
        option: Option<&Utf8Path>,
    ) -> Option<Utf8PathBuf> {
        match option {
            Some(p) => Some(p.to_owned()),
            None => env::var("PGDATA").ok().map(Utf8PathBuf::from),
        }
    }
}

/// Flattens an absolute path into a single component,
/// `/var/lib/postgres/data` becoming `var_lib_postgres_data`.
fn escape_pgdata(pgdata: &Utf8Path) -> String {
    pgdata
        .as_str()
        .trim_matches('/')
        .replace('/', "_")
}

fn xdg_dir(var: &str, home_suffix: &str) -> Utf8PathBuf {
    if let Ok(dir) = env::var(var) {
        if !dir.is_empty() {
            return Utf8PathBuf::from(dir);
        }
    }
    let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    Utf8PathBuf::from(home).join(home_suffix)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn escaping_flattens_slashes() {
        assert_eq!(
            escape_pgdata(Utf8Path::new("/var/lib/postgres/data")),
            "var_lib_postgres_data"
        );
        assert_eq!(escape_pgdata(Utf8Path::new("data")), "data");
    }

    #[test]
    fn layout_is_derived_from_pgdata() {
        let paths = Paths::for_pgdata(Utf8Path::new("/srv/pg/node1"));
        assert!(paths.config.as_str().ends_with(
            "pgwarden/srv_pg_node1/pgwarden.cfg"
        ));
        assert!(paths
            .state
            .as_str()
            .ends_with("pgwarden/srv_pg_node1/pgwarden.state"));
        assert!(paths.pid.as_str().ends_with("pgwarden.pid"));
        assert_ne!(paths.state, paths.init);
    }
}
