// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Service wiring: which children the supervisor runs on each kind of
//! node, and the entrypoints those children execute.
//!
//! Children are re-executions of the pgwarden binary (`pgwarden do
//! service <name>`); each child process installs its own signal handlers
//! and logger, so the processes share nothing but the PID file.

use crate::config::Config;
use crate::keeper::Keeper;
use crate::paths::Paths;
use crate::postgres::PostgresController;
use crate::signals::ShutdownFlags;
use crate::state::StateStore;
use crate::supervisor::{RestartPolicy, ServiceSpec};
use anyhow::Context;
use camino::Utf8Path;
use slog::{info, o, warn, Logger};
use std::time::Duration;
use warden_common::roles::NodeRole;

pub const SERVICE_POSTGRES: &str = "postgres";
pub const SERVICE_KEEPER: &str = "keeper";
pub const SERVICE_LISTENER: &str = "listener";

/// Cadence of the postgres service's convergence loop.
const POSTGRES_SERVICE_INTERVAL: Duration = Duration::from_secs(1);

fn service_spec(
    name: &str,
    policy: RestartPolicy,
    pgdata: &Utf8Path,
) -> ServiceSpec {
    let exe = std::env::current_exe()
        .ok()
        .and_then(|p| p.to_str().map(String::from))
        .unwrap_or_else(|| "pgwarden".to_string());
    ServiceSpec {
        name: name.to_string(),
        policy,
        argv: vec![
            exe,
            "do".to_string(),
            "service".to_string(),
            name.to_string(),
            "--pgdata".to_string(),
            pgdata.to_string(),
        ],
    }
}

/// Services of a data node: the managed Postgres and the keeper loop.
pub fn data_node_services(pgdata: &Utf8Path) -> Vec<ServiceSpec> {
    vec![
        service_spec(SERVICE_POSTGRES, RestartPolicy::Permanent, pgdata),
        service_spec(SERVICE_KEEPER, RestartPolicy::Permanent, pgdata),
    ]
}

/// Services of a monitor node: its Postgres and the LISTEN watcher.
pub fn monitor_node_services(pgdata: &Utf8Path) -> Vec<ServiceSpec> {
    vec![
        service_spec(SERVICE_POSTGRES, RestartPolicy::Permanent, pgdata),
        service_spec(SERVICE_LISTENER, RestartPolicy::Permanent, pgdata),
    ]
}

/// Entrypoint of the `postgres` service child.
///
/// Converges the local instance toward what the current role expects: on
/// a data node the keeper's state file says whether Postgres should run;
/// on a monitor node (no keeper state) it should always run.
pub async fn run_postgres_service(
    log: &Logger,
    config: &Config,
    flags: &ShutdownFlags,
) -> anyhow::Result<()> {
    let log = log.new(o!("component" => "PostgresService"));
    let postgres = PostgresController::new(
        &log,
        config.postgresql.pgdata.clone(),
        config.postgresql.pgport,
        config.postgresql.dbname.clone(),
        config.postgresql.listen_addresses.clone(),
        config.postgresql.bindir.clone(),
        config.replication.maximum_backup_rate.clone(),
    );
    let paths = Paths::for_pgdata(&config.postgresql.pgdata);
    let store = StateStore::new(paths.state.clone());

    info!(log, "postgres service is starting");
    while !flags.should_stop() {
        let should_run = if store.exists() {
            match store.read() {
                Ok(state) => {
                    state.current_role.requires_postgres_running()
                        || state.current_role == NodeRole::Init
                }
                Err(error) => {
                    warn!(log, "cannot read keeper state, leaving \
                        Postgres alone"; "error" => %error);
                    tokio::time::sleep(POSTGRES_SERVICE_INTERVAL).await;
                    continue;
                }
            }
        } else {
            // monitor node, or a data node before registration
            true
        };

        let result = if should_run {
            // only start servers that have been initialized; initdb is
            // the keeper's decision, not ours
            if config
                .postgresql
                .pgdata
                .join("PG_VERSION")
                .as_std_path()
                .exists()
            {
                postgres.ensure_running().await
            } else {
                Ok(())
            }
        } else {
            postgres.ensure_stopped(flags.should_stop_fast()).await
        };
        if let Err(error) = result {
            warn!(log, "failed to converge Postgres";
                "should_run" => should_run, "error" => %error);
        }

        tokio::time::sleep(POSTGRES_SERVICE_INTERVAL).await;
    }

    // Leave Postgres running on a smart stop; `pgwarden stop` of the
    // whole node goes through the keeper's own shutdown.
    info!(log, "postgres service is stopping");
    Ok(())
}

/// Entrypoint of the `keeper` service child.
pub async fn run_keeper_service(
    log: &Logger,
    config: &Config,
    flags: &ShutdownFlags,
) -> anyhow::Result<()> {
    let mut keeper = Keeper::new(log, config.clone(), flags.clone())
        .context("failed to initialize the keeper")?;
    keeper.run().await.context("keeper loop failed")
}

/// Entrypoint of the `listener` service child.
pub async fn run_listener_service(
    log: &Logger,
    config: &Config,
    flags: &ShutdownFlags,
) -> anyhow::Result<()> {
    crate::listener::run(log, config, flags).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn data_node_runs_postgres_and_keeper() {
        let services = data_node_services(Utf8Path::new("/srv/pg/a"));
        let names: Vec<&str> =
            services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![SERVICE_POSTGRES, SERVICE_KEEPER]);
        assert!(services
            .iter()
            .all(|s| s.policy == RestartPolicy::Permanent));
    }

    #[test]
    fn monitor_node_runs_postgres_and_listener() {
        let services = monitor_node_services(Utf8Path::new("/srv/pg/m"));
        let names: Vec<&str> =
            services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![SERVICE_POSTGRES, SERVICE_LISTENER]);
    }

    #[test]
    fn service_argv_reexecs_with_pgdata() {
        let spec = service_spec(
            SERVICE_KEEPER,
            RestartPolicy::Permanent,
            Utf8Path::new("/srv/pg/a"),
        );
        assert_eq!(
            &spec.argv[1..],
            &[
                "do".to_string(),
                "service".to_string(),
                "keeper".to_string(),
                "--pgdata".to_string(),
                "/srv/pg/a".to_string(),
            ]
        );
    }
}
