// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the pgwarden keeper and its tooling.

use camino::Utf8PathBuf;
use clap::{ArgAction, Args, Parser, Subcommand};
use slog::{info, Logger};
use warden_agent::config::{
    Config, KeeperSection, PostgresqlSection, ReplicationSection,
    SslSection, TimeoutSection,
};
use warden_agent::keeper::{Keeper, KeeperError, KeeperStatus};
use warden_agent::logging::{level_from_verbosity, root_logger, LogFormat};
use warden_agent::paths::Paths;
use warden_agent::pidfile;
use warden_agent::postgres::PostgresController;
use warden_agent::service;
use warden_agent::signals::ShutdownFlags;
use warden_agent::state::StateStore;
use warden_agent::supervisor::{Supervisor, SupervisorError, SupervisorOutcome};
use warden_common::cmd::{fatal, CmdError};
use warden_common::roles::NodeRole;
use warden_monitor_client::MonitorClient;

#[derive(Debug, Parser)]
#[command(
    name = "pgwarden",
    about = "Postgres high availability keeper",
    version
)]
struct Cli {
    /// Postgres data directory (defaults to $PGDATA).
    #[arg(long, global = true, env = "PGDATA")]
    pgdata: Option<Utf8PathBuf>,

    /// Increase logging verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Line-oriented JSON output, for logs and read commands.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Create a new node and register it.
    #[command(subcommand)]
    Create(CreateCommand),

    /// Run the supervisor and its services for this node.
    Run,

    /// Signal a running supervisor to stop.
    Stop {
        /// Interrupt the current action instead of finishing the tick.
        #[arg(long, conflicts_with = "immediate")]
        fast: bool,
        /// Abort outright.
        #[arg(long)]
        immediate: bool,
    },

    /// Signal a running supervisor to reload its configuration.
    Reload,

    /// Summarize this node's state.
    Status,

    /// Show cluster information.
    #[command(subcommand)]
    Show(ShowCommand),

    /// Put this node into maintenance.
    #[command(subcommand)]
    Enable(MaintenanceCommand),

    /// Take this node out of maintenance.
    #[command(subcommand)]
    Disable(MaintenanceCommand),

    /// Remove this node from its formation.
    #[command(subcommand)]
    Drop(DropCommand),

    /// Internal plumbing.
    #[command(subcommand, hide = true)]
    Do(DoCommand),
}

#[derive(Debug, Subcommand)]
enum CreateCommand {
    /// Initialize a data node and register it with the monitor.
    Postgres(CreatePostgresArgs),
    /// Initialize a monitor node.
    Monitor(CreateMonitorArgs),
}

#[derive(Debug, Args)]
struct CreatePostgresArgs {
    /// Connection URI of the monitor.
    #[arg(long)]
    monitor: String,
    /// Name this node registers under (defaults to the hostname).
    #[arg(long)]
    nodename: Option<String>,
    /// Host other nodes use to reach this one.
    #[arg(long)]
    hostname: String,
    #[arg(long, default_value_t = 5432)]
    pgport: u16,
    #[arg(long, default_value = "default")]
    formation: String,
    /// Group within the formation (assigned by the monitor when absent).
    #[arg(long)]
    group: Option<i32>,
    /// Database name covered by the generated HBA rules.
    #[arg(long, default_value = "postgres")]
    dbname: String,
    /// Authentication method for generated HBA rules.
    #[arg(long, default_value = "trust")]
    auth: String,
    /// Do not edit pg_hba.conf; only log the rules that are needed.
    #[arg(long)]
    skip_pg_hba: bool,
    /// Provision server TLS (hostssl rules, ssl=on).
    #[arg(long)]
    ssl: bool,
    /// Server certificate, when --ssl is set.
    #[arg(long, requires = "ssl")]
    ssl_cert_file: Option<Utf8PathBuf>,
    /// Server private key, when --ssl is set.
    #[arg(long, requires = "ssl")]
    ssl_key_file: Option<Utf8PathBuf>,
    /// CA certificate used to verify peers, when --ssl is set.
    #[arg(long, requires = "ssl")]
    ssl_ca_file: Option<Utf8PathBuf>,
    /// Keep running (supervisor and services) after registration.
    #[arg(long)]
    run: bool,
}

#[derive(Debug, Args)]
struct CreateMonitorArgs {
    #[arg(long, default_value_t = 5432)]
    pgport: u16,
    #[arg(long, default_value = "pg_auto_failover")]
    dbname: String,
    #[arg(long, default_value = "trust")]
    auth: String,
    #[arg(long)]
    run: bool,
}

#[derive(Debug, Subcommand)]
enum ShowCommand {
    /// This node's role and the peers the monitor knows about.
    State,
    /// The monitor URI this node reports to.
    Uri,
}

#[derive(Debug, Subcommand)]
enum MaintenanceCommand {
    Maintenance,
}

#[derive(Debug, Subcommand)]
enum DropCommand {
    Node {
        /// Do not ask the monitor first; just retire local state.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
enum DoCommand {
    /// Run one supervised service in the foreground.
    Service {
        #[command(subcommand)]
        which: ServiceCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ServiceCommand {
    Postgres,
    Keeper,
    Listener,
}

#[tokio::main]
async fn main() {
    if let Err(error) = do_run().await {
        fatal(error);
    }
}

fn keeper_error_to_cmd(error: KeeperError) -> CmdError {
    let message = error.to_string();
    match error {
        KeeperError::State(_)
        | KeeperError::PidFile(_)
        | KeeperError::IdentityMismatch { .. } => CmdError::BadState(message),
        KeeperError::Monitor(_) => CmdError::Monitor(message),
        KeeperError::Postgres(_) | KeeperError::Hba(_) => CmdError::PgCtl(message),
        KeeperError::Config(_) | KeeperError::NoMonitor => {
            CmdError::BadConfig(message)
        }
        KeeperError::NoTransition { .. } => CmdError::Internal(message),
    }
}

async fn do_run() -> Result<(), CmdError> {
    let cli = Cli::try_parse().map_err(|err| {
        // clap renders --help and --version through the same error path
        if err.use_stderr() {
            CmdError::Usage(err.to_string())
        } else {
            err.print().ok();
            std::process::exit(0);
        }
    })?;

    let format =
        if cli.json { LogFormat::Json } else { LogFormat::Terminal };
    let log = root_logger(level_from_verbosity(cli.verbose), format);

    match cli.command {
        CliCommand::Create(CreateCommand::Postgres(args)) => {
            create_postgres(&log, cli.pgdata, args).await
        }
        CliCommand::Create(CreateCommand::Monitor(args)) => {
            create_monitor(&log, cli.pgdata, args).await
        }
        CliCommand::Run => run_node(&log, cli.pgdata).await,
        CliCommand::Stop { fast, immediate } => {
            let signal = if immediate {
                libc::SIGQUIT
            } else if fast {
                libc::SIGINT
            } else {
                libc::SIGTERM
            };
            signal_supervisor(cli.pgdata, signal)
        }
        CliCommand::Reload => signal_supervisor(cli.pgdata, libc::SIGHUP),
        CliCommand::Status => status(&log, cli.pgdata, cli.json).await,
        CliCommand::Show(ShowCommand::State) => {
            show_state(&log, cli.pgdata, cli.json).await
        }
        CliCommand::Show(ShowCommand::Uri) => {
            show_uri(cli.pgdata, cli.json)
        }
        CliCommand::Enable(MaintenanceCommand::Maintenance) => {
            maintenance(&log, cli.pgdata, true).await
        }
        CliCommand::Disable(MaintenanceCommand::Maintenance) => {
            maintenance(&log, cli.pgdata, false).await
        }
        CliCommand::Drop(DropCommand::Node { force }) => {
            drop_node(&log, cli.pgdata, force).await
        }
        CliCommand::Do(DoCommand::Service { which }) => {
            run_service(&log, cli.pgdata, which).await
        }
    }
}

fn require_pgdata(pgdata: Option<Utf8PathBuf>) -> Result<Utf8PathBuf, CmdError>
{
    Paths::resolve_pgdata(pgdata.as_deref()).ok_or_else(|| {
        CmdError::Usage(
            "no data directory: pass --pgdata or set PGDATA".to_string(),
        )
    })
}

fn load_config(pgdata: &Utf8PathBuf) -> Result<(Config, Paths), CmdError> {
    let paths = Paths::for_pgdata(pgdata);
    let config = Config::from_file(&paths.config)
        .map_err(|e| CmdError::BadConfig(e.to_string()))?;
    Ok((config, paths))
}

async fn create_postgres(
    log: &Logger,
    pgdata: Option<Utf8PathBuf>,
    args: CreatePostgresArgs,
) -> Result<(), CmdError> {
    let pgdata = require_pgdata(pgdata)?;
    let paths = Paths::for_pgdata(&pgdata);

    let nodename = match args.nodename {
        Some(name) => name,
        None => args.hostname.clone(),
    };
    let config = Config {
        keeper: KeeperSection {
            monitor: Some(args.monitor),
            formation: args.formation,
            group: args.group,
            nodename,
            hostname: args.hostname,
        },
        postgresql: PostgresqlSection {
            pgdata: pgdata.clone(),
            pgport: args.pgport,
            dbname: args.dbname,
            listen_addresses: "*".to_string(),
            auth_method: args.auth,
            skip_hba: args.skip_pg_hba,
            bindir: None,
        },
        replication: ReplicationSection::default(),
        ssl: SslSection {
            active: args.ssl,
            cert_file: args.ssl_cert_file,
            key_file: args.ssl_key_file,
            ca_file: args.ssl_ca_file,
        },
        timeout: TimeoutSection::default(),
    };
    config
        .write_file(&paths.config)
        .map_err(|e| CmdError::BadConfig(e.to_string()))?;
    info!(log, "wrote configuration"; "path" => paths.config.as_str());

    let flags = ShutdownFlags::install(log)
        .map_err(|e| CmdError::Internal(e.to_string()))?;
    let mut keeper = Keeper::new(log, config, flags)
        .map_err(keeper_error_to_cmd)?;
    // The monitor assigns the actual initial role; asking for `single`
    // merely states we are willing to be the first node of the group.
    keeper
        .register(NodeRole::Single)
        .await
        .map_err(keeper_error_to_cmd)?;

    if args.run {
        run_node(log, Some(pgdata)).await
    } else {
        info!(log, "node created; start it with `pgwarden run`");
        Ok(())
    }
}

async fn create_monitor(
    log: &Logger,
    pgdata: Option<Utf8PathBuf>,
    args: CreateMonitorArgs,
) -> Result<(), CmdError> {
    let pgdata = require_pgdata(pgdata)?;
    let paths = Paths::for_pgdata(&pgdata);

    let config = Config {
        keeper: KeeperSection {
            monitor: None,
            formation: "monitor".to_string(),
            group: None,
            nodename: "monitor".to_string(),
            hostname: "localhost".to_string(),
        },
        postgresql: PostgresqlSection {
            pgdata: pgdata.clone(),
            pgport: args.pgport,
            dbname: args.dbname,
            listen_addresses: "*".to_string(),
            auth_method: args.auth.clone(),
            skip_hba: false,
            bindir: None,
        },
        replication: ReplicationSection::default(),
        ssl: SslSection::default(),
        timeout: TimeoutSection::default(),
    };
    config
        .write_file(&paths.config)
        .map_err(|e| CmdError::BadConfig(e.to_string()))?;

    let postgres = PostgresController::new(
        log,
        pgdata.clone(),
        args.pgport,
        config.postgresql.dbname.clone(),
        config.postgresql.listen_addresses.clone(),
        None,
        config.replication.maximum_backup_rate.clone(),
    );
    postgres
        .initdb(&args.auth)
        .await
        .map_err(|e| CmdError::PgCtl(e.to_string()))?;
    postgres
        .ensure_running()
        .await
        .map_err(|e| CmdError::PgCtl(e.to_string()))?;
    info!(log, "monitor is ready";
        "uri" => format!("postgres://localhost:{}/{}",
            args.pgport, config.postgresql.dbname));

    if args.run {
        run_node(log, Some(pgdata)).await
    } else {
        Ok(())
    }
}

async fn run_node(
    log: &Logger,
    pgdata: Option<Utf8PathBuf>,
) -> Result<(), CmdError> {
    let pgdata = require_pgdata(pgdata)?;
    let (config, paths) = load_config(&pgdata)?;

    let services = if config.keeper.monitor.is_some() {
        service::data_node_services(&pgdata)
    } else {
        service::monitor_node_services(&pgdata)
    };

    let flags = ShutdownFlags::install(log)
        .map_err(|e| CmdError::Internal(e.to_string()))?;
    let mut supervisor =
        Supervisor::new(log, paths.pid.clone(), services, flags);

    match supervisor.run().await {
        Ok(SupervisorOutcome::Clean) => Ok(()),
        Ok(SupervisorOutcome::Failed) => Err(CmdError::Internal(
            "services stopped after repeated failures".to_string(),
        )),
        Err(SupervisorError::AlreadyRunning { pid }) => {
            Err(CmdError::BadState(format!(
                "pgwarden is already running with PID {}",
                pid
            )))
        }
        Err(err) => Err(CmdError::Internal(err.to_string())),
    }
}

fn signal_supervisor(
    pgdata: Option<Utf8PathBuf>,
    signal: i32,
) -> Result<(), CmdError> {
    let pgdata = require_pgdata(pgdata)?;
    let paths = Paths::for_pgdata(&pgdata);
    let pid = pidfile::live_owner(&paths.pid)
        .map_err(|e| CmdError::BadState(e.to_string()))?
        .ok_or_else(|| {
            CmdError::BadState(format!(
                "pgwarden is not running for {}",
                pgdata
            ))
        })?;
    if unsafe { libc::kill(pid as libc::pid_t, signal) } != 0 {
        return Err(CmdError::Internal(format!(
            "failed to signal PID {}",
            pid
        )));
    }
    Ok(())
}

async fn build_status(
    log: &Logger,
    pgdata: &Utf8PathBuf,
) -> Result<KeeperStatus, CmdError> {
    let (config, paths) = load_config(pgdata)?;
    let store = StateStore::new(paths.state.clone());
    let state =
        store.read().map_err(|e| CmdError::BadState(e.to_string()))?;
    let postgres = PostgresController::new(
        log,
        config.postgresql.pgdata.clone(),
        config.postgresql.pgport,
        config.postgresql.dbname.clone(),
        config.postgresql.listen_addresses.clone(),
        config.postgresql.bindir.clone(),
        config.replication.maximum_backup_rate.clone(),
    );
    let pg_state = postgres.probe().await.unwrap_or_default();
    Ok(KeeperStatus {
        formation: config.keeper.formation.clone(),
        group_id: state.current_group,
        node_id: state.current_node_id,
        nodename: config.keeper.nodename.clone(),
        current_role: state.current_role,
        assigned_role: state.assigned_role,
        pg_is_running: pg_state.pg_is_running,
        current_lsn: if pg_state.current_lsn.is_valid() {
            pg_state.current_lsn
        } else {
            state.xlog_location
        },
        last_monitor_contact: state.last_monitor_contact,
    })
}

async fn status(
    log: &Logger,
    pgdata: Option<Utf8PathBuf>,
    json: bool,
) -> Result<(), CmdError> {
    let pgdata = require_pgdata(pgdata)?;
    let status = build_status(log, &pgdata).await?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status)
                .map_err(|e| CmdError::Internal(e.to_string()))?
        );
    } else {
        println!(
            "node {}/{}/{} ({}): {} (assigned {}), postgres {}, lsn {}",
            status.formation,
            status.group_id,
            status.node_id,
            status.nodename,
            status.current_role,
            status.assigned_role,
            if status.pg_is_running { "running" } else { "not running" },
            status.current_lsn,
        );
    }
    Ok(())
}

async fn show_state(
    log: &Logger,
    pgdata: Option<Utf8PathBuf>,
    json: bool,
) -> Result<(), CmdError> {
    let pgdata = require_pgdata(pgdata)?;
    let (config, paths) = load_config(&pgdata)?;
    let status = build_status(log, &pgdata).await?;

    let peers = match &config.keeper.monitor {
        Some(uri) => {
            let store = StateStore::new(paths.state.clone());
            let state = store
                .read()
                .map_err(|e| CmdError::BadState(e.to_string()))?;
            let monitor = MonitorClient::new(log, uri)
                .map_err(|e| CmdError::Monitor(e.to_string()))?;
            monitor
                .get_other_nodes(state.current_node_id)
                .await
                .map_err(|e| CmdError::Monitor(e.to_string()))?
        }
        None => Vec::new(),
    };

    if json {
        let doc = serde_json::json!({
            "node": status,
            "peers": peers,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&doc)
                .map_err(|e| CmdError::Internal(e.to_string()))?
        );
    } else {
        println!(
            "{:>8} | {:>5} | {:<20} | {:<18} | {}",
            "node", "group", "host:port", "role", "reported lsn"
        );
        println!(
            "{:>8} | {:>5} | {:<20} | {:<18} | {}",
            status.node_id,
            status.group_id,
            format!("{}:{}", status.nodename, config.postgresql.pgport),
            format!("{}", status.current_role),
            status.current_lsn,
        );
        for peer in peers {
            println!(
                "{:>8} | {:>5} | {:<20} | {:<18} | {}",
                peer.node_id,
                status.group_id,
                format!("{}:{}", peer.host, peer.port),
                "-",
                peer.reported_lsn,
            );
        }
    }
    Ok(())
}

fn show_uri(
    pgdata: Option<Utf8PathBuf>,
    json: bool,
) -> Result<(), CmdError> {
    let pgdata = require_pgdata(pgdata)?;
    let (config, _paths) = load_config(&pgdata)?;
    let uri = match &config.keeper.monitor {
        Some(uri) => uri.clone(),
        None => format!(
            "postgres://{}:{}/{}",
            config.keeper.hostname,
            config.postgresql.pgport,
            config.postgresql.dbname
        ),
    };
    if json {
        println!(
            "{}",
            serde_json::json!({ "monitor": uri })
        );
    } else {
        println!("{}", uri);
    }
    Ok(())
}

async fn maintenance(
    log: &Logger,
    pgdata: Option<Utf8PathBuf>,
    enable: bool,
) -> Result<(), CmdError> {
    let pgdata = require_pgdata(pgdata)?;
    let (config, paths) = load_config(&pgdata)?;
    let uri = config.keeper.monitor.as_ref().ok_or_else(|| {
        CmdError::BadConfig("this node has no monitor".to_string())
    })?;
    let store = StateStore::new(paths.state.clone());
    let state =
        store.read().map_err(|e| CmdError::BadState(e.to_string()))?;
    let monitor = MonitorClient::new(log, uri)
        .map_err(|e| CmdError::Monitor(e.to_string()))?;

    let accepted = if enable {
        monitor.start_maintenance(state.current_node_id).await
    } else {
        monitor.stop_maintenance(state.current_node_id).await
    }
    .map_err(|e| CmdError::Monitor(e.to_string()))?;

    if !accepted {
        return Err(CmdError::Monitor(format!(
            "monitor refused to {} maintenance for node {}",
            if enable { "start" } else { "stop" },
            state.current_node_id,
        )));
    }
    info!(log, "maintenance {}", if enable { "enabled" } else { "disabled" };
        "node_id" => state.current_node_id);
    Ok(())
}

async fn drop_node(
    log: &Logger,
    pgdata: Option<Utf8PathBuf>,
    force: bool,
) -> Result<(), CmdError> {
    let pgdata = require_pgdata(pgdata)?;
    let (config, paths) = load_config(&pgdata)?;
    let store = StateStore::new(paths.state.clone());
    let state =
        store.read().map_err(|e| CmdError::BadState(e.to_string()))?;

    if let Some(uri) = &config.keeper.monitor {
        let monitor = MonitorClient::new(log, uri)
            .map_err(|e| CmdError::Monitor(e.to_string()))?;
        match monitor.remove_node(state.current_node_id).await {
            Ok(_) => (),
            Err(error) if force => {
                slog::warn!(log,
                    "monitor unreachable, dropping local state anyway";
                    "error" => %error);
            }
            Err(error) => {
                return Err(CmdError::Monitor(error.to_string()));
            }
        }
    }

    store
        .drop_file()
        .map_err(|e| CmdError::BadState(e.to_string()))?;
    info!(log, "node dropped"; "node_id" => state.current_node_id);
    Ok(())
}

async fn run_service(
    log: &Logger,
    pgdata: Option<Utf8PathBuf>,
    which: ServiceCommand,
) -> Result<(), CmdError> {
    let pgdata = require_pgdata(pgdata)?;
    let (config, _paths) = load_config(&pgdata)?;
    let flags = ShutdownFlags::install(log)
        .map_err(|e| CmdError::Internal(e.to_string()))?;

    let result = match which {
        ServiceCommand::Postgres => {
            service::run_postgres_service(log, &config, &flags).await
        }
        ServiceCommand::Keeper => {
            service::run_keeper_service(log, &config, &flags).await
        }
        ServiceCommand::Listener => {
            service::run_listener_service(log, &config, &flags).await
        }
    };
    result.map_err(|e| CmdError::Internal(format!("{:#}", e)))
}
