// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The keeper: the node-active loop and transition execution.
//!
//! Each tick probes the local Postgres instance, reports to the monitor,
//! and converges on the assigned role by executing one transition from
//! [`crate::fsm`].  The keeper owns every handle (state store, Postgres
//! controller, monitor client) and lends them to the procedures it runs;
//! nothing here is shared between threads.
//!
//! A transport failure toward the monitor is never a state transition:
//! the keeper keeps its role and retries on the next tick.  The one
//! exception is the split-brain guard: a primary that can reach neither
//! the monitor nor any standby for longer than the configured partition
//! timeout demotes itself.

use crate::config::{Config, ConfigError};
use crate::fsm::{self, TransitionAction, TransitionEntry};
use crate::hba;
use crate::paths::Paths;
use crate::pidfile::{self, PidFileError};
use crate::postgres::{
    LocalPostgresState, PgError, PostgresController, REPLICATION_USER,
};
use crate::signals::ShutdownFlags;
use crate::state::{KeeperState, StateError, StateStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use slog::{debug, error, info, o, warn, Logger};
use std::time::Duration;
use thiserror::Error;
use warden_common::lsn::Lsn;
use warden_common::roles::NodeRole;
use warden_monitor_client::{
    AssignedState, MonitorClient, MonitorError, NodeActiveParams,
    RegisterNodeParams,
};

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Postgres(#[from] PgError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error(transparent)]
    Hba(#[from] hba::HbaError),

    #[error("no monitor URI configured for this node")]
    NoMonitor,

    /// The data directory under management is not the one the monitor
    /// registered.  Running on would risk feeding a foreign timeline into
    /// the group; only an operator can resolve this.
    #[error(
        "system identifier mismatch: state file has {expected}, \
         data directory has {actual}"
    )]
    IdentityMismatch { expected: u64, actual: u64 },

    #[error("no transition from {current} to {assigned}")]
    NoTransition { current: NodeRole, assigned: NodeRole },
}

/// Tracks one recurring failure site so the log carries a single WARN
/// when a failure streak starts and a single INFO when it clears,
/// instead of a warning on every tick.
#[derive(Debug, Default)]
struct WarnOnce {
    warned: bool,
}

impl WarnOnce {
    /// True when this failure starts a streak and deserves the warning.
    fn on_failure(&mut self) -> bool {
        !std::mem::replace(&mut self.warned, true)
    }

    /// True when this success ends a streak and deserves a recovery
    /// line.
    fn on_success(&mut self) -> bool {
        std::mem::replace(&mut self.warned, false)
    }
}

/// Read-only summary for `status` and `show state`.
#[derive(Clone, Debug, Serialize)]
pub struct KeeperStatus {
    pub formation: String,
    pub group_id: i32,
    pub node_id: i64,
    pub nodename: String,
    pub current_role: NodeRole,
    pub assigned_role: NodeRole,
    pub pg_is_running: bool,
    pub current_lsn: Lsn,
    pub last_monitor_contact: Option<DateTime<Utc>>,
}

pub struct Keeper {
    config: Config,
    paths: Paths,
    store: StateStore,
    state: KeeperState,
    postgres: PostgresController,
    monitor: MonitorClient,
    flags: ShutdownFlags,
    log: Logger,

    /// Latest local snapshot, refreshed at the top of each tick.
    pg_state: LocalPostgresState,
    /// Consecutive node_active failures.
    monitor_failures: u32,
    /// replication_quorum from the last monitor reply; governs whether a
    /// primary may relax synchronous replication when standbys vanish.
    replication_quorum: bool,
    /// Warn-once trackers for the per-tick failure sites.
    pg_state_warnings: WarnOnce,
    ensure_state_warnings: WarnOnce,
}

impl Keeper {
    pub fn new(
        log: &Logger,
        config: Config,
        flags: ShutdownFlags,
    ) -> Result<Keeper, KeeperError> {
        let monitor_uri = config
            .keeper
            .monitor
            .clone()
            .ok_or(KeeperError::NoMonitor)?;
        let log = log.new(o!("component" => "Keeper"));
        let monitor = MonitorClient::new(&log, &monitor_uri)?;
        let paths = Paths::for_pgdata(&config.postgresql.pgdata);
        let store = StateStore::new(paths.state.clone());
        let postgres = PostgresController::new(
            &log,
            config.postgresql.pgdata.clone(),
            config.postgresql.pgport,
            config.postgresql.dbname.clone(),
            config.postgresql.listen_addresses.clone(),
            config.postgresql.bindir.clone(),
            config.replication.maximum_backup_rate.clone(),
        );
        let state = store.init()?;

        Ok(Keeper {
            config,
            paths,
            store,
            state,
            postgres,
            monitor,
            flags,
            log,
            pg_state: LocalPostgresState::default(),
            monitor_failures: 0,
            replication_quorum: true,
            pg_state_warnings: WarnOnce::default(),
            ensure_state_warnings: WarnOnce::default(),
        })
    }

    pub fn state(&self) -> &KeeperState {
        &self.state
    }

    /// Builds the status summary from on-disk state and a live probe.
    pub async fn status(&mut self) -> KeeperStatus {
        self.pg_state = self.postgres.probe().await.unwrap_or_default();
        KeeperStatus {
            formation: self.config.keeper.formation.clone(),
            group_id: self.state.current_group,
            node_id: self.state.current_node_id,
            nodename: self.config.keeper.nodename.clone(),
            current_role: self.state.current_role,
            assigned_role: self.state.assigned_role,
            pg_is_running: self.pg_state.pg_is_running,
            current_lsn: self.current_lsn(),
            last_monitor_contact: self.state.last_monitor_contact,
        }
    }

    /// Registers this node with the monitor.  Run once by `create
    /// postgres`; the state file remembers the result forever after.
    pub async fn register(
        &mut self,
        wanted_initial_state: NodeRole,
    ) -> Result<(), KeeperError> {
        if self.state.current_node_id > 0 {
            debug!(self.log, "already registered";
                "node_id" => self.state.current_node_id);
            return Ok(());
        }

        // The data directory must exist to know its system identifier;
        // a standby-to-be registers before it has one and reports 0.
        let controldata = if self
            .postgres
            .pgdata()
            .join("PG_VERSION")
            .as_std_path()
            .exists()
        {
            self.postgres.controldata().await?
        } else {
            Default::default()
        };

        let params = RegisterNodeParams {
            formation: self.config.keeper.formation.clone(),
            group_id: self.config.keeper.group,
            nodename: self.config.keeper.nodename.clone(),
            host: self.config.keeper.hostname.clone(),
            port: self.config.postgresql.pgport,
            system_identifier: controldata.system_identifier,
            wanted_initial_state,
        };
        let assigned = self.monitor.register_node(&params).await?;

        info!(self.log, "registered with the monitor";
            "node_id" => assigned.node_id,
            "group_id" => assigned.group_id,
            "assigned_role" => %assigned.assigned_role);

        self.state.current_node_id = assigned.node_id;
        self.state.current_group = assigned.group_id;
        self.state.assigned_role = assigned.assigned_role;
        self.state.current_role = NodeRole::Init;
        self.state.system_identifier = controldata.system_identifier;
        self.state.pg_control_version = controldata.pg_control_version;
        self.state.catalog_version = controldata.catalog_version;
        self.state.last_monitor_contact = Some(Utc::now());
        self.store.write(&self.state)?;
        Ok(())
    }

    /// The main loop.  Returns cleanly on a stop request or once the node
    /// has been dropped from the formation.
    pub async fn run(&mut self) -> Result<(), KeeperError> {
        let service_pid = std::process::id();
        let mut first_loop = true;
        let mut do_sleep = false;

        info!(self.log, "keeper service is starting";
            "current_role" => %self.state.current_role);

        loop {
            if self.flags.take_reload() {
                self.reload_configuration();
            }
            if self.flags.should_stop() {
                break;
            }
            if do_sleep {
                tokio::time::sleep(self.config.node_active_interval()).await;
                if self.flags.should_stop() {
                    break;
                }
            }
            do_sleep = true;

            // Quit when another instance took over the data directory.
            if let Ok(Some(owner)) = pidfile::read(&self.paths.pid) {
                let ours = owner
                    .services
                    .iter()
                    .any(|(_, pid)| *pid == service_pid);
                if !ours {
                    warn!(self.log,
                        "PID file no longer lists this keeper, stopping";
                        "path" => self.paths.pid.as_str());
                    break;
                }
            }

            // Re-read the state file: if the previous tick failed to
            // persist a transition, we must not tell the monitor it
            // happened.
            if self.store.exists() {
                self.state = self.store.read()?;
            }
            if first_loop {
                self.check_identity().await?;
                info!(self.log, "keeper service is running";
                    "current_role" => %self.state.current_role);
            }

            self.update_pg_state().await;
            if self.state.current_role == NodeRole::Primary
                && self.pg_state.standby_count > 0
            {
                self.state.last_secondary_contact = Some(Utc::now());
            }

            if self.flags.should_stop_fast() {
                break;
            }

            let mut need_transition = false;
            let mut contacted = false;
            match self.call_node_active().await {
                Ok(assigned) => {
                    contacted = true;
                    self.monitor_failures = 0;
                    self.state.last_monitor_contact = Some(Utc::now());
                    let membership_changed =
                        self.absorb_assignment(&assigned);
                    if membership_changed {
                        if let Err(error) = self.refresh_hba_rules().await {
                            warn!(self.log,
                                "failed to refresh HBA rules, will retry \
                                 on the next membership change";
                                "error" => %error);
                        }
                    }
                    if self.state.assigned_role != self.state.current_role {
                        need_transition = true;
                        info!(self.log, "monitor assigned new state";
                            "assigned_role" => %self.state.assigned_role);
                    }
                }
                Err(error) => {
                    self.monitor_failures += 1;
                    error!(self.log,
                        "failed to get the goal state from the monitor";
                        "error" => %error,
                        "consecutive_failures" => self.monitor_failures);
                    if self.monitor_failures
                        >= self.config.timeout.monitor_retry_warn_ticks
                    {
                        warn!(self.log,
                            "monitor unreachable for {} ticks; keeping \
                             current role, demotion is the monitor's call",
                            self.monitor_failures);
                    }
                    if self.state.current_role == NodeRole::Primary
                        && !self.network_is_healthy()
                    {
                        warn!(self.log,
                            "neither monitor nor standby reachable, \
                             stopping writes to avoid a split brain");
                        self.state.assigned_role = NodeRole::DemoteTimeout;
                        need_transition = true;
                    }
                }
            }

            if self.flags.should_stop_fast() {
                break;
            }

            let mut transition_failed = false;
            if need_transition {
                match self.reach_assigned_state().await {
                    Ok(()) => (),
                    Err(error) => {
                        error!(self.log, "failed to transition";
                            "assigned_role" => %self.state.assigned_role,
                            "error" => %error);
                        transition_failed = true;
                        if matches!(
                            error,
                            KeeperError::IdentityMismatch { .. }
                        ) {
                            return Err(error);
                        }
                    }
                }
            } else if contacted {
                match self.ensure_current_state().await {
                    Ok(()) => {
                        if self.ensure_state_warnings.on_success() {
                            info!(self.log,
                                "managed to ensure current state";
                                "current_role" => %self.state.current_role);
                        }
                    }
                    Err(error) => {
                        if self.ensure_state_warnings.on_failure() {
                            warn!(self.log,
                                "failed to ensure current state";
                                "current_role" => %self.state.current_role,
                                "error" => %error);
                        } else {
                            debug!(self.log,
                                "still failing to ensure current state";
                                "current_role" => %self.state.current_role,
                                "error" => %error);
                        }
                    }
                }
            }

            if self.state.current_role == NodeRole::Dropped {
                // the transition already retired the state file
                info!(self.log, "node has been dropped, exiting");
                break;
            }
            self.state.xlog_location = self.current_lsn();
            self.store.write(&self.state)?;

            if need_transition && !transition_failed {
                // converge faster while walking a multi-step assignment
                do_sleep = false;
            }
            if self.flags.should_stop() {
                break;
            }
            first_loop = false;
        }

        info!(self.log, "keeper service is stopping");
        Ok(())
    }

    /// Refreshes the local snapshot, warning once per failure streak and
    /// logging one recovery line when the probe works again.
    async fn update_pg_state(&mut self) {
        match self.postgres.probe().await {
            Ok(pg_state) => {
                self.pg_state = pg_state;
                if self.pg_state_warnings.on_success() {
                    info!(self.log,
                        "updated the keeper's state from the local \
                         instance, which is {}",
                        if self.pg_state.pg_is_running {
                            "running"
                        } else {
                            "not running"
                        });
                }
            }
            Err(error) => {
                self.pg_state = LocalPostgresState::default();
                if self.pg_state_warnings.on_failure() {
                    warn!(self.log,
                        "failed to update the keeper's state from the \
                         local instance";
                        "error" => %error);
                } else {
                    debug!(self.log,
                        "still failing to update the keeper's state \
                         from the local instance";
                        "error" => %error);
                }
            }
        }
    }

    /// A `(system_identifier, group)` mismatch between the state file and
    /// the data directory is fatal.
    async fn check_identity(&mut self) -> Result<(), KeeperError> {
        if self.state.system_identifier == 0 {
            return Ok(());
        }
        if !self
            .postgres
            .pgdata()
            .join("PG_VERSION")
            .as_std_path()
            .exists()
        {
            return Ok(());
        }
        let controldata = match self.postgres.controldata().await {
            Ok(data) => data,
            // transient tool failure: not identity evidence either way
            Err(_) => return Ok(()),
        };
        if controldata.system_identifier != self.state.system_identifier {
            return Err(KeeperError::IdentityMismatch {
                expected: self.state.system_identifier,
                actual: controldata.system_identifier,
            });
        }
        Ok(())
    }

    fn current_lsn(&self) -> Lsn {
        if self.pg_state.current_lsn.is_valid() {
            self.pg_state.current_lsn
        } else {
            self.state.xlog_location
        }
    }

    async fn call_node_active(
        &self,
    ) -> Result<AssignedState, MonitorError> {
        let params = NodeActiveParams {
            formation: self.config.keeper.formation.clone(),
            nodename: self.config.keeper.nodename.clone(),
            port: self.config.postgresql.pgport,
            node_id: self.state.current_node_id,
            group_id: self.state.current_group,
            current_role: self.state.current_role,
            pg_is_running: self.pg_state.pg_is_running,
            current_lsn: self.current_lsn(),
            pg_sync_state: self.pg_state.pgsr_sync_state.clone(),
        };
        debug!(self.log, "calling node_active";
            "current_role" => %params.current_role,
            "pg_is_running" => params.pg_is_running,
            "current_lsn" => %params.current_lsn,
            "sync_state" => params.pg_sync_state.as_str());
        self.monitor.node_active(&params).await
    }

    /// Returns true when the monitor's view of the group membership moved
    /// and the HBA rules need a refresh.
    fn absorb_assignment(&mut self, assigned: &AssignedState) -> bool {
        if assigned.assigned_role == NodeRole::Unknown {
            error!(self.log,
                "monitor assigned a role this keeper does not know; \
                 treating as transient and keeping the current role");
            return false;
        }
        self.state.assigned_role = assigned.assigned_role;
        if let Some(quorum) = assigned.replication_quorum {
            self.replication_quorum = quorum;
        }
        if let Some(version) = assigned.nodes_version {
            if version > self.state.current_nodes_version {
                debug!(self.log, "group membership changed";
                    "nodes_version" => version);
                self.state.current_nodes_version = version;
                return true;
            }
        }
        false
    }

    /// Fetches the peer list and appends any missing HBA rules.
    async fn refresh_hba_rules(&self) -> Result<(), KeeperError> {
        let peers =
            self.monitor.get_other_nodes(self.state.current_node_id).await?;
        let mut changed = false;
        for peer in &peers {
            changed |= hba::ensure_rules_for_peer(
                &self.log,
                &self.postgres.hba_path(),
                self.postgres.dbname(),
                REPLICATION_USER,
                peer,
                self.config.ssl.active,
                &self.config.postgresql.auth_method,
                self.config.postgresql.skip_hba,
            )?;
        }
        if changed {
            self.postgres.reload().await?;
        }
        Ok(())
    }

    /// True unless we are a primary cut off from both the monitor and
    /// every standby for longer than the partition timeout.
    fn network_is_healthy(&self) -> bool {
        if self.state.current_role != NodeRole::Primary {
            return true;
        }
        if self.pg_state.standby_count > 0 {
            warn!(self.log,
                "lost the monitor but still have a standby, continuing");
            return true;
        }
        !in_network_partition(
            self.state.last_monitor_contact,
            self.state.last_secondary_contact,
            Utc::now(),
            self.config.network_partition_timeout(),
        )
    }

    async fn reach_assigned_state(&mut self) -> Result<(), KeeperError> {
        let current = self.state.current_role;
        let assigned = self.state.assigned_role;
        let entry = fsm::transition_for(current, assigned)
            .ok_or(KeeperError::NoTransition { current, assigned })?;

        info!(self.log, "transition";
            "from" => %current,
            "to" => %assigned,
            "action" => entry.description);

        self.execute(&entry).await?;

        // The new role is only reported once its postcondition holds;
        // execute() returning Ok is exactly that.
        self.state.current_role = assigned;
        Ok(())
    }

    async fn execute(
        &mut self,
        entry: &TransitionEntry,
    ) -> Result<(), KeeperError> {
        match entry.action {
            TransitionAction::Noop => Ok(()),
            TransitionAction::EnsureCurrent => {
                self.ensure_current_state().await
            }
            TransitionAction::InitAsSingle => self.init_as_single().await,
            TransitionAction::PrepareStandbyAccept => {
                self.prepare_standby_accept().await
            }
            TransitionAction::ConfirmStandbyStreaming => {
                self.confirm_standby_streaming().await
            }
            TransitionAction::RelaxSyncReplication => {
                self.relax_sync_replication().await
            }
            TransitionAction::DropToSingle => self.drop_to_single().await,
            TransitionAction::ApplySyncSettings => {
                self.apply_sync_settings().await
            }
            TransitionAction::InitAsStandby => self.init_as_standby().await,
            TransitionAction::ConfirmCatchup => self.confirm_catchup().await,
            TransitionAction::FollowNewPrimary => {
                self.follow_new_primary().await
            }
            TransitionAction::PreparePromotion => {
                self.prepare_promotion().await
            }
            TransitionAction::StopReplication => {
                self.stop_replication().await
            }
            TransitionAction::PromoteToWaitPrimary => {
                self.promote_to_wait_primary().await
            }
            TransitionAction::Rewind => self.rewind().await,
            TransitionAction::RejoinAsStandby => {
                self.rewind().await?;
                self.follow_new_primary().await
            }
            TransitionAction::ReportLsn => self.report_lsn().await,
            TransitionAction::StopPostgres => {
                let immediate = self.flags.should_stop_fast();
                self.postgres.ensure_stopped(immediate).await?;
                Ok(())
            }
            TransitionAction::DropNode => self.drop_node().await,
        }
    }

    /// Postcondition maintenance for the current role: Postgres runs when
    /// the role needs it and is stopped when the role forbids it.
    async fn ensure_current_state(&mut self) -> Result<(), KeeperError> {
        if self.state.current_role.requires_postgres_running() {
            self.postgres.ensure_running().await?;
        } else if self.state.current_role != NodeRole::Init {
            self.postgres.ensure_stopped(false).await?;
        }
        Ok(())
    }

    async fn init_as_single(&mut self) -> Result<(), KeeperError> {
        self.postgres
            .initdb(&self.config.postgresql.auth_method)
            .await?;
        self.postgres.ensure_running().await?;

        let controldata = self.postgres.controldata().await?;
        if self.state.system_identifier != 0
            && self.state.system_identifier != controldata.system_identifier
        {
            return Err(KeeperError::IdentityMismatch {
                expected: self.state.system_identifier,
                actual: controldata.system_identifier,
            });
        }
        self.state.system_identifier = controldata.system_identifier;
        self.state.pg_control_version = controldata.pg_control_version;
        self.state.catalog_version = controldata.catalog_version;
        Ok(())
    }

    async fn prepare_standby_accept(&mut self) -> Result<(), KeeperError> {
        let peers =
            self.monitor.get_other_nodes(self.state.current_node_id).await?;
        for peer in &peers {
            self.postgres
                .create_replication_slot(&peer.replication_name())
                .await?;
        }
        self.refresh_hba_rules().await?;
        self.postgres.set_synchronous_standby_names("*").await?;
        Ok(())
    }

    async fn confirm_standby_streaming(&mut self) -> Result<(), KeeperError> {
        self.pg_state = self.postgres.probe().await?;
        if self.pg_state.pg_is_running && self.pg_state.standby_count > 0 {
            Ok(())
        } else {
            Err(PgError::Transient {
                detail: "no standby is streaming yet".to_string(),
            }
            .into())
        }
    }

    async fn relax_sync_replication(&mut self) -> Result<(), KeeperError> {
        if self.replication_quorum {
            // quorum requires a sync standby; keep blocking writes until
            // the monitor changes its mind
            info!(self.log,
                "replication quorum holds, keeping synchronous replication");
            return Ok(());
        }
        self.postgres.set_synchronous_standby_names("").await?;
        Ok(())
    }

    async fn drop_to_single(&mut self) -> Result<(), KeeperError> {
        self.postgres.set_synchronous_standby_names("").await?;
        // Best effort: the peers may already be deregistered.
        if let Ok(peers) =
            self.monitor.get_other_nodes(self.state.current_node_id).await
        {
            for peer in &peers {
                self.postgres
                    .drop_replication_slot(&peer.replication_name())
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_sync_settings(&mut self) -> Result<(), KeeperError> {
        let expression = self
            .monitor
            .synchronous_standby_names(
                &self.config.keeper.formation,
                self.state.current_group,
            )
            .await?;
        self.postgres
            .set_synchronous_standby_names(&expression)
            .await?;
        Ok(())
    }

    async fn init_as_standby(&mut self) -> Result<(), KeeperError> {
        self.pg_state = self.postgres.probe().await.unwrap_or_default();
        if self.pg_state.pg_is_running && self.pg_state.is_in_recovery {
            // already streaming; crash recovery took us here before
            return Ok(());
        }
        let primary = self
            .monitor
            .get_primary(
                &self.config.keeper.formation,
                self.state.current_group,
            )
            .await?;
        self.postgres.basebackup(&primary).await?;
        self.follow(&primary).await?;

        // adopt the primary's identity now that we carry its data
        let controldata = self.postgres.controldata().await?;
        self.state.system_identifier = controldata.system_identifier;
        self.state.pg_control_version = controldata.pg_control_version;
        self.state.catalog_version = controldata.catalog_version;
        Ok(())
    }

    async fn confirm_catchup(&mut self) -> Result<(), KeeperError> {
        self.pg_state = self.postgres.probe().await?;
        let threshold = self.config.timeout.catchup_threshold_bytes;
        if self.pg_state.pg_is_running
            && self.pg_state.is_in_recovery
            && self.pg_state.wal_lag_bytes.map_or(false, |lag| {
                lag <= threshold
            })
        {
            Ok(())
        } else {
            Err(PgError::Transient {
                detail: format!(
                    "replay lag {:?} above threshold {}",
                    self.pg_state.wal_lag_bytes, threshold
                ),
            }
            .into())
        }
    }

    async fn follow_new_primary(&mut self) -> Result<(), KeeperError> {
        let primary = self
            .monitor
            .get_primary(
                &self.config.keeper.formation,
                self.state.current_group,
            )
            .await?;
        self.follow(&primary).await
    }

    async fn follow(
        &mut self,
        primary: &warden_common::node::NodeAddress,
    ) -> Result<(), KeeperError> {
        let slot = format!("pgwarden_{}", self.state.current_node_id);
        self.postgres
            .follow(primary, &slot, &self.config.keeper.nodename)
            .await?;
        Ok(())
    }

    async fn prepare_promotion(&mut self) -> Result<(), KeeperError> {
        self.postgres.ensure_running().await?;
        self.pg_state = self.postgres.probe().await?;
        self.state.xlog_location = self.current_lsn();
        Ok(())
    }

    async fn stop_replication(&mut self) -> Result<(), KeeperError> {
        // Promote out of recovery so no more WAL can arrive from the old
        // primary, but refuse writes until the monitor hands us
        // wait_primary.
        self.set_read_only(true).await?;
        self.postgres.promote().await?;
        Ok(())
    }

    async fn promote_to_wait_primary(&mut self) -> Result<(), KeeperError> {
        self.postgres.promote().await?;
        self.postgres.clear_standby_setup()?;
        self.set_read_only(false).await?;
        // no standby is expected yet; synchronous replication returns
        // with the next PrepareStandbyAccept
        self.postgres.set_synchronous_standby_names("").await?;
        Ok(())
    }

    async fn set_read_only(&mut self, on: bool) -> Result<(), KeeperError> {
        let value = if on { "on" } else { "off" };
        self.postgres
            .set_default_transaction_read_only(value)
            .await?;
        Ok(())
    }

    async fn rewind(&mut self) -> Result<(), KeeperError> {
        let primary = self
            .monitor
            .get_primary(
                &self.config.keeper.formation,
                self.state.current_group,
            )
            .await?;
        self.postgres.rewind(&primary).await?;
        Ok(())
    }

    async fn report_lsn(&mut self) -> Result<(), KeeperError> {
        self.postgres.ensure_running().await?;
        self.pg_state = self.postgres.probe().await?;
        self.state.xlog_location = self.current_lsn();
        Ok(())
    }

    async fn drop_node(&mut self) -> Result<(), KeeperError> {
        self.postgres.ensure_stopped(false).await?;
        self.store.drop_file()?;
        Ok(())
    }

    fn reload_configuration(&mut self) {
        match Config::from_file(&self.paths.config) {
            Ok(new_config) => {
                if self.config.accept_new(new_config) {
                    info!(self.log, "reloaded configuration";
                        "path" => self.paths.config.as_str());
                    // rebuild the handles that embed config values
                    if let Some(uri) = &self.config.keeper.monitor {
                        match MonitorClient::new(&self.log, uri) {
                            Ok(client) => self.monitor = client,
                            Err(error) => warn!(self.log,
                                "reload kept the previous monitor URI";
                                "error" => %error),
                        }
                    }
                    self.postgres = PostgresController::new(
                        &self.log,
                        self.config.postgresql.pgdata.clone(),
                        self.config.postgresql.pgport,
                        self.config.postgresql.dbname.clone(),
                        self.config.postgresql.listen_addresses.clone(),
                        self.config.postgresql.bindir.clone(),
                        self.config.replication.maximum_backup_rate.clone(),
                    );
                }
            }
            Err(error) => {
                warn!(self.log,
                    "failed to read configuration file, \
                     continuing with the same configuration";
                    "error" => %error);
            }
        }
    }
}

/// Both contacts known and both older than the timeout.
fn in_network_partition(
    last_monitor_contact: Option<DateTime<Utc>>,
    last_secondary_contact: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> bool {
    let (Some(monitor), Some(secondary)) =
        (last_monitor_contact, last_secondary_contact)
    else {
        return false;
    };
    let timeout = chrono::Duration::from_std(timeout)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));
    now - monitor > timeout && now - secondary > timeout
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn partition_requires_both_contacts_stale() {
        let timeout = Duration::from_secs(20);
        let now = ts(1_000);

        // never had contact: not partition evidence
        assert!(!in_network_partition(None, None, now, timeout));
        assert!(!in_network_partition(Some(ts(0)), None, now, timeout));

        // fresh monitor contact: healthy
        assert!(!in_network_partition(
            Some(ts(990)),
            Some(ts(0)),
            now,
            timeout
        ));

        // fresh standby contact: healthy
        assert!(!in_network_partition(
            Some(ts(0)),
            Some(ts(990)),
            now,
            timeout
        ));

        // both stale: partitioned
        assert!(in_network_partition(
            Some(ts(900)),
            Some(ts(900)),
            now,
            timeout
        ));
    }

    #[test]
    fn warn_once_per_failure_streak() {
        let mut tracker = WarnOnce::default();

        // first failure warns, repeats do not
        assert!(tracker.on_failure());
        assert!(!tracker.on_failure());
        assert!(!tracker.on_failure());

        // the success ending the streak logs recovery, exactly once
        assert!(tracker.on_success());
        assert!(!tracker.on_success());

        // a fresh streak warns again
        assert!(tracker.on_failure());
        assert!(tracker.on_success());
    }

    #[test]
    fn warn_once_quiet_while_healthy() {
        let mut tracker = WarnOnce::default();
        // successes without a preceding failure never log recovery
        assert!(!tracker.on_success());
        assert!(!tracker.on_success());
    }

    #[test]
    fn partition_boundary_is_exclusive() {
        let timeout = Duration::from_secs(20);
        let now = ts(1_000);
        // exactly at the timeout: still healthy
        assert!(!in_network_partition(
            Some(ts(980)),
            Some(ts(980)),
            now,
            timeout
        ));
        // one second past: partitioned
        assert!(in_network_partition(
            Some(ts(979)),
            Some(ts(979)),
            now,
            timeout
        ));
    }
}
