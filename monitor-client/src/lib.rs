// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SQL-level RPC client for the pgwarden monitor.
//!
//! The monitor is a Postgres instance carrying the coordination extension;
//! every call here is a `SELECT` of one of its SQL functions.  The client
//! makes exactly one attempt per call: the keeper's tick loop is the retry
//! mechanism, and a transport failure must never look like a state
//! transition.

pub mod listen;
pub mod notifications;

use slog::{debug, o, Logger};
use thiserror::Error;
use tokio_postgres::{Client, NoTls, Row};
use warden_common::lsn::Lsn;
use warden_common::node::NodeAddress;
use warden_common::roles::NodeRole;

/// How long a single connection attempt to the monitor may take.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor URI {uri:?} is not a valid Postgres connection string")]
    BadUri {
        uri: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("failed to connect to monitor")]
    Connect(#[source] tokio_postgres::Error),

    #[error("monitor call {call:?} failed")]
    Call {
        call: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    /// The monitor returned a shape this client does not understand, e.g.
    /// a missing column.  This is a protocol-level mismatch, not a
    /// transient failure.
    #[error("unexpected monitor reply to {call:?}: {detail}")]
    Protocol { call: &'static str, detail: String },
}

/// What the monitor assigned to this node, from `register_node` or
/// `node_active`.
#[derive(Clone, Debug, PartialEq)]
pub struct AssignedState {
    pub node_id: i64,
    pub group_id: i32,
    pub assigned_role: NodeRole,
    pub candidate_priority: Option<i32>,
    pub replication_quorum: Option<bool>,
    /// Monotone counter of the monitor's view of the group membership.
    /// Present in `node_active` replies only; treated as opaque.
    pub nodes_version: Option<i32>,
}

/// Parameters reported by the keeper on every `node_active` call.
#[derive(Clone, Debug)]
pub struct NodeActiveParams {
    pub formation: String,
    pub nodename: String,
    pub port: u16,
    pub node_id: i64,
    pub group_id: i32,
    pub current_role: NodeRole,
    pub pg_is_running: bool,
    pub current_lsn: Lsn,
    pub pg_sync_state: String,
}

/// Parameters for the one-time `register_node` call.
#[derive(Clone, Debug)]
pub struct RegisterNodeParams {
    pub formation: String,
    pub group_id: Option<i32>,
    pub nodename: String,
    pub host: String,
    pub port: u16,
    pub system_identifier: u64,
    pub wanted_initial_state: NodeRole,
}

/// A connection-per-call client for the monitor's SQL functions.
///
/// Holding no long-lived connection keeps the failure model simple: each
/// RPC either completes or surfaces a [`MonitorError`], with no session
/// state to reconcile afterwards.
pub struct MonitorClient {
    config: tokio_postgres::Config,
    log: Logger,
}

impl MonitorClient {
    pub fn new(log: &Logger, uri: &str) -> Result<MonitorClient, MonitorError> {
        let mut config: tokio_postgres::Config =
            uri.parse().map_err(|source| MonitorError::BadUri {
                uri: uri.to_string(),
                source,
            })?;
        config.connect_timeout(CONNECT_TIMEOUT);
        config.application_name("pgwarden");
        Ok(MonitorClient {
            config,
            log: log.new(o!("component" => "MonitorClient")),
        })
    }

    /// The connection configuration, for the LISTEN subscription which
    /// needs a long-lived connection of its own.
    pub fn pg_config(&self) -> &tokio_postgres::Config {
        &self.config
    }

    async fn connect(&self) -> Result<Client, MonitorError> {
        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(MonitorError::Connect)?;
        // The connection object performs the actual I/O; it resolves once
        // the client is dropped at the end of the RPC.
        tokio::spawn(async move {
            let _ = connection.await;
        });
        Ok(client)
    }

    /// Registers this node with the monitor and returns its assignment.
    pub async fn register_node(
        &self,
        params: &RegisterNodeParams,
    ) -> Result<AssignedState, MonitorError> {
        const CALL: &str = "register_node";
        let client = self.connect().await?;
        debug!(self.log, "calling {}", CALL;
            "formation" => params.formation.as_str(),
            "nodename" => params.nodename.as_str());
        let row = client
            .query_one(
                "SELECT * FROM pgautofailover.register_node(\
                     $1::text, $2::int, $3::text, $4::text, $5::int, \
                     $6::bigint, $7::text)",
                &[
                    &params.formation,
                    &params.group_id.unwrap_or(-1),
                    &params.nodename,
                    &params.host,
                    &i32::from(params.port),
                    // The system identifier is an unsigned 64-bit value but
                    // travels as Postgres bigint.
                    &(params.system_identifier as i64),
                    &params.wanted_initial_state.as_str(),
                ],
            )
            .await
            .map_err(|source| MonitorError::Call { call: CALL, source })?;
        parse_assigned_state(CALL, &row)
    }

    /// The periodic report/assign exchange.  One attempt; the caller's
    /// tick loop provides the retry cadence.
    pub async fn node_active(
        &self,
        params: &NodeActiveParams,
    ) -> Result<AssignedState, MonitorError> {
        const CALL: &str = "node_active";
        let client = self.connect().await?;
        let row = client
            .query_one(
                "SELECT * FROM pgautofailover.node_active(\
                     $1::text, $2::text, $3::int, $4::bigint, $5::int, \
                     $6::text, $7::bool, $8::text::pg_lsn, $9::text)",
                &[
                    &params.formation,
                    &params.nodename,
                    &i32::from(params.port),
                    &params.node_id,
                    &params.group_id,
                    &params.current_role.as_str(),
                    &params.pg_is_running,
                    &params.current_lsn.to_string(),
                    &params.pg_sync_state,
                ],
            )
            .await
            .map_err(|source| MonitorError::Call { call: CALL, source })?;
        parse_assigned_state(CALL, &row)
    }

    /// Address of the current primary of a group.
    pub async fn get_primary(
        &self,
        formation: &str,
        group_id: i32,
    ) -> Result<NodeAddress, MonitorError> {
        const CALL: &str = "get_primary";
        let client = self.connect().await?;
        let row = client
            .query_one(
                "SELECT * FROM pgautofailover.get_primary($1::text, $2::int)",
                &[&formation, &group_id],
            )
            .await
            .map_err(|source| MonitorError::Call { call: CALL, source })?;
        parse_node_address(CALL, &row)
    }

    /// Addresses of the other nodes of this node's group.
    pub async fn get_other_nodes(
        &self,
        node_id: i64,
    ) -> Result<Vec<NodeAddress>, MonitorError> {
        const CALL: &str = "get_other_nodes";
        let client = self.connect().await?;
        let rows = client
            .query(
                "SELECT * FROM pgautofailover.get_other_nodes($1::bigint)",
                &[&node_id],
            )
            .await
            .map_err(|source| MonitorError::Call { call: CALL, source })?;
        rows.iter().map(|row| parse_node_address(CALL, row)).collect()
    }

    /// Puts a node into maintenance.  The monitor flips the assigned role
    /// on the next `node_active` round-trip.
    pub async fn start_maintenance(
        &self,
        node_id: i64,
    ) -> Result<bool, MonitorError> {
        self.simple_bool_call("start_maintenance", node_id).await
    }

    /// Takes a node out of maintenance.
    pub async fn stop_maintenance(
        &self,
        node_id: i64,
    ) -> Result<bool, MonitorError> {
        self.simple_bool_call("stop_maintenance", node_id).await
    }

    /// Removes a node from its formation.
    pub async fn remove_node(
        &self,
        node_id: i64,
    ) -> Result<bool, MonitorError> {
        self.simple_bool_call("remove_node", node_id).await
    }

    /// The `synchronous_standby_names` expression the monitor wants
    /// applied on the primary of the given group.
    pub async fn synchronous_standby_names(
        &self,
        formation: &str,
        group_id: i32,
    ) -> Result<String, MonitorError> {
        const CALL: &str = "synchronous_standby_names";
        let client = self.connect().await?;
        let row = client
            .query_one(
                "SELECT pgautofailover.synchronous_standby_names(\
                     $1::text, $2::int)",
                &[&formation, &group_id],
            )
            .await
            .map_err(|source| MonitorError::Call { call: CALL, source })?;
        row.try_get::<_, String>(0).map_err(|e| MonitorError::Protocol {
            call: CALL,
            detail: e.to_string(),
        })
    }

    async fn simple_bool_call(
        &self,
        call: &'static str,
        node_id: i64,
    ) -> Result<bool, MonitorError> {
        let client = self.connect().await?;
        let statement =
            format!("SELECT pgautofailover.{}($1::bigint)", call);
        let row = client
            .query_one(&statement, &[&node_id])
            .await
            .map_err(|source| MonitorError::Call { call, source })?;
        row.try_get::<_, bool>(0).map_err(|e| MonitorError::Protocol {
            call,
            detail: e.to_string(),
        })
    }
}

/// Replies to `register_node` and `node_active` share a leading
/// `(node_id, group_id, assigned_role)` tuple; `candidate_priority`,
/// `replication_quorum` and `nodes_version` follow when the monitor
/// provides them.
fn parse_assigned_state(
    call: &'static str,
    row: &Row,
) -> Result<AssignedState, MonitorError> {
    let protocol = |detail: String| MonitorError::Protocol { call, detail };

    let node_id: i64 =
        row.try_get(0).map_err(|e| protocol(e.to_string()))?;
    let group_id: i32 =
        row.try_get(1).map_err(|e| protocol(e.to_string()))?;
    let role: String =
        row.try_get(2).map_err(|e| protocol(e.to_string()))?;

    Ok(AssignedState {
        node_id,
        group_id,
        // An unknown role is not a protocol error here: the caller logs it
        // and treats the tick as transient.
        assigned_role: NodeRole::from_wire(&role),
        candidate_priority: row.try_get(3).ok(),
        replication_quorum: row.try_get(4).ok(),
        nodes_version: row.try_get(5).ok(),
    })
}

fn parse_node_address(
    call: &'static str,
    row: &Row,
) -> Result<NodeAddress, MonitorError> {
    let protocol = |detail: String| MonitorError::Protocol { call, detail };

    let node_id: i64 =
        row.try_get(0).map_err(|e| protocol(e.to_string()))?;
    let nodename: String =
        row.try_get(1).map_err(|e| protocol(e.to_string()))?;
    let host: String =
        row.try_get(2).map_err(|e| protocol(e.to_string()))?;
    let port: i32 = row.try_get(3).map_err(|e| protocol(e.to_string()))?;
    let port = u16::try_from(port)
        .map_err(|_| protocol(format!("port {} out of range", port)))?;
    let reported_lsn = row
        .try_get::<_, String>(4)
        .ok()
        .and_then(|s| s.parse::<Lsn>().ok())
        .unwrap_or(Lsn::INVALID);

    Ok(NodeAddress { node_id, nodename, host, port, reported_lsn })
}

#[cfg(test)]
mod test {
    use super::*;
    use warden_common::roles::NodeRole;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn rejects_bad_uri() {
        let err = MonitorClient::new(&test_logger(), "not a uri at all")
            .err()
            .expect("bad URI must be rejected");
        assert!(matches!(err, MonitorError::BadUri { .. }));
    }

    #[test]
    fn accepts_postgres_uri() {
        let client = MonitorClient::new(
            &test_logger(),
            "postgres://autoctl_node@monitor.internal:5432/pg_auto_failover",
        )
        .unwrap();
        let hosts = client.pg_config().get_hosts();
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn node_active_params_render_wire_values() {
        let params = NodeActiveParams {
            formation: "default".to_string(),
            nodename: "node-a".to_string(),
            port: 5432,
            node_id: 1,
            group_id: 0,
            current_role: NodeRole::Primary,
            pg_is_running: true,
            current_lsn: "0/4000060".parse().unwrap(),
            pg_sync_state: "sync".to_string(),
        };
        assert_eq!(params.current_role.as_str(), "primary");
        assert_eq!(params.current_lsn.to_string(), "0/4000060");
    }
}
