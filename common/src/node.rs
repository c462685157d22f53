// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node identity as known to the monitor.

use crate::lsn::Lsn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The formation every node belongs to unless configured otherwise.
pub const DEFAULT_FORMATION: &str = "default";

/// Identity of this node within its formation and group.
///
/// `node_id` is assigned by the monitor at registration and is immutable
/// for the lifetime of the data directory; `-1` means "not registered
/// yet".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub formation: String,
    pub group_id: i32,
    pub node_id: i64,
    pub nodename: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} ({}:{})",
            self.formation, self.group_id, self.node_id, self.host, self.port
        )
    }
}

/// A peer node's address, as returned by the monitor's `get_primary` and
/// `get_other_nodes` calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub node_id: i64,
    pub nodename: String,
    pub host: String,
    pub port: u16,
    /// Last LSN the peer reported to the monitor, when known.
    #[serde(default)]
    pub reported_lsn: Lsn,
}

impl NodeAddress {
    /// The `application_name` under which this node connects to a primary,
    /// and the name of the replication slot held for it there.
    pub fn replication_name(&self) -> String {
        format!("pgwarden_{}", self.node_id)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} ({}:{})", self.node_id, self.host, self.port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replication_name_is_derived_from_node_id() {
        let node = NodeAddress {
            node_id: 3,
            nodename: "b".to_string(),
            host: "10.0.0.2".to_string(),
            port: 5432,
            reported_lsn: Lsn::INVALID,
        };
        assert_eq!(node.replication_name(), "pgwarden_3");
    }
}
