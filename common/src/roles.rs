// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node roles and their wire representation.
//!
//! Roles are exchanged with the monitor as lowercase identifiers.  The
//! string forms and the on-disk numeric codes are part of the persistent
//! and wire formats and must not change across versions.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The role of a node in its replication group, as tracked by both the
/// keeper and the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRole {
    NoState,
    Init,
    Single,
    WaitPrimary,
    Primary,
    WaitStandby,
    CatchingUp,
    Secondary,
    PreparePromotion,
    StopReplication,
    Demoted,
    DemoteTimeout,
    Draining,
    ReportLsn,
    Maintenance,
    JoinPrimary,
    ApplySettings,
    FastForward,
    Dropped,
    /// A role identifier this version does not know about.  The monitor may
    /// be newer than the keeper; an unknown role is reported back verbatim
    /// and never acted upon.
    Unknown,
}

/// Every known role, in on-disk code order.
pub const ALL_ROLES: &[NodeRole] = &[
    NodeRole::NoState,
    NodeRole::Init,
    NodeRole::Single,
    NodeRole::WaitPrimary,
    NodeRole::Primary,
    NodeRole::WaitStandby,
    NodeRole::CatchingUp,
    NodeRole::Secondary,
    NodeRole::PreparePromotion,
    NodeRole::StopReplication,
    NodeRole::Demoted,
    NodeRole::DemoteTimeout,
    NodeRole::Draining,
    NodeRole::ReportLsn,
    NodeRole::Maintenance,
    NodeRole::JoinPrimary,
    NodeRole::ApplySettings,
    NodeRole::FastForward,
    NodeRole::Dropped,
];

impl NodeRole {
    /// The wire identifier for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::NoState => "no_state",
            NodeRole::Init => "init",
            NodeRole::Single => "single",
            NodeRole::WaitPrimary => "wait_primary",
            NodeRole::Primary => "primary",
            NodeRole::WaitStandby => "wait_standby",
            NodeRole::CatchingUp => "catchingup",
            NodeRole::Secondary => "secondary",
            NodeRole::PreparePromotion => "prepare_promotion",
            NodeRole::StopReplication => "stop_replication",
            NodeRole::Demoted => "demoted",
            NodeRole::DemoteTimeout => "demote_timeout",
            NodeRole::Draining => "draining",
            NodeRole::ReportLsn => "report_lsn",
            NodeRole::Maintenance => "maintenance",
            NodeRole::JoinPrimary => "join_primary",
            NodeRole::ApplySettings => "apply_settings",
            NodeRole::FastForward => "fast_forward",
            NodeRole::Dropped => "dropped",
            NodeRole::Unknown => "unknown",
        }
    }

    /// Parses a wire identifier.  Unrecognized identifiers map to
    /// [`NodeRole::Unknown`] rather than an error: the monitor may speak a
    /// newer protocol revision, and notification payloads are advisory.
    pub fn from_wire(s: &str) -> NodeRole {
        match s {
            "no_state" => NodeRole::NoState,
            "init" => NodeRole::Init,
            "single" => NodeRole::Single,
            "wait_primary" => NodeRole::WaitPrimary,
            "primary" => NodeRole::Primary,
            "wait_standby" => NodeRole::WaitStandby,
            "catchingup" => NodeRole::CatchingUp,
            "secondary" => NodeRole::Secondary,
            "prepare_promotion" => NodeRole::PreparePromotion,
            "stop_replication" => NodeRole::StopReplication,
            "demoted" => NodeRole::Demoted,
            "demote_timeout" => NodeRole::DemoteTimeout,
            "draining" => NodeRole::Draining,
            "report_lsn" => NodeRole::ReportLsn,
            "maintenance" => NodeRole::Maintenance,
            "join_primary" => NodeRole::JoinPrimary,
            "apply_settings" => NodeRole::ApplySettings,
            "fast_forward" => NodeRole::FastForward,
            "dropped" => NodeRole::Dropped,
            _ => NodeRole::Unknown,
        }
    }

    /// The stable numeric code used by the binary state file.
    pub fn code(&self) -> u32 {
        match self {
            NodeRole::NoState => 0,
            NodeRole::Init => 1,
            NodeRole::Single => 2,
            NodeRole::WaitPrimary => 3,
            NodeRole::Primary => 4,
            NodeRole::WaitStandby => 5,
            NodeRole::CatchingUp => 6,
            NodeRole::Secondary => 7,
            NodeRole::PreparePromotion => 8,
            NodeRole::StopReplication => 9,
            NodeRole::Demoted => 10,
            NodeRole::DemoteTimeout => 11,
            NodeRole::Draining => 12,
            NodeRole::ReportLsn => 13,
            NodeRole::Maintenance => 14,
            NodeRole::JoinPrimary => 15,
            NodeRole::ApplySettings => 16,
            NodeRole::FastForward => 17,
            NodeRole::Dropped => 18,
            NodeRole::Unknown => u32::MAX,
        }
    }

    /// Inverse of [`NodeRole::code`].  Returns `None` for codes written by
    /// a newer version.
    pub fn from_code(code: u32) -> Option<NodeRole> {
        ALL_ROLES.iter().copied().find(|role| role.code() == code)
    }

    /// Whether a node in this role is expected to have a running Postgres
    /// instance.  Used by the postgres service to converge the local
    /// instance, and by the keeper to enforce the current role between
    /// transitions.
    pub fn requires_postgres_running(&self) -> bool {
        !matches!(
            self,
            NodeRole::NoState
                | NodeRole::Init
                | NodeRole::Demoted
                | NodeRole::DemoteTimeout
                | NodeRole::Draining
                | NodeRole::Maintenance
                | NodeRole::Dropped
                | NodeRole::Unknown
        )
    }

    /// Whether a node in this role accepts writes.
    pub fn accepts_writes(&self) -> bool {
        matches!(
            self,
            NodeRole::Single
                | NodeRole::WaitPrimary
                | NodeRole::Primary
                | NodeRole::JoinPrimary
                | NodeRole::ApplySettings
        )
    }

    /// Whether a node in this role runs as a standby of some primary.
    pub fn is_standby(&self) -> bool {
        matches!(
            self,
            NodeRole::WaitStandby
                | NodeRole::CatchingUp
                | NodeRole::Secondary
                | NodeRole::ReportLsn
        )
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(NodeRole::from_wire(s))
    }
}

impl Serialize for NodeRole {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NodeRole {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        match NodeRole::from_wire(&s) {
            // "unknown" itself round-trips; anything else unrecognized is a
            // deserialization error so that config files cannot smuggle in
            // nonsense.
            NodeRole::Unknown if s != "unknown" => {
                Err(D::Error::custom(format!("unknown node role {:?}", s)))
            }
            role => Ok(role),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_identifiers_are_stable() {
        let expected = [
            "no_state",
            "init",
            "single",
            "wait_primary",
            "primary",
            "wait_standby",
            "catchingup",
            "secondary",
            "prepare_promotion",
            "stop_replication",
            "demoted",
            "demote_timeout",
            "draining",
            "report_lsn",
            "maintenance",
            "join_primary",
            "apply_settings",
            "fast_forward",
            "dropped",
        ];
        assert_eq!(ALL_ROLES.len(), expected.len());
        for (role, wire) in ALL_ROLES.iter().zip(expected) {
            assert_eq!(role.as_str(), wire);
        }
    }

    #[test]
    fn wire_round_trip() {
        for role in ALL_ROLES {
            assert_eq!(NodeRole::from_wire(role.as_str()), *role);
        }
    }

    #[test]
    fn code_round_trip() {
        for role in ALL_ROLES {
            assert_eq!(NodeRole::from_code(role.code()), Some(*role));
        }
        assert_eq!(NodeRole::from_code(9999), None);
    }

    #[test]
    fn unknown_identifiers_parse_to_unknown() {
        assert_eq!(NodeRole::from_wire("mystery_role"), NodeRole::Unknown);
        assert_eq!(NodeRole::from_wire(""), NodeRole::Unknown);
    }

    #[test]
    fn serde_uses_wire_form() {
        let json = serde_json::to_string(&NodeRole::WaitPrimary).unwrap();
        assert_eq!(json, "\"wait_primary\"");
        let role: NodeRole = serde_json::from_str("\"catchingup\"").unwrap();
        assert_eq!(role, NodeRole::CatchingUp);
        assert!(serde_json::from_str::<NodeRole>("\"bogus\"").is_err());
    }

    #[test]
    fn primary_roles_require_postgres() {
        assert!(NodeRole::Primary.requires_postgres_running());
        assert!(NodeRole::Secondary.requires_postgres_running());
        assert!(!NodeRole::Maintenance.requires_postgres_running());
        assert!(!NodeRole::Demoted.requires_postgres_running());
    }
}
