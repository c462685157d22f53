// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The keeper's transition table.
//!
//! Given `(current_role, assigned_role)` this module selects the
//! procedure that takes the local node from one to the other.  The table
//! is data; execution lives in [`crate::keeper`], which owns the handles
//! the procedures need.  Every procedure checks its postcondition before
//! doing work, so replaying an assignment is a no-op and a keeper crash
//! mid-transition resumes cleanly.

use warden_common::roles::NodeRole;

/// The procedures a transition can run.  One action may serve several
/// edges: the table describes intent, the action the mechanism.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionAction {
    /// Nothing to do beyond adopting the assigned role.
    Noop,
    /// Re-establish the postconditions of the current role.
    EnsureCurrent,
    /// initdb if needed, start Postgres, accept writes with no standby.
    InitAsSingle,
    /// Prepare to host a standby: replication slot, HBA rules, and
    /// synchronous replication toward the joining node.
    PrepareStandbyAccept,
    /// Verify a standby is streaming before claiming full primary duty.
    ConfirmStandbyStreaming,
    /// A sync standby is gone: keep accepting writes if quorum permits.
    RelaxSyncReplication,
    /// All standbys gone for good: back to a plain single.
    DropToSingle,
    /// Fetch and apply the monitor's synchronous_standby_names.
    ApplySyncSettings,
    /// Take a base backup from the primary and start streaming from it.
    InitAsStandby,
    /// Check that replay has caught up within the configured threshold.
    ConfirmCatchup,
    /// Point the WAL receiver at the current primary and (re)start.
    FollowNewPrimary,
    /// Stop applying new WAL and report the final LSN for the election.
    PreparePromotion,
    /// Cut replication while staying read-only, awaiting promotion.
    StopReplication,
    /// Promote to a writable primary awaiting standbys.
    PromoteToWaitPrimary,
    /// pg_rewind against the new primary (base backup on failure).
    Rewind,
    /// Rewind and immediately resume streaming from the new primary.
    RejoinAsStandby,
    /// Report the last known LSN; Postgres is kept running.
    ReportLsn,
    /// Stop Postgres and hold.
    StopPostgres,
    /// Stop Postgres and retire this node's state.
    DropNode,
}

/// One edge of the transition table.
#[derive(Clone, Copy, Debug)]
pub struct TransitionEntry {
    pub current: NodeRole,
    pub assigned: NodeRole,
    pub action: TransitionAction,
    pub description: &'static str,
}

use NodeRole::*;
use TransitionAction as A;

/// Explicit edges.  Assignments of `maintenance`, `draining`, `demoted`,
/// `demote_timeout` and `dropped` are accepted from any role and resolved
/// by [`transition_for`]'s fallback, since they all stop Postgres
/// regardless of where the node stood.
const TABLE: &[TransitionEntry] = &[
    TransitionEntry {
        current: NoState,
        assigned: Init,
        action: A::Noop,
        description: "start initializing this node",
    },
    TransitionEntry {
        current: Init,
        assigned: Single,
        action: A::InitAsSingle,
        description: "initialize as the only node of the group",
    },
    TransitionEntry {
        current: Init,
        assigned: WaitStandby,
        action: A::Noop,
        description: "wait for the primary to prepare our replication",
    },
    TransitionEntry {
        current: WaitStandby,
        assigned: CatchingUp,
        action: A::InitAsStandby,
        description: "base backup from the primary and start streaming",
    },
    TransitionEntry {
        current: CatchingUp,
        assigned: Secondary,
        action: A::ConfirmCatchup,
        description: "confirm replay caught up with the primary",
    },
    TransitionEntry {
        current: Secondary,
        assigned: CatchingUp,
        action: A::FollowNewPrimary,
        description: "follow the current primary",
    },
    TransitionEntry {
        current: Secondary,
        assigned: ReportLsn,
        action: A::ReportLsn,
        description: "report our last received LSN for the election",
    },
    TransitionEntry {
        current: CatchingUp,
        assigned: ReportLsn,
        action: A::ReportLsn,
        description: "report our last received LSN for the election",
    },
    TransitionEntry {
        current: ReportLsn,
        assigned: Secondary,
        action: A::ConfirmCatchup,
        description: "resume normal streaming, failover cancelled",
    },
    TransitionEntry {
        current: ReportLsn,
        assigned: CatchingUp,
        action: A::FollowNewPrimary,
        description: "follow the new primary",
    },
    TransitionEntry {
        current: ReportLsn,
        assigned: PreparePromotion,
        action: A::PreparePromotion,
        description: "selected for promotion, stop applying new WAL",
    },
    TransitionEntry {
        current: ReportLsn,
        assigned: FastForward,
        action: A::Rewind,
        description: "fast forward to the candidate's WAL position",
    },
    TransitionEntry {
        current: Secondary,
        assigned: PreparePromotion,
        action: A::PreparePromotion,
        description: "selected for promotion, stop applying new WAL",
    },
    TransitionEntry {
        current: PreparePromotion,
        assigned: StopReplication,
        action: A::StopReplication,
        description: "cut replication while the old primary drains",
    },
    TransitionEntry {
        current: PreparePromotion,
        assigned: WaitPrimary,
        action: A::PromoteToWaitPrimary,
        description: "promote and accept writes",
    },
    TransitionEntry {
        current: StopReplication,
        assigned: WaitPrimary,
        action: A::PromoteToWaitPrimary,
        description: "promote and accept writes",
    },
    TransitionEntry {
        current: Secondary,
        assigned: FastForward,
        action: A::Rewind,
        description: "rewind against the new primary",
    },
    TransitionEntry {
        current: FastForward,
        assigned: CatchingUp,
        action: A::FollowNewPrimary,
        description: "resume streaming from the new primary",
    },
    TransitionEntry {
        current: FastForward,
        assigned: Secondary,
        action: A::ConfirmCatchup,
        description: "confirm replay caught up after fast forward",
    },
    TransitionEntry {
        current: Single,
        assigned: WaitPrimary,
        action: A::PrepareStandbyAccept,
        description: "a standby is joining, prepare replication",
    },
    TransitionEntry {
        current: WaitPrimary,
        assigned: Primary,
        action: A::ConfirmStandbyStreaming,
        description: "confirm a standby is streaming",
    },
    TransitionEntry {
        current: Primary,
        assigned: WaitPrimary,
        action: A::RelaxSyncReplication,
        description: "lost a sync standby, relax if quorum permits",
    },
    TransitionEntry {
        current: WaitPrimary,
        assigned: Single,
        action: A::DropToSingle,
        description: "standby removed, back to a single node",
    },
    TransitionEntry {
        current: Primary,
        assigned: Single,
        action: A::DropToSingle,
        description: "standby removed, back to a single node",
    },
    TransitionEntry {
        current: JoinPrimary,
        assigned: Single,
        action: A::DropToSingle,
        description: "joining node dropped, back to a single node",
    },
    TransitionEntry {
        current: Single,
        assigned: JoinPrimary,
        action: A::PrepareStandbyAccept,
        description: "a node is joining the group, prepare replication",
    },
    TransitionEntry {
        current: WaitPrimary,
        assigned: JoinPrimary,
        action: A::PrepareStandbyAccept,
        description: "a node is joining the group, prepare replication",
    },
    TransitionEntry {
        current: Primary,
        assigned: JoinPrimary,
        action: A::PrepareStandbyAccept,
        description: "a node is joining the group, prepare replication",
    },
    TransitionEntry {
        current: JoinPrimary,
        assigned: Primary,
        action: A::ConfirmStandbyStreaming,
        description: "joining node is streaming, resume primary duty",
    },
    TransitionEntry {
        current: JoinPrimary,
        assigned: WaitPrimary,
        action: A::RelaxSyncReplication,
        description: "joining node left before catching up",
    },
    TransitionEntry {
        current: Primary,
        assigned: ApplySettings,
        action: A::ApplySyncSettings,
        description: "apply replication settings from the monitor",
    },
    TransitionEntry {
        current: ApplySettings,
        assigned: Primary,
        action: A::ApplySyncSettings,
        description: "confirm replication settings are in place",
    },
    TransitionEntry {
        current: Demoted,
        assigned: CatchingUp,
        action: A::RejoinAsStandby,
        description: "rewind and rejoin as a standby of the new primary",
    },
    TransitionEntry {
        current: DemoteTimeout,
        assigned: CatchingUp,
        action: A::RejoinAsStandby,
        description: "rewind and rejoin as a standby of the new primary",
    },
    TransitionEntry {
        current: Demoted,
        assigned: FastForward,
        action: A::Rewind,
        description: "rewind against the new primary",
    },
    TransitionEntry {
        current: DemoteTimeout,
        assigned: FastForward,
        action: A::Rewind,
        description: "rewind against the new primary",
    },
    TransitionEntry {
        current: Maintenance,
        assigned: CatchingUp,
        action: A::FollowNewPrimary,
        description: "maintenance over, follow the current primary",
    },
];

/// Identity assignment: nothing to transition, only postconditions to
/// keep.
const ENSURE: TransitionEntry = TransitionEntry {
    current: NoState,
    assigned: NoState,
    action: A::EnsureCurrent,
    description: "keep the current role's postconditions",
};

/// Selects the transition for an assignment, or `None` when the pair has
/// no defined edge (the caller logs and waits for the monitor to assign
/// something else).
pub fn transition_for(
    current: NodeRole,
    assigned: NodeRole,
) -> Option<TransitionEntry> {
    if assigned == NodeRole::Unknown {
        return None;
    }
    if current == assigned {
        return Some(TransitionEntry { current, assigned, ..ENSURE });
    }
    if let Some(entry) = TABLE
        .iter()
        .find(|e| e.current == current && e.assigned == assigned)
    {
        return Some(*entry);
    }
    // Stop-the-node assignments apply from any role.
    let fallback = match assigned {
        Maintenance => TransitionEntry {
            current,
            assigned,
            action: A::StopPostgres,
            description: "stop postgres for maintenance",
        },
        Draining => TransitionEntry {
            current,
            assigned,
            action: A::StopPostgres,
            description: "stop accepting writes and drain",
        },
        Demoted => TransitionEntry {
            current,
            assigned,
            action: A::StopPostgres,
            description: "demoted, stop postgres",
        },
        DemoteTimeout => TransitionEntry {
            current,
            assigned,
            action: A::StopPostgres,
            description: "demote timeout, stop postgres",
        },
        Dropped => TransitionEntry {
            current,
            assigned,
            action: A::DropNode,
            description: "node dropped from the formation",
        },
        _ => return None,
    };
    Some(fallback)
}

#[cfg(test)]
mod test {
    use super::*;
    use warden_common::roles::ALL_ROLES;

    #[test]
    fn identity_pairs_are_ensure_only() {
        for role in ALL_ROLES {
            let entry = transition_for(*role, *role).unwrap();
            assert_eq!(entry.action, TransitionAction::EnsureCurrent);
        }
    }

    #[test]
    fn no_duplicate_edges() {
        for (i, a) in TABLE.iter().enumerate() {
            for b in &TABLE[i + 1..] {
                assert!(
                    !(a.current == b.current && a.assigned == b.assigned),
                    "duplicate edge {:?} -> {:?}",
                    a.current,
                    a.assigned
                );
            }
        }
    }

    #[test]
    fn unknown_assignment_has_no_transition() {
        for role in ALL_ROLES {
            assert!(transition_for(*role, NodeRole::Unknown).is_none());
        }
    }

    #[test]
    fn failover_path_is_complete() {
        // The standby side of a failover, in order.
        let path = [
            (NodeRole::Secondary, NodeRole::ReportLsn),
            (NodeRole::ReportLsn, NodeRole::PreparePromotion),
            (NodeRole::PreparePromotion, NodeRole::StopReplication),
            (NodeRole::StopReplication, NodeRole::WaitPrimary),
            (NodeRole::WaitPrimary, NodeRole::Primary),
        ];
        for (current, assigned) in path {
            assert!(
                transition_for(current, assigned).is_some(),
                "missing edge {:?} -> {:?}",
                current,
                assigned
            );
        }

        // The old primary's side.
        let path = [
            (NodeRole::Primary, NodeRole::Draining),
            (NodeRole::Draining, NodeRole::Demoted),
            (NodeRole::Demoted, NodeRole::FastForward),
            (NodeRole::FastForward, NodeRole::CatchingUp),
            (NodeRole::CatchingUp, NodeRole::Secondary),
        ];
        for (current, assigned) in path {
            assert!(
                transition_for(current, assigned).is_some(),
                "missing edge {:?} -> {:?}",
                current,
                assigned
            );
        }
    }

    #[test]
    fn bootstrap_path_is_complete() {
        assert!(transition_for(NodeRole::Init, NodeRole::Single).is_some());
        assert!(
            transition_for(NodeRole::Single, NodeRole::WaitPrimary).is_some()
        );
        assert!(
            transition_for(NodeRole::WaitPrimary, NodeRole::Primary).is_some()
        );
        assert!(
            transition_for(NodeRole::Init, NodeRole::WaitStandby).is_some()
        );
        assert!(
            transition_for(NodeRole::WaitStandby, NodeRole::CatchingUp)
                .is_some()
        );
    }

    #[test]
    fn maintenance_reachable_from_every_role() {
        for role in ALL_ROLES {
            let entry =
                transition_for(*role, NodeRole::Maintenance).unwrap();
            if *role == NodeRole::Maintenance {
                assert_eq!(entry.action, TransitionAction::EnsureCurrent);
            } else {
                assert_eq!(entry.action, TransitionAction::StopPostgres);
            }
        }
        assert_eq!(
            transition_for(NodeRole::Maintenance, NodeRole::CatchingUp)
                .unwrap()
                .action,
            TransitionAction::FollowNewPrimary
        );
    }

    #[test]
    fn dropped_reachable_from_every_role() {
        for role in ALL_ROLES {
            if *role == NodeRole::Dropped {
                continue;
            }
            let entry = transition_for(*role, NodeRole::Dropped).unwrap();
            assert_eq!(entry.action, TransitionAction::DropNode);
        }
    }

    #[test]
    fn undefined_pairs_yield_none() {
        // a primary is never assigned wait_standby directly
        assert!(
            transition_for(NodeRole::Primary, NodeRole::WaitStandby).is_none()
        );
        // and a standby never becomes primary without promotion steps
        assert!(
            transition_for(NodeRole::Secondary, NodeRole::Primary).is_none()
        );
    }
}
