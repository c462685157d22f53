// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The monitor's LISTEN/NOTIFY payload grammar.
//!
//! State-change payloads on the `state` channel look like
//!
//! ```text
//! S:catchingup:secondary:7.default:0:3:9.localhost:6020
//! S:<reported>:<goal>:<len.formation>:<group>:<node>:<len.host>:<port>
//! ```
//!
//! where strings are length-prefixed (`7.default` is the 7-byte string
//! "default").  Payloads are advisory, used for operator-visible logging
//! only; the parser therefore tolerates unknown role identifiers and
//! returns an error rather than panicking on malformed input.

use std::fmt;
use thiserror::Error;
use warden_common::roles::NodeRole;

/// Channels the monitor notifies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    State,
    Log,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::State => "state",
            Channel::Log => "log",
        }
    }

    pub fn from_name(name: &str) -> Option<Channel> {
        match name {
            "state" => Some(Channel::State),
            "log" => Some(Channel::Log),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("payload {0:?} is not a state notification")]
    NotStateMessage(String),
    #[error("truncated state notification {0:?}")]
    Truncated(String),
    #[error("bad integer field {field} in {payload:?}")]
    BadInt { field: &'static str, payload: String },
    #[error("bad length-prefixed string in {0:?}")]
    BadString(String),
}

/// A state-change event, decoded for logging.
#[derive(Clone, Debug, PartialEq)]
pub struct StateNotification {
    pub reported_state: NodeRole,
    pub goal_state: NodeRole,
    pub formation: String,
    pub group_id: i32,
    pub node_id: i64,
    pub nodename: String,
    pub port: u16,
}

impl StateNotification {
    /// Parses a `state` channel payload.
    pub fn parse(payload: &str) -> Result<StateNotification, ParseError> {
        let mut rest = payload
            .strip_prefix("S:")
            .ok_or_else(|| ParseError::NotStateMessage(payload.to_string()))?;

        let reported = take_field(&mut rest, payload)?;
        let goal = take_field(&mut rest, payload)?;
        let formation = take_string(&mut rest, payload)?;
        let group_id = take_field(&mut rest, payload)?
            .parse::<i32>()
            .map_err(|_| ParseError::BadInt {
                field: "group_id",
                payload: payload.to_string(),
            })?;
        let node_id = take_field(&mut rest, payload)?
            .parse::<i64>()
            .map_err(|_| ParseError::BadInt {
                field: "node_id",
                payload: payload.to_string(),
            })?;
        let nodename = take_string(&mut rest, payload)?;
        let port = rest.parse::<u16>().map_err(|_| ParseError::BadInt {
            field: "port",
            payload: payload.to_string(),
        })?;

        Ok(StateNotification {
            reported_state: NodeRole::from_wire(reported),
            goal_state: NodeRole::from_wire(goal),
            formation,
            group_id,
            node_id,
            nodename,
            port,
        })
    }

    /// Renders back to the wire form.  `parse(render(n)) == n` for every
    /// notification whose roles are known.
    pub fn render(&self) -> String {
        format!(
            "S:{}:{}:{}.{}:{}:{}:{}.{}:{}",
            self.reported_state,
            self.goal_state,
            self.formation.len(),
            self.formation,
            self.group_id,
            self.node_id,
            self.nodename.len(),
            self.nodename,
            self.port,
        )
    }
}

impl fmt::Display for StateNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} ({}:{}) in {}/{} reported {} with goal {}",
            self.node_id,
            self.nodename,
            self.port,
            self.formation,
            self.group_id,
            self.reported_state,
            self.goal_state,
        )
    }
}

/// Takes everything up to the next `:` separator.
fn take_field<'a>(
    rest: &mut &'a str,
    payload: &str,
) -> Result<&'a str, ParseError> {
    let (field, tail) = rest
        .split_once(':')
        .ok_or_else(|| ParseError::Truncated(payload.to_string()))?;
    *rest = tail;
    Ok(field)
}

/// Takes a `<len>.<bytes>` string followed by a `:` separator.  The
/// length prefix allows the string itself to contain separators.
fn take_string(
    rest: &mut &str,
    payload: &str,
) -> Result<String, ParseError> {
    let (len, tail) = rest
        .split_once('.')
        .ok_or_else(|| ParseError::BadString(payload.to_string()))?;
    let len = len
        .parse::<usize>()
        .map_err(|_| ParseError::BadString(payload.to_string()))?;
    if tail.len() < len + 1 || !tail.is_char_boundary(len) {
        return Err(ParseError::Truncated(payload.to_string()));
    }
    let (value, tail) = tail.split_at(len);
    let tail = tail
        .strip_prefix(':')
        .ok_or_else(|| ParseError::BadString(payload.to_string()))?;
    *rest = tail;
    Ok(value.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_reference_payload() {
        let n = StateNotification::parse(
            "S:catchingup:secondary:7.default:0:3:9.localhost:6020",
        )
        .unwrap();
        assert_eq!(n.reported_state, NodeRole::CatchingUp);
        assert_eq!(n.goal_state, NodeRole::Secondary);
        assert_eq!(n.formation, "default");
        assert_eq!(n.group_id, 0);
        assert_eq!(n.node_id, 3);
        assert_eq!(n.nodename, "localhost");
        assert_eq!(n.port, 6020);
    }

    #[test]
    fn round_trip() {
        let original = StateNotification {
            reported_state: NodeRole::WaitPrimary,
            goal_state: NodeRole::Primary,
            formation: "analytics".to_string(),
            group_id: 2,
            node_id: 12,
            nodename: "pg-1.example.com".to_string(),
            port: 5432,
        };
        let rendered = original.render();
        assert_eq!(StateNotification::parse(&rendered).unwrap(), original);
    }

    #[test]
    fn strings_may_contain_separators() {
        let original = StateNotification {
            reported_state: NodeRole::Secondary,
            goal_state: NodeRole::Secondary,
            formation: "with:colon.and.dots".to_string(),
            group_id: 0,
            node_id: 1,
            nodename: "host:9".to_string(),
            port: 9,
        };
        let rendered = original.render();
        assert_eq!(StateNotification::parse(&rendered).unwrap(), original);
    }

    #[test]
    fn unknown_roles_are_tolerated() {
        let n = StateNotification::parse(
            "S:hyperdrive:secondary:7.default:0:3:9.localhost:6020",
        )
        .unwrap();
        assert_eq!(n.reported_state, NodeRole::Unknown);
        assert_eq!(n.goal_state, NodeRole::Secondary);
    }

    #[test]
    fn malformed_payloads_error_without_panic() {
        for payload in [
            "",
            "X:foo",
            "S:",
            "S:primary",
            "S:primary:secondary",
            "S:primary:secondary:notanumber.default:0:3:9.localhost:6020",
            "S:primary:secondary:99.default:0:3:9.localhost:6020",
            "S:primary:secondary:7.default:zero:3:9.localhost:6020",
            "S:primary:secondary:7.default:0:3:9.localhost:notaport",
            "S:primary:secondary:7.default:0:3:9.localhost",
        ] {
            assert!(
                StateNotification::parse(payload).is_err(),
                "payload {:?} should not parse",
                payload
            );
        }
    }

    #[test]
    fn channel_names() {
        assert_eq!(Channel::from_name("state"), Some(Channel::State));
        assert_eq!(Channel::from_name("log"), Some(Channel::Log));
        assert_eq!(Channel::from_name("other"), None);
    }
}
