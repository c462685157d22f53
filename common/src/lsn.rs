// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Postgres log sequence numbers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A WAL position, displayed in the `XXXXXXXX/XXXXXXXX` form Postgres
/// uses for `pg_lsn` values.  `Lsn::INVALID` (0/0) means "no position
/// known"; the monitor tolerates it while Postgres is unreachable.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
    Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

#[derive(Debug, Error)]
#[error("invalid lsn {0:?}")]
pub struct ParseLsnError(String);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Bytes between `self` and an older position, saturating at zero when
    /// `other` is ahead.
    pub fn wal_distance(&self, other: &Lsn) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) =
            s.split_once('/').ok_or_else(|| ParseLsnError(s.to_string()))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|_| ParseLsnError(s.to_string()))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|_| ParseLsnError(s.to_string()))?;
        if hi > u64::from(u32::MAX) || lo > u64::from(u32::MAX) {
            return Err(ParseLsnError(s.to_string()));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_display() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, 0x16_B374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
    }

    #[test]
    fn invalid_forms_rejected() {
        assert!("".parse::<Lsn>().is_err());
        assert!("deadbeef".parse::<Lsn>().is_err());
        assert!("1/2/3".parse::<Lsn>().is_err());
        assert!("100000000/0".parse::<Lsn>().is_err());
        assert!("xyz/0".parse::<Lsn>().is_err());
    }

    #[test]
    fn distance_saturates() {
        let newer = Lsn(1000);
        let older = Lsn(200);
        assert_eq!(newer.wal_distance(&older), 800);
        assert_eq!(older.wal_distance(&newer), 0);
    }

    #[test]
    fn invalid_is_default() {
        assert_eq!(Lsn::default(), Lsn::INVALID);
        assert!(!Lsn::INVALID.is_valid());
    }
}
