//! Replica identity.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of one replica in the static ring roster.
///
/// Ids are small positive integers; the election rule depends on their
/// total order (highest live id wins). Id 0 is reserved as "unknown" in
/// atomic storage and rejected by config validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u32);

impl ReplicaId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(ReplicaId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_numeric_id() {
        assert!(ReplicaId(3) > ReplicaId(2));
        assert_eq!([ReplicaId(2), ReplicaId(3), ReplicaId(1)].iter().max(), Some(&ReplicaId(3)));
    }

    #[test]
    fn parses_from_cli_argument() {
        assert_eq!("2".parse::<ReplicaId>().unwrap(), ReplicaId(2));
        assert!("two".parse::<ReplicaId>().is_err());
    }
}
