// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// An id is a simple wrapper around u64 in order to prevent one kind of id
/// from being used where another is expected.
macro_rules! define_id {
    ($(#[$outer:meta])* $name:ident, $prefix:literal) => {
        $(#[$outer])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn value(&self) -> u64 {
                self.0
            }

            /// The zero id, used as "unset" throughout the protocol.
            pub const fn none() -> Self {
                Self(0)
            }

            pub fn is_none(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }
    };
}

define_id!(
    /// Identifies one server (transaction manager or key-value store) in the
    /// cluster, unique across all roles.
    CommId,
    "comm"
);
define_id!(
    /// Identifies a cluster deployment.
    ClusterId,
    "cluster"
);
define_id!(
    /// Monotonic configuration epoch published by the coordinator.
    VersionId,
    "version"
);
define_id!(
    /// Identifies a paxos group of transaction managers within one data center.
    PaxosGroupId,
    "group"
);
define_id!(
    /// Identifies a data center.
    DataCenterId,
    "dc"
);
define_id!(
    /// Identifies one of the partitions of a per-data-center ring.
    PartitionId,
    "partition"
);

/// A type-erased id used by the generic Paxos engine, where acceptors may be
/// servers (the per-group instance) or whole paxos groups (the cross-data-center
/// instance).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbstractId(u64);

impl AbstractId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub const fn none() -> Self {
        Self(0)
    }
}

impl From<CommId> for AbstractId {
    fn from(id: CommId) -> Self {
        Self(id.value())
    }
}

impl From<PaxosGroupId> for AbstractId {
    fn from(id: PaxosGroupId) -> Self {
        Self(id.value())
    }
}

impl fmt::Display for AbstractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "abstract({})", self.0)
    }
}

impl fmt::Debug for AbstractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types_with_shared_representation() {
        let c = CommId::new(7);
        assert_eq!(c.value(), 7);
        assert_eq!(AbstractId::from(c).value(), 7);
        assert_eq!(AbstractId::from(PaxosGroupId::new(7)), AbstractId::from(c));
        assert!(CommId::none().is_none());
        assert_eq!(format!("{c}"), "comm(7)");
    }
}
