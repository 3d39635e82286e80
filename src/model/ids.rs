//! Opaque monotonic integer identifiers for every entity in §3.
//!
//! Kept as distinct newtypes rather than bare `i64` so the placer and
//! store can't accidentally compare a `PoolId` to a `SdsId`.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                $name(v)
            }
        }
    };
}

id_type!(PdId);
id_type!(FaultSetId);
id_type!(PoolId);
id_type!(SdsId);
id_type!(SdcId);
id_type!(VolumeId);
id_type!(MappingId);
id_type!(ChunkId);
id_type!(RebuildJobId);
