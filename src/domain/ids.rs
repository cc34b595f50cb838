//! Typed Identifiers
//!
//! Every persisted entity is addressed by a uuid newtype so that a block id
//! can never be passed where a chunk id is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

define_id!(
    /// Identity of a persisted chunk.
    ChunkId
);
define_id!(
    /// Identity of a fragment record.
    FragId
);
define_id!(
    /// Identity of a physical block replica.
    BlockId
);
define_id!(BucketId);
define_id!(TierId);
define_id!(TieringId);
define_id!(PoolId);
define_id!(MirrorId);
define_id!(
    /// Identity of a storage node agent.
    NodeId
);
define_id!(HostId);
define_id!(ObjectId);
define_id!(PartId);
define_id!(MultipartId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = BlockId::new();
        let b = BlockId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = ChunkId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }
}
