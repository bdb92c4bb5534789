use lodtrack_common::ChunkKey;
use lodtrack_octree::OctreeError;

/// Failure reported by a [`SpatialQuery`](crate::SpatialQuery) collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("octree construction failed: {0}")]
    Octree(#[from] OctreeError),
    #[error("invalid handle parameters: {0}")]
    InvalidParams(String),
    #[error("spatial query unavailable: {0}")]
    Unavailable(String),
}

/// Reasons an update cycle is aborted. Tracker state is left as it was
/// before the cycle began.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("leaf cell {0} reported more than once")]
    DuplicateLeaf(ChunkKey),
    #[error("malformed leaf cell {key}: {reason}")]
    MalformedLeaf { key: ChunkKey, reason: &'static str },
    #[error("chunk {0} lies in no leaf of either the old or the new set")]
    NoLeafMatch(ChunkKey),
    #[error("tracker was destroyed while the cycle was in flight")]
    Destroyed,
}
