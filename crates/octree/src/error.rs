use lodtrack_common::ChunkKey;

/// Errors from octree construction.
///
/// Everything except the configuration variants signals a defect in the
/// builder: the build is aborted rather than patched up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OctreeError {
    #[error("max lod must be a positive power of two, got {0}")]
    InvalidMaxLod(i32),
    #[error("finest-level range must be non-negative, got {0}")]
    NegativeRange(i32),
    #[error("finest-level range {range} exceeds the maximum of {max}")]
    RangeTooLarge { range: i32, max: i32 },
    #[error("node already exists: {0}")]
    DuplicateNode(ChunkKey),
    #[error("duplicate finest-level node: {0}")]
    DuplicateFinestNode(ChunkKey),
    #[error("leaf node {outer} contains leaf node {inner}")]
    NestedLeaf { outer: ChunkKey, inner: ChunkKey },
    #[error("leaf node {0} has a leaf child")]
    LeafWithLeafChild(ChunkKey),
}
