//! Octree construction: viewer position to a sparse set of variable-size leaf cells.
//!
//! # Invariants
//! - No two cells share `(min, size)`.
//! - Leaves tile the root cells exactly: no gaps, no nested leaves.
//! - Splitting a cell always creates all 8 children at once.
//! - `lod_array` is computed once per build and never mutated afterwards.

mod build;
mod error;
mod node;

pub use build::{MAX_RANGE, Octree, OctreeBuilder, construct_leaves};
pub use error::OctreeError;
pub use node::{NodeId, OctreeNode, octant_index, octant_offset};

pub fn crate_info() -> &'static str {
    "lodtrack-octree v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("octree"));
    }
}
