//! Shared types for the LOD tracker: cell identity, chunks, grid coordinates.
//!
//! # Invariants
//! - A cell is identified by its min corner and its power-of-two size.
//! - Every cell is aligned to its own size on all three axes.

mod chunk;
mod coord;

pub use chunk::{CORNER_OFFSETS, ChunkKey, LodArray, LodChunk};
pub use coord::{align_down, grid_coord};

pub fn crate_info() -> &'static str {
    "lodtrack-common v0.1.0"
}
