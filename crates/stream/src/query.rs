use glam::{IVec3, Vec3};
use lodtrack_common::{ChunkKey, LodArray, LodChunk, grid_coord};
use lodtrack_octree::{OctreeBuilder, OctreeNode};
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Largest level count a handle accepts: roots of size 2^30.
pub const MAX_HANDLE_LODS: u32 = 31;

/// Parameters fixed for the lifetime of a spatial-query handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleParams {
    pub lods: u32,
    pub min_lod_range: i32,
    pub track_y: bool,
}

impl HandleParams {
    /// Size of the coarsest cells: `2^(lods - 1)`.
    pub fn max_lod(&self) -> Result<i32, QueryError> {
        if self.lods == 0 || self.lods > MAX_HANDLE_LODS {
            return Err(QueryError::InvalidParams(format!(
                "lods must be in 1..={MAX_HANDLE_LODS}, got {}",
                self.lods
            )));
        }
        Ok(1 << (self.lods - 1))
    }
}

/// One cell of a query result, in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafCellSpec {
    pub min: [i32; 3],
    pub size: i32,
    pub is_leaf: bool,
    pub lod_array: LodArray,
}

impl LeafCellSpec {
    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(IVec3::from_array(self.min), self.size)
    }

    pub fn to_chunk(&self) -> LodChunk {
        LodChunk {
            key: self.key(),
            lod_array: self.lod_array,
        }
    }
}

impl From<&OctreeNode> for LeafCellSpec {
    fn from(node: &OctreeNode) -> Self {
        Self {
            min: node.min().to_array(),
            size: node.size(),
            is_leaf: node.is_leaf,
            lod_array: node.lod_array,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafUpdate {
    pub leaf_cells: Vec<LeafCellSpec>,
}

/// External spatial-query service the tracker consults every cycle.
///
/// Futures are awaited on the tracker's local task, so they need not be
/// `Send`.
#[allow(async_fn_in_trait)]
pub trait SpatialQuery {
    type Handle: 'static;

    async fn create_handle(&self, params: HandleParams) -> Result<Self::Handle, QueryError>;

    /// Cells around world-space `position`. Only entries with `is_leaf` set
    /// are streamed.
    async fn query_update(
        &self,
        handle: &Self::Handle,
        position: Vec3,
    ) -> Result<LeafUpdate, QueryError>;
}

/// In-process [`SpatialQuery`] that runs the octree builder directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalOctreeQuery {
    chunk_size: f32,
}

impl LocalOctreeQuery {
    pub fn new(chunk_size: f32) -> Self {
        Self { chunk_size }
    }
}

#[derive(Debug, Clone)]
pub struct LocalHandle {
    builder: OctreeBuilder,
    track_y: bool,
}

impl SpatialQuery for LocalOctreeQuery {
    type Handle = LocalHandle;

    async fn create_handle(&self, params: HandleParams) -> Result<LocalHandle, QueryError> {
        let builder = OctreeBuilder::new(params.min_lod_range, params.max_lod()?)?;
        tracing::debug!(?params, "created local octree handle");
        Ok(LocalHandle {
            builder,
            track_y: params.track_y,
        })
    }

    async fn query_update(
        &self,
        handle: &LocalHandle,
        position: Vec3,
    ) -> Result<LeafUpdate, QueryError> {
        let center = grid_coord(position, self.chunk_size, handle.track_y);
        let tree = handle.builder.build(center)?;
        Ok(LeafUpdate {
            leaf_cells: tree.leaves().map(LeafCellSpec::from).collect(),
        })
    }
}
