use glam::IVec3;
use lodtrack_common::{ChunkKey, LodArray, LodChunk};

/// Index of a node in an [`Octree`](crate::Octree) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Octant index of a child inside its parent.
///
/// Bit 0 is the +X half, bit 1 the +Y half, bit 2 the +Z half.
pub fn octant_index(dx: i32, dy: i32, dz: i32) -> usize {
    (dx + 2 * (dy + 2 * dz)) as usize
}

/// Child min-corner offset for an octant, in units of the child size.
pub fn octant_offset(octant: usize) -> IVec3 {
    IVec3::new(
        (octant & 1) as i32,
        ((octant >> 1) & 1) as i32,
        ((octant >> 2) & 1) as i32,
    )
}

/// A cell in the arena octree.
///
/// Relations are arena indices: the arena owns every node and children
/// never point back through references.
#[derive(Debug, Clone)]
pub struct OctreeNode {
    pub key: ChunkKey,
    pub is_leaf: bool,
    /// Filled in after construction; `[size; 8]` is never observed by callers.
    pub lod_array: LodArray,
    pub children: [Option<NodeId>; 8],
    pub parent: Option<NodeId>,
}

impl OctreeNode {
    pub(crate) fn new(key: ChunkKey, is_leaf: bool) -> Self {
        Self {
            key,
            is_leaf,
            lod_array: [key.size; 8],
            children: [None; 8],
            parent: None,
        }
    }

    pub fn min(&self) -> IVec3 {
        self.key.min
    }

    pub fn size(&self) -> i32 {
        self.key.size
    }

    /// Octant this cell occupies inside the aligned parent at `parent_min`.
    pub fn octant_in(&self, parent_min: IVec3, parent_size: i32) -> usize {
        let center = parent_min + IVec3::splat(parent_size / 2);
        let min = self.key.min;
        octant_index(
            i32::from(min.x >= center.x),
            i32::from(min.y >= center.y),
            i32::from(min.z >= center.z),
        )
    }

    pub fn to_chunk(&self) -> LodChunk {
        LodChunk {
            key: self.key,
            lod_array: self.lod_array,
        }
    }
}
