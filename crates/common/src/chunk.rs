use std::cmp::Ordering;
use std::fmt;

use glam::IVec3;
use serde::{Deserialize, Serialize};

/// Resolution of the leaf containing each of a cell's 8 corners.
pub type LodArray = [i32; 8];

/// Corner sample offsets, in units of the cell's own size.
///
/// The order is fixed: consumers index a [`LodArray`] with it.
pub const CORNER_OFFSETS: [IVec3; 8] = [
    IVec3::new(0, 0, 0),
    IVec3::new(1, 0, 0),
    IVec3::new(0, 0, 1),
    IVec3::new(1, 0, 1),
    IVec3::new(0, 1, 0),
    IVec3::new(1, 1, 0),
    IVec3::new(0, 1, 1),
    IVec3::new(1, 1, 1),
];

/// Identity of an octree cell: min corner plus size ("lod").
///
/// Ordered by `(min.x, min.y, min.z, size)` so that tables keyed by cell
/// iterate in the same order on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub min: IVec3,
    pub size: i32,
}

impl ChunkKey {
    pub fn new(min: IVec3, size: i32) -> Self {
        Self { min, size }
    }

    /// True if `point` lies inside the half-open volume `[min, min + size)`.
    pub fn contains_point(&self, point: IVec3) -> bool {
        let max = self.min + IVec3::splat(self.size);
        point.cmpge(self.min).all() && point.cmplt(max).all()
    }

    fn sort_tuple(&self) -> (i32, i32, i32, i32) {
        (self.min.x, self.min.y, self.min.z, self.size)
    }
}

impl Ord for ChunkKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_tuple().cmp(&other.sort_tuple())
    }
}

impl PartialOrd for ChunkKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}:{}",
            self.min.x, self.min.y, self.min.z, self.size
        )
    }
}

/// A leaf cell as seen by the streaming layer: the unit of add/remove.
///
/// Two chunks are the same streaming unit only if they are [`lod_equals`]:
/// a chunk whose neighbours changed resolution needs different seam data
/// even though its identity did not change.
///
/// [`lod_equals`]: LodChunk::lod_equals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LodChunk {
    pub key: ChunkKey,
    pub lod_array: LodArray,
}

impl LodChunk {
    pub fn new(min: IVec3, size: i32, lod_array: LodArray) -> Self {
        Self {
            key: ChunkKey::new(min, size),
            lod_array,
        }
    }

    pub fn min(&self) -> IVec3 {
        self.key.min
    }

    pub fn size(&self) -> i32 {
        self.key.size
    }

    /// Same min corner and size.
    pub fn node_equals(&self, other: &LodChunk) -> bool {
        self.key == other.key
    }

    /// Same identity and same seam resolution on every corner.
    pub fn lod_equals(&self, other: &LodChunk) -> bool {
        self.node_equals(other) && self.lod_array == other.lod_array
    }

    pub fn contains_point(&self, point: IVec3) -> bool {
        self.key.contains_point(point)
    }
}

impl fmt::Display for LodChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk:{}:{}:{}:{}",
            self.key.min.x, self.key.min.y, self.key.min.z, self.key.size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_point_is_half_open() {
        let key = ChunkKey::new(IVec3::new(-2, 0, 0), 2);
        assert!(key.contains_point(IVec3::new(-2, 0, 0)));
        assert!(key.contains_point(IVec3::new(-1, 1, 1)));
        assert!(!key.contains_point(IVec3::new(0, 0, 0)));
        assert!(!key.contains_point(IVec3::new(-3, 0, 0)));
    }

    #[test]
    fn keys_order_by_min_then_size() {
        let mut keys = vec![
            ChunkKey::new(IVec3::new(1, 0, 0), 1),
            ChunkKey::new(IVec3::new(0, 0, 0), 2),
            ChunkKey::new(IVec3::new(0, 0, 0), 1),
            ChunkKey::new(IVec3::new(-1, 5, 5), 1),
        ];
        keys.sort();
        assert_eq!(keys[0].min, IVec3::new(-1, 5, 5));
        assert_eq!(keys[1], ChunkKey::new(IVec3::ZERO, 1));
        assert_eq!(keys[2], ChunkKey::new(IVec3::ZERO, 2));
        assert_eq!(keys[3].min, IVec3::new(1, 0, 0));
    }

    #[test]
    fn lod_equality_requires_matching_corners() {
        let a = LodChunk::new(IVec3::ZERO, 2, [2; 8]);
        let mut b = a.clone();
        assert!(a.lod_equals(&b));

        b.lod_array[7] = 4;
        assert!(a.node_equals(&b));
        assert!(!a.lod_equals(&b));

        let c = LodChunk::new(IVec3::ZERO, 4, [2; 8]);
        assert!(!a.node_equals(&c));
    }

    #[test]
    fn chunk_display_names_the_cell() {
        let chunk = LodChunk::new(IVec3::new(3, -1, 4), 1, [1; 8]);
        assert_eq!(chunk.to_string(), "chunk:3:-1:4:1");
        assert_eq!(chunk.key.to_string(), "3,-1,4:1");
    }

    #[test]
    fn chunk_serializes_as_plain_values() {
        let chunk = LodChunk::new(IVec3::new(1, 2, 3), 4, [4, 4, 2, 2, 4, 4, 2, 2]);
        let json = serde_json::to_string(&chunk).unwrap();
        let back: LodChunk = serde_json::from_str(&json).unwrap();
        assert!(back.lod_equals(&chunk));
    }
}
