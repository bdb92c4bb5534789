use std::collections::{HashMap, HashSet};

use glam::IVec3;
use lodtrack_common::{CORNER_OFFSETS, ChunkKey, LodArray, LodChunk, align_down};

use crate::error::OctreeError;
use crate::node::{NodeId, OctreeNode, octant_offset};

/// Largest accepted finest-level range; a full build visits `(2r + 1)^3`
/// lattice points.
pub const MAX_RANGE: i32 = 255;

/// Builds viewer-centred octrees for a fixed finest-level range and max lod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OctreeBuilder {
    range: i32,
    max_lod: i32,
}

impl OctreeBuilder {
    /// `range` is the half-width of the size-1 cube around the viewer;
    /// `max_lod` is the size of the coarsest (root) cells.
    pub fn new(range: i32, max_lod: i32) -> Result<Self, OctreeError> {
        if range < 0 {
            return Err(OctreeError::NegativeRange(range));
        }
        if range > MAX_RANGE {
            return Err(OctreeError::RangeTooLarge {
                range,
                max: MAX_RANGE,
            });
        }
        if max_lod <= 0 || max_lod & (max_lod - 1) != 0 {
            return Err(OctreeError::InvalidMaxLod(max_lod));
        }
        Ok(Self { range, max_lod })
    }

    pub fn range(&self) -> i32 {
        self.range
    }

    pub fn max_lod(&self) -> i32 {
        self.max_lod
    }

    /// Build the octree around grid coordinate `center`.
    ///
    /// Every lattice point within `range` of `center` becomes a size-1 leaf
    /// whose ancestor chain is built up to `max_lod`. Any cell that gets a
    /// child gets all 8 of them, so the leaves form a gap-free tiling of the
    /// root cells.
    pub fn build(&self, center: IVec3) -> Result<Octree, OctreeError> {
        let _span = tracing::debug_span!(
            "octree_build",
            ?center,
            range = self.range,
            max_lod = self.max_lod
        )
        .entered();

        let side = (2 * self.range + 1) as usize;
        let mut tree = Octree::with_capacity(self.max_lod, side * side * side * 2);

        let worklist = lattice(center, self.range);
        for point in worklist {
            self.build_upwards(&mut tree, point)?;
        }

        tree.validate()?;
        tree.assign_lod_arrays();

        tracing::debug!(
            nodes = tree.len(),
            leaves = tree.leaves().count(),
            roots = tree.roots().count(),
            "octree built"
        );
        Ok(tree)
    }

    /// Walk from a size-1 cell up to the root, splitting each ancestor the
    /// first time one of its octants is reached.
    fn build_upwards(&self, tree: &mut Octree, point: IVec3) -> Result<(), OctreeError> {
        let mut current = tree.get_or_create(ChunkKey::new(point, 1))?;
        for level in 1..=self.max_lod.trailing_zeros() {
            let size = 1 << level;
            let child = tree.node(current);
            let parent_min = align_down(child.min(), size);
            let octant = child.octant_in(parent_min, size);

            let parent = tree.get_or_create(ChunkKey::new(parent_min, size))?;
            tree.node_mut(parent).is_leaf = false;
            if tree.node(parent).children[octant].is_none() {
                tree.split(parent, octant, current)?;
            }
            current = parent;
        }
        Ok(())
    }
}

/// Convenience wrapper: build and return only the leaf chunks.
pub fn construct_leaves(
    center: IVec3,
    range: i32,
    max_lod: i32,
) -> Result<Vec<LodChunk>, OctreeError> {
    Ok(OctreeBuilder::new(range, max_lod)?
        .build(center)?
        .leaf_chunks())
}

fn lattice(center: IVec3, range: i32) -> Vec<IVec3> {
    let mut points = Vec::new();
    for dx in -range..=range {
        for dy in -range..=range {
            for dz in -range..=range {
                points.push(center + IVec3::new(dx, dy, dz));
            }
        }
    }
    points
}

/// Arena octree produced by [`OctreeBuilder::build`].
#[derive(Debug, Clone)]
pub struct Octree {
    nodes: Vec<OctreeNode>,
    index: HashMap<ChunkKey, NodeId>,
    max_lod: i32,
}

impl Octree {
    fn with_capacity(max_lod: i32, capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            max_lod,
        }
    }

    pub fn max_lod(&self) -> i32 {
        self.max_lod
    }

    /// Total number of cells, leaf or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &OctreeNode {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut OctreeNode {
        &mut self.nodes[id.index()]
    }

    pub fn id_of(&self, key: ChunkKey) -> Option<NodeId> {
        self.index.get(&key).copied()
    }

    pub fn get(&self, key: ChunkKey) -> Option<&OctreeNode> {
        self.id_of(key).map(|id| self.node(id))
    }

    /// All cells in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &OctreeNode> {
        self.nodes.iter()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &OctreeNode> {
        self.nodes.iter().filter(|node| node.is_leaf)
    }

    /// Cells at the coarsest size.
    pub fn roots(&self) -> impl Iterator<Item = &OctreeNode> {
        let max_lod = self.max_lod;
        self.nodes.iter().filter(move |node| node.size() == max_lod)
    }

    pub fn leaf_chunks(&self) -> Vec<LodChunk> {
        self.leaves().map(OctreeNode::to_chunk).collect()
    }

    /// The leaf whose volume contains `point`, if any.
    ///
    /// Cells are size-aligned, so probing the aligned key at each size finds
    /// the same leaf as a scan over all leaves would.
    pub fn leaf_at(&self, point: IVec3) -> Option<&OctreeNode> {
        self.sizes()
            .filter_map(|size| self.get(ChunkKey::new(align_down(point, size), size)))
            .find(|node| node.is_leaf)
    }

    fn sizes(&self) -> impl Iterator<Item = i32> + use<> {
        (0..=self.max_lod.trailing_zeros()).map(|level| 1 << level)
    }

    fn create(&mut self, key: ChunkKey, is_leaf: bool) -> Result<NodeId, OctreeError> {
        if self.index.contains_key(&key) {
            return Err(OctreeError::DuplicateNode(key));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(OctreeNode::new(key, is_leaf));
        self.index.insert(key, id);
        Ok(id)
    }

    fn get_or_create(&mut self, key: ChunkKey) -> Result<NodeId, OctreeError> {
        match self.id_of(key) {
            Some(id) => Ok(id),
            None => self.create(key, key.size == 1),
        }
    }

    /// Install `child` in `octant` of `parent` and create the 7 siblings as
    /// fresh leaves.
    fn split(&mut self, parent: NodeId, octant: usize, child: NodeId) -> Result<(), OctreeError> {
        let parent_key = self.node(parent).key;
        let half = parent_key.size / 2;

        self.node_mut(parent).children[octant] = Some(child);
        self.node_mut(child).parent = Some(parent);

        for sibling in 0..8 {
            if self.node(parent).children[sibling].is_some() {
                continue;
            }
            let min = parent_key.min + octant_offset(sibling) * half;
            let id = self.create(ChunkKey::new(min, half), true)?;
            self.node_mut(id).parent = Some(parent);
            self.node_mut(parent).children[sibling] = Some(id);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), OctreeError> {
        let mut finest = HashSet::new();
        for node in self.nodes.iter().filter(|node| node.size() == 1) {
            if !finest.insert(node.key) {
                return Err(OctreeError::DuplicateFinestNode(node.key));
            }
        }

        for leaf in self.leaves() {
            for child in leaf.children.iter().flatten() {
                if self.node(*child).is_leaf {
                    return Err(OctreeError::LeafWithLeafChild(leaf.key));
                }
            }

            // A leaf at another size aligned on this leaf's min corner either
            // contains it (coarser) or sits inside it (finer).
            for size in self.sizes().filter(|size| *size != leaf.size()) {
                let probe = ChunkKey::new(align_down(leaf.min(), size), size);
                if let Some(other) = self.get(probe) {
                    if other.is_leaf {
                        let (outer, inner) = if size > leaf.size() {
                            (other.key, leaf.key)
                        } else {
                            (leaf.key, other.key)
                        };
                        return Err(OctreeError::NestedLeaf { outer, inner });
                    }
                }
            }
        }
        Ok(())
    }

    fn assign_lod_arrays(&mut self) {
        let arrays: Vec<LodArray> = self
            .nodes
            .iter()
            .map(|node| {
                let mut lods = [node.size(); 8];
                for (slot, offset) in lods.iter_mut().zip(CORNER_OFFSETS) {
                    let corner = node.min() + offset * node.size();
                    if let Some(leaf) = self.leaf_at(corner) {
                        *slot = leaf.size();
                    }
                }
                lods
            })
            .collect();

        for (node, lods) in self.nodes.iter_mut().zip(arrays) {
            node.lod_array = lods;
        }
    }
}
