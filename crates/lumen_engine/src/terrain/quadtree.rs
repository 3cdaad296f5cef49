//! Adaptive terrain quadtree
//!
//! Nodes live in an arena. Children are laid out
//!
//! ```text
//!   +z
//! | 0 | 1 |
//! | 2 | 3 |
//!        +x
//! ```
//!
//! and neighbours are found with the classic upward search: a neighbour
//! inside the same parent is a sibling; otherwise ask the parent for its
//! neighbour and step into the matching child if it has one. The result is
//! either a node of the same LOD or a coarser leaf.
//!
//! Every leaf keeps a 4-bit mask of the edges whose neighbour is coarser, so
//! the draw can pick a fan that drops the vertices the neighbour lacks.

use std::collections::VecDeque;

use slotmap::SlotMap;

use crate::config::TerrainConfig;
use crate::foundation::math::Vec2;

slotmap::new_key_type! {
    /// Identifier of a quadtree node
    pub struct QuadNodeId;
}

/// Edge of a node, with its mask bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    /// -x
    Left,
    /// +z
    Forward,
    /// +x
    Right,
    /// -z
    Back,
}

impl Edge {
    /// All edges in mask bit order
    pub const ALL: [Self; 4] = [Self::Left, Self::Forward, Self::Right, Self::Back];

    /// Mask bit for the edge
    pub const fn bit(self) -> u8 {
        match self {
            Self::Left => 1,
            Self::Forward => 2,
            Self::Right => 4,
            Self::Back => 8,
        }
    }

    /// For a child with sibling index `sibling`, whether the neighbour across
    /// this edge lies outside the parent, and which child index it has in
    /// its own parent
    const fn step(self, sibling: usize) -> (bool, usize) {
        match (self, sibling) {
            (Self::Left, 0) => (true, 1),
            (Self::Left, 2) => (true, 3),
            (Self::Left, 1) => (false, 0),
            (Self::Left, _) => (false, 2),
            (Self::Right, 1) => (true, 0),
            (Self::Right, 3) => (true, 2),
            (Self::Right, 0) => (false, 1),
            (Self::Right, _) => (false, 3),
            (Self::Forward, 0) => (true, 2),
            (Self::Forward, 1) => (true, 3),
            (Self::Forward, 2) => (false, 0),
            (Self::Forward, _) => (false, 1),
            (Self::Back, 2) => (true, 0),
            (Self::Back, 3) => (true, 1),
            (Self::Back, 0) => (false, 2),
            (Self::Back, _) => (false, 3),
        }
    }
}

/// One square patch of terrain
#[derive(Debug, Clone)]
pub struct QuadNode {
    center: Vec2,
    half_size: f32,
    lod: u32,
    sibling: usize,
    parent: Option<QuadNodeId>,
    children: Option<[QuadNodeId; 4]>,
    vertex_resolution: f32,
    mask: u8,
}

impl QuadNode {
    /// Centre in terrain space (x, z)
    pub fn center(&self) -> Vec2 {
        self.center
    }

    /// Half the edge length
    pub fn half_size(&self) -> f32 {
        self.half_size
    }

    /// Depth in the tree; the root is 0
    pub fn lod(&self) -> u32 {
        self.lod
    }

    /// Index among its siblings
    pub fn sibling(&self) -> usize {
        self.sibling
    }

    /// Vertices per world unit
    pub fn vertex_resolution(&self) -> f32 {
        self.vertex_resolution
    }

    /// Edges bordering a coarser neighbour
    pub fn mask(&self) -> u8 {
        self.mask
    }

    /// Children, if split
    pub fn children(&self) -> Option<[QuadNodeId; 4]> {
        self.children
    }

    /// Whether the node has no children
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

/// LOD quadtree over a square terrain centred on the origin
#[derive(Debug, Clone)]
pub struct QuadTree {
    nodes: SlotMap<QuadNodeId, QuadNode>,
    root: QuadNodeId,
    max_vertex_resolution: f32,
}

impl QuadTree {
    /// Single-node tree for the terrain described by `config`
    pub fn new(config: &TerrainConfig) -> Self {
        let mut nodes = SlotMap::with_key();
        let size = config.size.max(f32::EPSILON);
        let root = nodes.insert(QuadNode {
            center: Vec2::zeros(),
            half_size: size * 0.5,
            lod: 0,
            sibling: 0,
            parent: None,
            children: None,
            vertex_resolution: config.patch_resolution as f32 / size,
            mask: 0,
        });
        Self {
            nodes,
            root,
            max_vertex_resolution: config.max_vertex_resolution,
        }
    }

    /// The root node
    pub fn root(&self) -> QuadNodeId {
        self.root
    }

    /// Node by id
    pub fn node(&self, id: QuadNodeId) -> Option<&QuadNode> {
        self.nodes.get(id)
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; the root is never removed
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `node` should be subdivided for a camera at `camera` (x, z)
    pub fn should_split(&self, node: &QuadNode, camera: Vec2) -> bool {
        let distance = (node.center - camera).abs();
        let reach = 2.0 * node.half_size;
        node.vertex_resolution < self.max_vertex_resolution && distance.x < reach && distance.y < reach
    }

    /// Split and join nodes for a camera at `camera`, breadth first from the
    /// root. Returns whether the tree changed.
    pub fn update(&mut self, camera: Vec2) -> bool {
        let mut changed = false;
        let mut queue = VecDeque::from([self.root]);
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let split = self.should_split(node, camera);
            if node.is_leaf() && split {
                self.split(id);
                changed = true;
            } else if node.parent.is_some() && !node.is_leaf() && !split {
                self.join(id);
                changed = true;
            }
            if let Some(children) = self.nodes.get(id).and_then(|node| node.children) {
                queue.extend(children);
            }
        }
        changed
    }

    /// Leaves in breadth-first order
    pub fn leaves(&self) -> Vec<QuadNodeId> {
        let mut leaves = Vec::new();
        let mut queue = VecDeque::from([self.root]);
        while let Some(id) = queue.pop_front() {
            match self.nodes.get(id).and_then(|node| node.children) {
                Some(children) => queue.extend(children),
                None => leaves.push(id),
            }
        }
        leaves
    }

    /// Node across `edge`: same LOD, or a coarser leaf. `None` on the
    /// terrain border.
    pub fn neighbor(&self, id: QuadNodeId, edge: Edge) -> Option<QuadNodeId> {
        let node = self.nodes.get(id)?;
        let parent_id = node.parent?;
        let (external, index) = edge.step(node.sibling);
        if !external {
            return self.nodes.get(parent_id)?.children.map(|children| children[index]);
        }
        let across = self.neighbor(parent_id, edge)?;
        Some(self.nodes.get(across)?.children.map_or(across, |children| children[index]))
    }

    /// Subdivide a leaf
    pub fn split(&mut self, id: QuadNodeId) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        if !node.is_leaf() {
            return;
        }
        let quarter = node.half_size * 0.5;
        let offsets = [
            Vec2::new(-quarter, quarter),
            Vec2::new(quarter, quarter),
            Vec2::new(-quarter, -quarter),
            Vec2::new(quarter, -quarter),
        ];
        let template = QuadNode {
            center: node.center,
            half_size: quarter,
            lod: node.lod + 1,
            sibling: 0,
            parent: Some(id),
            children: None,
            vertex_resolution: node.vertex_resolution * 2.0,
            mask: 0,
        };
        let children = [0, 1, 2, 3].map(|sibling| {
            self.nodes.insert(QuadNode {
                center: template.center + offsets[sibling],
                sibling,
                ..template.clone()
            })
        });
        if let Some(node) = self.nodes.get_mut(id) {
            node.children = Some(children);
        }
        for child in children {
            self.compute_mask(child);
        }
        self.update_neighbors(id);
    }

    /// Remove a node's subtree, making it a leaf again
    pub fn join(&mut self, id: QuadNodeId) {
        let Some(children) = self.nodes.get_mut(id).and_then(|node| node.children.take()) else {
            return;
        };
        let mut doomed = Vec::from(children);
        while let Some(child) = doomed.pop() {
            if let Some(node) = self.nodes.remove(child) {
                doomed.extend(node.children.into_iter().flatten());
            }
        }
        self.compute_mask(id);
        self.update_neighbors(id);
    }

    /// Recompute the mask of `id` and of its whole subtree
    fn compute_mask(&mut self, id: QuadNodeId) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        let lod = node.lod;
        let children = node.children;
        if let Some(children) = children {
            for child in children {
                self.compute_mask(child);
            }
        }
        let mask = Edge::ALL
            .into_iter()
            .filter(|&edge| {
                self.neighbor(id, edge)
                    .and_then(|neighbor| self.nodes.get(neighbor))
                    .is_some_and(|neighbor| neighbor.lod < lod)
            })
            .fold(0, |mask, edge| mask | edge.bit());
        if let Some(node) = self.nodes.get_mut(id) {
            node.mask = mask;
        }
    }

    fn update_neighbors(&mut self, id: QuadNodeId) {
        for edge in Edge::ALL {
            if let Some(neighbor) = self.neighbor(id, edge) {
                self.compute_mask(neighbor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> TerrainConfig {
        TerrainConfig {
            size: 256.0,
            height: 32.0,
            max_vertex_resolution: 1.0,
            patch_resolution: 16,
        }
    }

    /// Bit of `edge` must be set on every leaf bordering a coarser leaf
    /// across that edge, found by brute force over all leaf pairs
    fn check_masks(tree: &QuadTree) {
        let leaves = tree.leaves();
        for &a in &leaves {
            let node = tree.node(a).unwrap();
            let (amin, amax) = (node.center - Vec2::repeat(node.half_size), node.center + Vec2::repeat(node.half_size));
            let mut expected = 0;
            for &b in &leaves {
                let other = tree.node(b).unwrap();
                if other.lod >= node.lod {
                    continue;
                }
                let (bmin, bmax) =
                    (other.center - Vec2::repeat(other.half_size), other.center + Vec2::repeat(other.half_size));
                let overlap_z = amax.y.min(bmax.y) - amin.y.max(bmin.y);
                let overlap_x = amax.x.min(bmax.x) - amin.x.max(bmin.x);
                if overlap_z > 0.0 && amin.x == bmax.x {
                    expected |= Edge::Left.bit();
                }
                if overlap_z > 0.0 && amax.x == bmin.x {
                    expected |= Edge::Right.bit();
                }
                if overlap_x > 0.0 && amax.y == bmin.y {
                    expected |= Edge::Forward.bit();
                }
                if overlap_x > 0.0 && amin.y == bmax.y {
                    expected |= Edge::Back.bit();
                }
            }
            assert_eq!(node.mask, expected, "leaf at {:?} lod {}", node.center, node.lod);
        }
    }

    #[test]
    fn test_child_layout() {
        let mut tree = QuadTree::new(&config());
        let root = tree.root();
        tree.split(root);
        let children = tree.node(root).unwrap().children().unwrap();
        let centers: Vec<_> = children.iter().map(|id| tree.node(*id).unwrap().center()).collect();
        assert_eq!(centers, vec![
            Vec2::new(-64.0, 64.0),
            Vec2::new(64.0, 64.0),
            Vec2::new(-64.0, -64.0),
            Vec2::new(64.0, -64.0),
        ]);
        let child = tree.node(children[3]).unwrap();
        assert_eq!(child.lod(), 1);
        assert_relative_eq!(child.half_size(), 64.0);
        assert_relative_eq!(child.vertex_resolution(), 2.0 * 16.0 / 256.0);

        assert_eq!(tree.neighbor(children[0], Edge::Right), Some(children[1]));
        assert_eq!(tree.neighbor(children[0], Edge::Back), Some(children[2]));
        assert_eq!(tree.neighbor(children[3], Edge::Left), Some(children[2]));
        assert_eq!(tree.neighbor(children[3], Edge::Forward), Some(children[1]));
        assert_eq!(tree.neighbor(children[0], Edge::Left), None);
        assert_eq!(tree.neighbor(children[0], Edge::Forward), None);
    }

    #[test]
    fn test_neighbor_across_parents() {
        let mut tree = QuadTree::new(&config());
        let root = tree.root();
        tree.split(root);
        let [top_left, top_right, ..] = tree.node(root).unwrap().children().unwrap();
        tree.split(top_left);
        let grandchildren = tree.node(top_left).unwrap().children().unwrap();

        // Coarser leaf across the parent boundary
        assert_eq!(tree.neighbor(grandchildren[1], Edge::Right), Some(top_right));
        assert_eq!(tree.node(grandchildren[1]).unwrap().mask(), Edge::Right.bit());
        assert_eq!(tree.node(grandchildren[3]).unwrap().mask(), Edge::Right.bit() | Edge::Back.bit());
        assert_eq!(tree.node(grandchildren[0]).unwrap().mask(), 0);

        // Same-LOD node once the neighbour is split too
        tree.split(top_right);
        let right_children = tree.node(top_right).unwrap().children().unwrap();
        assert_eq!(tree.neighbor(grandchildren[1], Edge::Right), Some(right_children[0]));
        assert_eq!(tree.node(grandchildren[1]).unwrap().mask(), 0);
        check_masks(&tree);
    }

    #[test]
    fn test_should_split_needs_resolution_and_proximity() {
        let tree = QuadTree::new(&config());
        let root = tree.node(tree.root()).unwrap();
        assert!(tree.should_split(root, Vec2::new(10.0, -20.0)));
        assert!(!tree.should_split(root, Vec2::new(300.0, 0.0)));

        let coarse = TerrainConfig {
            max_vertex_resolution: 0.01,
            ..config()
        };
        let tree = QuadTree::new(&coarse);
        assert!(!tree.should_split(tree.node(tree.root()).unwrap(), Vec2::zeros()));
    }

    #[test]
    fn test_update_refines_toward_camera() {
        let mut tree = QuadTree::new(&config());
        assert!(tree.update(Vec2::new(100.0, 100.0)));
        let leaves = tree.leaves();
        let finest = leaves.iter().map(|id| tree.node(*id).unwrap().lod()).max().unwrap();
        // 16 / 256 doubles four times to reach 1.0
        assert_eq!(finest, 4);
        for id in &leaves {
            let node = tree.node(*id).unwrap();
            assert!(node.vertex_resolution() <= 1.0 + 1e-6);
        }
        check_masks(&tree);
        assert!(!tree.update(Vec2::new(100.0, 100.0)));
    }

    #[test]
    fn test_masks_stay_consistent_as_camera_moves() {
        let mut tree = QuadTree::new(&config());
        for camera in [
            Vec2::new(0.0, 0.0),
            Vec2::new(90.0, -30.0),
            Vec2::new(-120.0, 120.0),
            Vec2::new(5.0, 60.0),
            Vec2::new(1000.0, 1000.0),
        ] {
            tree.update(camera);
            check_masks(&tree);
            let leaf_area: f32 = tree
                .leaves()
                .iter()
                .map(|id| (2.0 * tree.node(*id).unwrap().half_size()).powi(2))
                .sum();
            assert_relative_eq!(leaf_area, 256.0 * 256.0);
        }
    }

    #[test]
    fn test_join_frees_subtree() {
        let mut tree = QuadTree::new(&config());
        tree.update(Vec2::zeros());
        assert!(tree.len() > 5);
        let root = tree.root();
        let children = tree.node(root).unwrap().children().unwrap();
        tree.join(children[0]);
        tree.join(children[1]);
        tree.join(children[2]);
        tree.join(children[3]);
        assert_eq!(tree.len(), 5);
        assert!(tree.leaves().iter().all(|id| tree.node(*id).unwrap().mask() == 0));
    }
}
