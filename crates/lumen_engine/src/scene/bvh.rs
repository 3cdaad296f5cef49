//! Bounding volume hierarchy over scene objects
//!
//! Built top-down by splitting at the median centroid along the longest
//! axis. Nodes are stored depth first: a node's left child directly follows
//! it and its right child sits `right_offset` entries later; leaves have a
//! `right_offset` of zero. Every node carries the OR of its primitives'
//! masks so masked queries can skip whole subtrees.
//!
//! The hierarchy is a snapshot: it is not updated when objects move and must
//! be rebuilt by its owner.

use super::transform::ObjectId;
use crate::foundation::math::{Aabb, Frustum, Ray};

/// An object entered into the hierarchy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BvhItem {
    /// The object
    pub object: ObjectId,
    /// World-space bounds
    pub bounds: Aabb,
    /// Mask matched against query masks
    pub mask: u32,
}

#[derive(Debug, Clone, Copy)]
struct BvhNode {
    bounds: Aabb,
    start: usize,
    count: usize,
    right_offset: usize,
    mask: u32,
}

impl BvhNode {
    fn is_leaf(&self) -> bool {
        self.right_offset == 0
    }
}

/// Object hierarchy for culling and ray queries
#[derive(Debug, Clone)]
pub struct ObjectBvh {
    nodes: Vec<BvhNode>,
    primitives: Vec<BvhItem>,
    leaf_size: usize,
}

impl Default for ObjectBvh {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ObjectBvh {
    /// Empty hierarchy whose leaves hold at most `leaf_size` objects
    pub fn new(leaf_size: usize) -> Self {
        Self {
            nodes: Vec::new(),
            primitives: Vec::new(),
            leaf_size: leaf_size.max(1),
        }
    }

    /// Rebuild from `items`, keeping those whose mask overlaps `mask`
    pub fn build(&mut self, items: impl IntoIterator<Item = BvhItem>, mask: u32) {
        self.nodes.clear();
        self.primitives.clear();
        self.primitives
            .extend(items.into_iter().filter(|item| item.mask & mask != 0 && item.bounds.is_valid()));
        if !self.primitives.is_empty() {
            self.build_node(0, self.primitives.len());
        }
        log::trace!("Built BVH: {} objects, {} nodes", self.primitives.len(), self.nodes.len());
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    /// Whether the hierarchy is empty
    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    /// Bounds of everything in the hierarchy
    pub fn bounds(&self) -> Aabb {
        self.nodes.first().map_or_else(Aabb::empty, |root| root.bounds)
    }

    /// Bounds of every node, root first
    pub fn node_bounds(&self) -> impl Iterator<Item = &Aabb> + '_ {
        self.nodes.iter().map(|node| &node.bounds)
    }

    /// Append to `out` every object matching `mask` whose bounds intersect
    /// the frustum
    pub fn frustum_check(&self, frustum: &Frustum, mask: u32, out: &mut Vec<ObjectId>) {
        if self.nodes.is_empty() {
            return;
        }
        let mut stack = vec![0];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if node.mask & mask == 0 || !frustum.intersects_aabb(&node.bounds) {
                continue;
            }
            if node.is_leaf() {
                out.extend(
                    self.primitives[node.start..node.start + node.count]
                        .iter()
                        .filter(|item| item.mask & mask != 0 && frustum.intersects_aabb(&item.bounds))
                        .map(|item| item.object),
                );
            } else {
                stack.push(index + node.right_offset);
                stack.push(index + 1);
            }
        }
    }

    /// Closest object hit by `ray` (any hit when `any` is set), testing
    /// object bounds only
    pub fn intersect(&self, ray: &Ray, any: bool, mask: u32) -> Option<(ObjectId, f32)> {
        self.intersect_with(ray, any, mask, |item| item.bounds.intersect_ray(ray))
    }

    /// Like [`ObjectBvh::intersect`], with `test` giving the precise hit
    /// distance for an object whose bounds the ray enters
    pub fn intersect_with<F>(&self, ray: &Ray, any: bool, mask: u32, mut test: F) -> Option<(ObjectId, f32)>
    where
        F: FnMut(&BvhItem) -> Option<f32>,
    {
        let root = self.nodes.first()?;
        let root_hit = root.bounds.intersect_ray(ray)?;
        let mut best: Option<(ObjectId, f32)> = None;
        let mut stack = vec![(0_usize, root_hit)];

        while let Some((index, entry)) = stack.pop() {
            if best.is_some_and(|(_, distance)| entry >= distance) {
                continue;
            }
            let node = &self.nodes[index];
            if node.mask & mask == 0 {
                continue;
            }

            if node.is_leaf() {
                for item in &self.primitives[node.start..node.start + node.count] {
                    if item.mask & mask == 0 || item.bounds.intersect_ray(ray).is_none() {
                        continue;
                    }
                    if let Some(distance) = test(item) {
                        if best.map_or(true, |(_, closest)| distance < closest) {
                            best = Some((item.object, distance));
                            if any {
                                return best;
                            }
                        }
                    }
                }
                continue;
            }

            let left = index + 1;
            let right = index + node.right_offset;
            let hits = [
                (left, self.nodes[left].bounds.intersect_ray(ray)),
                (right, self.nodes[right].bounds.intersect_ray(ray)),
            ];
            let mut hits: Vec<(usize, f32)> = hits
                .into_iter()
                .filter_map(|(child, hit)| hit.map(|distance| (child, distance)))
                .collect();
            // Farther child first so the nearer one is popped next
            hits.sort_by(|a, b| b.1.total_cmp(&a.1));
            stack.extend(hits);
        }
        best
    }

    fn build_node(&mut self, start: usize, end: usize) -> usize {
        let index = self.nodes.len();
        let items = &self.primitives[start..end];
        let mut bounds = Aabb::empty();
        let mut centroids = Aabb::empty();
        let mut mask = 0;
        for item in items {
            bounds.encapsulate(&item.bounds);
            centroids.encapsulate_point(item.bounds.center());
            mask |= item.mask;
        }
        self.nodes.push(BvhNode {
            bounds,
            start,
            count: end - start,
            right_offset: 0,
            mask,
        });

        if end - start <= self.leaf_size {
            return index;
        }

        let extent = centroids.max - centroids.min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };
        let middle = start + (end - start) / 2;
        self.primitives[start..end].select_nth_unstable_by(middle - start, |a, b| {
            a.bounds.center()[axis].total_cmp(&b.bounds.center()[axis])
        });

        self.build_node(start, middle);
        let right = self.build_node(middle, end);
        let node = &mut self.nodes[index];
        node.right_offset = right - index;
        node.count = 0;
        index
    }
}
