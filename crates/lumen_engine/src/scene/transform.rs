//! Transform hierarchy
//!
//! Nodes live in a [`SlotMap`] arena keyed by [`ObjectId`]. A parent is a
//! plain id and children are a list of ids, so removing a node can never
//! leave a dangling reference behind: stale ids simply fail to resolve.
//!
//! Setting a local component marks the node and its whole subtree dirty
//! right away (O(subtree)). World matrices are recomputed lazily on read, so
//! reading a clean node is O(1) and reading a dirty one only walks up to the
//! first clean ancestor.

use slotmap::SlotMap;

use crate::foundation::math::{Mat4, Quat, Transform, Vec3};

slotmap::new_key_type! {
    /// Identifier of an object in a scene and of its transform node
    pub struct ObjectId;
}

/// One node of the hierarchy
#[derive(Debug, Clone)]
pub struct TransformNode {
    local: Transform,
    object_to_world: Mat4,
    world_to_object: Mat4,
    world_position: Vec3,
    world_rotation: Quat,
    dirty: bool,
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
}

impl TransformNode {
    fn new(local: Transform) -> Self {
        Self {
            local,
            object_to_world: Mat4::identity(),
            world_to_object: Mat4::identity(),
            world_position: Vec3::zeros(),
            world_rotation: Quat::identity(),
            dirty: true,
            parent: None,
            children: Vec::new(),
        }
    }
}

/// Arena of transform nodes
#[derive(Debug, Clone, Default)]
pub struct TransformTree {
    nodes: SlotMap<ObjectId, TransformNode>,
}

impl TransformTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `id` refers to a live node
    pub fn contains(&self, id: ObjectId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Insert a root node
    pub fn insert(&mut self, local: Transform) -> ObjectId {
        self.nodes.insert(TransformNode::new(local))
    }

    /// Remove a node. It is detached from its parent and its children become
    /// roots; they are not re-parented to the removed node's parent.
    pub fn remove(&mut self, id: ObjectId) -> Option<Transform> {
        let node = self.nodes.remove(id)?;
        if let Some(parent) = node.parent.and_then(|parent| self.nodes.get_mut(parent)) {
            parent.children.retain(|child| *child != id);
        }
        for child in node.children {
            if let Some(child_node) = self.nodes.get_mut(child) {
                child_node.parent = None;
            }
            self.mark_dirty(child);
        }
        Some(node.local)
    }

    /// Local transform of a node
    pub fn local(&self, id: ObjectId) -> Option<&Transform> {
        self.nodes.get(id).map(|node| &node.local)
    }

    /// Replace the whole local transform
    pub fn set_local(&mut self, id: ObjectId, local: Transform) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.local = local;
            self.mark_dirty(id);
        }
    }

    /// Set the local position
    pub fn set_local_position(&mut self, id: ObjectId, position: Vec3) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.local.position = position;
            self.mark_dirty(id);
        }
    }

    /// Set the local rotation
    pub fn set_local_rotation(&mut self, id: ObjectId, rotation: Quat) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.local.rotation = rotation;
            self.mark_dirty(id);
        }
    }

    /// Set the local scale
    pub fn set_local_scale(&mut self, id: ObjectId, scale: Vec3) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.local.scale = scale;
            self.mark_dirty(id);
        }
    }

    /// Object-to-world matrix, recomputed if stale
    pub fn world_matrix(&mut self, id: ObjectId) -> Option<Mat4> {
        self.refresh(id);
        self.nodes.get(id).map(|node| node.object_to_world)
    }

    /// World-to-object matrix, recomputed if stale
    pub fn inverse_world_matrix(&mut self, id: ObjectId) -> Option<Mat4> {
        self.refresh(id);
        self.nodes.get(id).map(|node| node.world_to_object)
    }

    /// World-space position, recomputed if stale
    pub fn world_position(&mut self, id: ObjectId) -> Option<Vec3> {
        self.refresh(id);
        self.nodes.get(id).map(|node| node.world_position)
    }

    /// World-space rotation, recomputed if stale
    pub fn world_rotation(&mut self, id: ObjectId) -> Option<Quat> {
        self.refresh(id);
        self.nodes.get(id).map(|node| node.world_rotation)
    }

    /// Whether the node's cached world data is stale
    pub fn is_dirty(&self, id: ObjectId) -> bool {
        self.nodes.get(id).is_some_and(|node| node.dirty)
    }

    /// Parent of a node
    pub fn parent(&self, id: ObjectId) -> Option<ObjectId> {
        self.nodes.get(id).and_then(|node| node.parent)
    }

    /// Children of a node, in attachment order
    pub fn children(&self, id: ObjectId) -> &[ObjectId] {
        self.nodes.get(id).map_or(&[], |node| node.children.as_slice())
    }

    /// Move `child` under `parent`, or make it a root with `None`.
    ///
    /// Returns `false` and changes nothing if an id is unknown or the move
    /// would make a node its own ancestor.
    pub fn set_parent(&mut self, child: ObjectId, parent: Option<ObjectId>) -> bool {
        if !self.nodes.contains_key(child) {
            return false;
        }
        if let Some(parent) = parent {
            if !self.nodes.contains_key(parent) || self.is_ancestor_or_self(child, parent) {
                return false;
            }
        }

        let old_parent = self.nodes[child].parent;
        if old_parent == parent {
            return true;
        }
        if let Some(old) = old_parent.and_then(|old| self.nodes.get_mut(old)) {
            old.children.retain(|id| *id != child);
        }
        if let Some(new) = parent.and_then(|new| self.nodes.get_mut(new)) {
            new.children.push(child);
        }
        self.nodes[child].parent = parent;
        self.mark_dirty(child);
        true
    }

    /// Ids of every node
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.nodes.keys()
    }

    fn is_ancestor_or_self(&self, ancestor: ObjectId, mut id: ObjectId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.nodes.get(id).and_then(|node| node.parent) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }

    fn mark_dirty(&mut self, id: ObjectId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(id) {
                node.dirty = true;
                stack.extend_from_slice(&node.children);
            }
        }
    }

    fn refresh(&mut self, id: ObjectId) {
        // Dirtiness propagates down eagerly, so every ancestor of a clean
        // node is clean too.
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.nodes.get(current) {
                Some(node) if node.dirty => {
                    chain.push(current);
                    cursor = node.parent;
                }
                _ => break,
            }
        }

        for current in chain.into_iter().rev() {
            let parent = self.nodes[current]
                .parent
                .and_then(|parent| self.nodes.get(parent))
                .map(|parent| (parent.object_to_world, parent.world_rotation));
            let node = &mut self.nodes[current];
            let (parent_matrix, parent_rotation) = parent.unwrap_or((Mat4::identity(), Quat::identity()));

            node.object_to_world = parent_matrix * node.local.to_matrix();
            node.world_to_object = node.object_to_world.try_inverse().unwrap_or_else(Mat4::identity);
            node.world_position = node.object_to_world.column(3).xyz();
            node.world_rotation = parent_rotation * node.local.rotation;
            node.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON: f32 = 1e-4;

    fn transform(x: f32, angle: f32, scale: f32) -> Transform {
        Transform {
            position: Vec3::new(x, 1.0, -2.0),
            rotation: Quat::from_axis_angle(&Vec3::y_axis(), angle),
            scale: Vec3::repeat(scale),
        }
    }

    fn chain(tree: &mut TransformTree, length: usize) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = Vec::new();
        for i in 0..length {
            let id = tree.insert(transform(i as f32, 0.3 * i as f32, 1.0 + 0.5 * i as f32));
            if let Some(parent) = ids.last() {
                assert!(tree.set_parent(id, Some(*parent)));
            }
            ids.push(id);
        }
        ids
    }

    fn composed(tree: &TransformTree, ids: &[ObjectId], upto: usize) -> Mat4 {
        ids[..=upto]
            .iter()
            .fold(Mat4::identity(), |matrix, id| matrix * tree.local(*id).unwrap().to_matrix())
    }

    #[test]
    fn test_descendants_never_read_stale() {
        let mut tree = TransformTree::new();
        let ids = chain(&mut tree, 4);
        for (i, id) in ids.iter().enumerate() {
            let expected = composed(&tree, &ids, i);
            assert_relative_eq!(tree.world_matrix(*id).unwrap(), expected, epsilon = EPSILON);
        }

        tree.set_local_position(ids[0], Vec3::new(10.0, 0.0, 0.0));
        tree.set_local_rotation(ids[1], Quat::from_axis_angle(&Vec3::x_axis(), 1.1));
        assert!(ids.iter().all(|id| tree.is_dirty(*id)));

        // Read the deepest node first, then the rest
        for i in (0..ids.len()).rev() {
            let expected = composed(&tree, &ids, i);
            assert_relative_eq!(tree.world_matrix(ids[i]).unwrap(), expected, epsilon = EPSILON);
            let inverse = tree.inverse_world_matrix(ids[i]).unwrap();
            assert_relative_eq!(inverse * expected, Mat4::identity(), epsilon = EPSILON);
        }
    }

    #[test]
    fn test_world_position_and_rotation() {
        let mut tree = TransformTree::new();
        let parent = tree.insert(Transform {
            position: Vec3::new(1.0, 0.0, 0.0),
            rotation: Quat::from_axis_angle(&Vec3::z_axis(), std::f32::consts::FRAC_PI_2),
            scale: Vec3::repeat(2.0),
        });
        let child = tree.insert(Transform::from_position(Vec3::new(1.0, 0.0, 0.0)));
        tree.set_parent(child, Some(parent));

        // parent.position + parent.rotation * (parent.scale * local.position)
        assert_relative_eq!(tree.world_position(child).unwrap(), Vec3::new(1.0, 2.0, 0.0), epsilon = EPSILON);
        let rotation = tree.world_rotation(child).unwrap();
        assert_relative_eq!(rotation.angle(), std::f32::consts::FRAC_PI_2, epsilon = EPSILON);
    }

    #[test]
    fn test_set_parent_rejects_cycles() {
        let mut tree = TransformTree::new();
        let ids = chain(&mut tree, 3);
        assert!(!tree.set_parent(ids[0], Some(ids[2])));
        assert!(!tree.set_parent(ids[1], Some(ids[1])));
        assert_eq!(tree.parent(ids[0]), None);
        assert_eq!(tree.children(ids[2]), &[] as &[ObjectId]);

        let removed = tree.insert(Transform::identity());
        tree.remove(removed);
        assert!(!tree.set_parent(ids[0], Some(removed)));
    }

    #[test]
    fn test_reparent_moves_child_lists() {
        let mut tree = TransformTree::new();
        let a = tree.insert(Transform::identity());
        let b = tree.insert(Transform::from_position(Vec3::new(5.0, 0.0, 0.0)));
        let child = tree.insert(Transform::from_position(Vec3::new(0.0, 1.0, 0.0)));

        assert!(tree.set_parent(child, Some(a)));
        assert_eq!(tree.children(a), &[child]);
        assert!(tree.set_parent(child, Some(b)));
        assert!(tree.children(a).is_empty());
        assert_eq!(tree.children(b), &[child]);
        assert_relative_eq!(tree.world_position(child).unwrap(), Vec3::new(5.0, 1.0, 0.0), epsilon = EPSILON);

        assert!(tree.set_parent(child, None));
        assert!(tree.children(b).is_empty());
        assert_relative_eq!(tree.world_position(child).unwrap(), Vec3::new(0.0, 1.0, 0.0), epsilon = EPSILON);
    }

    #[test]
    fn test_remove_detaches_children() {
        let mut tree = TransformTree::new();
        let root = tree.insert(Transform::identity());
        let parent = tree.insert(Transform::from_position(Vec3::new(3.0, 0.0, 0.0)));
        let first = tree.insert(Transform::from_position(Vec3::new(1.0, 0.0, 0.0)));
        let second = tree.insert(Transform::from_position(Vec3::new(2.0, 0.0, 0.0)));
        tree.set_parent(parent, Some(root));
        tree.set_parent(first, Some(parent));
        tree.set_parent(second, Some(parent));
        tree.world_matrix(first);

        assert!(tree.remove(parent).is_some());
        assert!(tree.children(root).is_empty());
        assert_eq!(tree.parent(first), None);
        assert_eq!(tree.parent(second), None);
        assert!(tree.is_dirty(first));
        assert_relative_eq!(tree.world_position(first).unwrap(), Vec3::new(1.0, 0.0, 0.0), epsilon = EPSILON);
        assert!(tree.remove(parent).is_none());
    }
}
