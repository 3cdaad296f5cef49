//! Render queue sorting and instanced batch planning
//!
//! Batching merges *adjacent* items with the same mesh and material, so it is
//! only correct on a queue sorted by render queue, then mesh, then material.
//! [`plan_batches`] therefore takes a [`SortedQueue`], which can only be
//! produced by [`RenderQueue::into_sorted`].

use super::renderer::BatchKey;
use super::transform::ObjectId;

/// One visible renderer waiting to be drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueItem {
    /// Object owning the renderer
    pub object: ObjectId,
    /// Render queue priority
    pub queue: u32,
    /// Mesh and material identity, if any
    pub batch_key: Option<BatchKey>,
    /// Whether the renderer can be drawn instanced in this pass
    pub instanced: bool,
}

/// Unsorted draw list for one pass
#[derive(Debug, Clone, Default)]
pub struct RenderQueue {
    items: Vec<QueueItem>,
}

impl RenderQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item
    pub fn push(&mut self, item: QueueItem) {
        self.items.push(item);
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sort by render queue, then mesh, then material.
    ///
    /// The sort is stable: items with equal keys keep insertion order.
    pub fn into_sorted(mut self) -> SortedQueue {
        self.items.sort_by_key(|item| (item.queue, item.batch_key));
        SortedQueue { items: self.items }
    }
}

/// A render queue in draw order
#[derive(Debug, Clone, Default)]
pub struct SortedQueue {
    items: Vec<QueueItem>,
}

impl SortedQueue {
    /// Items in draw order
    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A run of queue items drawn with one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawBatch {
    /// Index of the first item
    pub start: usize,
    /// Number of items
    pub count: usize,
    /// Whether the run is drawn with one instanced call
    pub instanced: bool,
}

/// Split a sorted queue into draw calls.
///
/// Consecutive instancing-capable items with the same mesh and material share
/// one call of up to `max_batch` instances; everything else draws alone.
pub fn plan_batches(queue: &SortedQueue, max_batch: usize) -> Vec<DrawBatch> {
    let max_batch = max_batch.max(1);
    let items = queue.items();
    let mut batches = Vec::new();
    let mut start = 0;
    while start < items.len() {
        let first = &items[start];
        let count = match first.batch_key {
            Some(key) if first.instanced => items[start..]
                .iter()
                .take(max_batch)
                .take_while(|item| item.instanced && item.batch_key == Some(key))
                .count(),
            _ => 1,
        };
        batches.push(DrawBatch {
            start,
            count,
            instanced: first.instanced && first.batch_key.is_some(),
        });
        start += count;
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{MaterialId, MeshId};
    use slotmap::SlotMap;

    fn ids(count: usize) -> Vec<ObjectId> {
        let mut map: SlotMap<ObjectId, ()> = SlotMap::with_key();
        (0..count).map(|_| map.insert(())).collect()
    }

    fn item(object: ObjectId, queue: u32, mesh: u64, material: u64, instanced: bool) -> QueueItem {
        QueueItem {
            object,
            queue,
            batch_key: Some(BatchKey {
                mesh: MeshId(mesh),
                material: MaterialId(material),
            }),
            instanced,
        }
    }

    #[test]
    fn test_sort_orders_queue_mesh_material() {
        let objects = ids(5);
        let mut queue = RenderQueue::new();
        queue.push(item(objects[0], 3000, 1, 1, false));
        queue.push(item(objects[1], 1000, 2, 1, false));
        queue.push(item(objects[2], 1000, 1, 2, false));
        queue.push(item(objects[3], 1000, 1, 1, false));
        queue.push(item(objects[4], 2000, 0, 0, false));

        let sorted = queue.into_sorted();
        let order: Vec<_> = sorted.items().iter().map(|item| item.object).collect();
        assert_eq!(order, vec![objects[3], objects[2], objects[1], objects[4], objects[0]]);
    }

    #[test]
    fn test_sort_is_stable_for_equal_keys() {
        let objects = ids(6);
        let build = || {
            let mut queue = RenderQueue::new();
            for (i, object) in objects.iter().enumerate() {
                queue.push(item(*object, 1000, 7, (i % 2) as u64, true));
            }
            queue.into_sorted()
        };
        let first: Vec<_> = build().items().iter().map(|item| item.object).collect();
        let second: Vec<_> = build().items().iter().map(|item| item.object).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![objects[0], objects[2], objects[4], objects[1], objects[3], objects[5]]);
    }

    #[test]
    fn test_batches_are_ceil_n_over_max() {
        for (n, max) in [(1, 4), (4, 4), (5, 4), (9, 4), (1000, 1024), (2049, 1024), (7, 1)] {
            let mut queue = RenderQueue::new();
            for object in ids(n) {
                queue.push(item(object, 1000, 1, 1, true));
            }
            let batches = plan_batches(&queue.into_sorted(), max);
            assert_eq!(batches.len(), n.div_ceil(max), "n = {n}, max = {max}");
            assert_eq!(batches.iter().map(|batch| batch.count).sum::<usize>(), n);
            assert!(batches.iter().all(|batch| batch.instanced && batch.count <= max));
        }
    }

    #[test]
    fn test_batches_break_on_identity_and_capability() {
        let objects = ids(6);
        let mut queue = RenderQueue::new();
        queue.push(item(objects[0], 1000, 1, 1, true));
        queue.push(item(objects[1], 1000, 1, 1, true));
        queue.push(item(objects[2], 1000, 1, 1, false));
        queue.push(item(objects[3], 1000, 1, 2, true));
        queue.push(item(objects[4], 1000, 1, 2, true));
        queue.push(QueueItem {
            object: objects[5],
            queue: 1000,
            batch_key: None,
            instanced: true,
        });

        let sorted = queue.into_sorted();
        let batches = plan_batches(&sorted, 16);
        let shape: Vec<_> = batches.iter().map(|batch| (batch.count, batch.instanced)).collect();
        // The keyless item sorts first, the non-instanced one breaks the first run
        assert_eq!(shape, vec![(1, false), (2, true), (1, false), (2, true)]);
    }
}
