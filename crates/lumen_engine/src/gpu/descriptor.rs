//! Descriptor write batching and per-frame temporary resources
//!
//! [`DescriptorBinder`] accumulates descriptor writes and commits them with a
//! single `update_descriptor_sets` call. The buffer- and image-info records
//! each write points at are boxed so their addresses stay fixed while more
//! writes are queued; after a flush the boxes go back to a free list and are
//! reused by later writes instead of being reallocated every frame.
//!
//! Temporary buffers and descriptor sets come straight from the device's
//! per-frame pools. The binder never frees them: the device recycles them
//! when their frame slot comes around again.

use ash::vk;
use bytemuck::Pod;

use super::device::{BufferRange, GpuResult, GraphicsDevice};

enum PendingInfo {
    Buffer(Box<vk::DescriptorBufferInfo>),
    Image(Box<vk::DescriptorImageInfo>),
}

struct PendingWrite {
    set: vk::DescriptorSet,
    binding: u32,
    array_element: u32,
    descriptor_type: vk::DescriptorType,
    info: PendingInfo,
}

/// Counters for the binder's info-record pools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinderStats {
    /// Records allocated because the pool was empty
    pub allocated: usize,
    /// Records taken from the pool
    pub reused: usize,
    /// Flushes that submitted at least one write
    pub flushes: usize,
}

/// Batches descriptor writes for one device
#[derive(Default)]
pub struct DescriptorBinder {
    pending: Vec<PendingWrite>,
    buffer_pool: Vec<Box<vk::DescriptorBufferInfo>>,
    image_pool: Vec<Box<vk::DescriptorImageInfo>>,
    stats: BinderStats,
}

impl std::fmt::Debug for DescriptorBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorBinder")
            .field("pending", &self.pending.len())
            .field("pooled_buffer_infos", &self.buffer_pool.len())
            .field("pooled_image_infos", &self.image_pool.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl DescriptorBinder {
    /// Create an empty binder
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes waiting for the next flush
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Info records currently sitting in the free lists
    pub fn pooled_count(&self) -> usize {
        self.buffer_pool.len() + self.image_pool.len()
    }

    /// Pool counters
    pub fn stats(&self) -> BinderStats {
        self.stats
    }

    /// Queue a uniform buffer write
    pub fn write_uniform_buffer(&mut self, set: vk::DescriptorSet, binding: u32, range: &BufferRange) {
        self.push_buffer(set, binding, vk::DescriptorType::UNIFORM_BUFFER, range);
    }

    /// Queue a storage buffer write
    pub fn write_storage_buffer(&mut self, set: vk::DescriptorSet, binding: u32, range: &BufferRange) {
        self.push_buffer(set, binding, vk::DescriptorType::STORAGE_BUFFER, range);
    }

    /// Queue a sampled image write into element `array_index` of the binding
    pub fn write_sampled_texture(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        array_index: u32,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) {
        self.push_image(
            set,
            binding,
            array_index,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout: layout,
            },
        );
    }

    /// Queue a storage image write
    pub fn write_storage_texture(&mut self, set: vk::DescriptorSet, binding: u32, array_index: u32, view: vk::ImageView) {
        self.push_image(
            set,
            binding,
            array_index,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout: vk::ImageLayout::GENERAL,
            },
        );
    }

    /// Queue a sampler write
    pub fn write_sampler(&mut self, set: vk::DescriptorSet, binding: u32, sampler: vk::Sampler) {
        self.push_image(
            set,
            binding,
            0,
            vk::DescriptorType::SAMPLER,
            vk::DescriptorImageInfo {
                sampler,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            },
        );
    }

    /// Commit every pending write in one device call.
    ///
    /// Returns the number of writes submitted.
    pub fn flush(&mut self, device: &mut dyn GraphicsDevice) -> usize {
        if self.pending.is_empty() {
            return 0;
        }

        let writes: Vec<vk::WriteDescriptorSet> = self
            .pending
            .iter()
            .map(|write| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.descriptor_type);
                match &write.info {
                    PendingInfo::Buffer(info) => builder.buffer_info(std::slice::from_ref(info.as_ref())).build(),
                    PendingInfo::Image(info) => builder.image_info(std::slice::from_ref(info.as_ref())).build(),
                }
            })
            .collect();
        device.update_descriptor_sets(&writes);
        let count = writes.len();
        drop(writes);

        for write in self.pending.drain(..) {
            match write.info {
                PendingInfo::Buffer(info) => self.buffer_pool.push(info),
                PendingInfo::Image(info) => self.image_pool.push(info),
            }
        }
        self.stats.flushes += 1;
        log::trace!("Flushed {count} descriptor writes");
        count
    }

    /// Drop pending writes without submitting them, recycling their records
    pub fn discard(&mut self) {
        for write in self.pending.drain(..) {
            match write.info {
                PendingInfo::Buffer(info) => self.buffer_pool.push(info),
                PendingInfo::Image(info) => self.image_pool.push(info),
            }
        }
    }

    fn push_buffer(&mut self, set: vk::DescriptorSet, binding: u32, descriptor_type: vk::DescriptorType, range: &BufferRange) {
        let mut info = match self.buffer_pool.pop() {
            Some(info) => {
                self.stats.reused += 1;
                info
            }
            None => {
                self.stats.allocated += 1;
                Box::default()
            }
        };
        *info = vk::DescriptorBufferInfo {
            buffer: range.buffer,
            offset: range.offset,
            range: range.size,
        };
        self.pending.push(PendingWrite {
            set,
            binding,
            array_element: 0,
            descriptor_type,
            info: PendingInfo::Buffer(info),
        });
    }

    fn push_image(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        array_element: u32,
        descriptor_type: vk::DescriptorType,
        value: vk::DescriptorImageInfo,
    ) {
        let mut info = match self.image_pool.pop() {
            Some(info) => {
                self.stats.reused += 1;
                info
            }
            None => {
                self.stats.allocated += 1;
                Box::default()
            }
        };
        *info = value;
        self.pending.push(PendingWrite {
            set,
            binding,
            array_element,
            descriptor_type,
            info: PendingInfo::Image(info),
        });
    }
}

/// Copy `data` into a fresh temporary buffer for the current frame slot
pub fn upload_temp<T: Pod>(
    device: &mut dyn GraphicsDevice,
    name: &str,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> GpuResult<BufferRange> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let range = device.temp_buffer(name, bytes.len().max(1) as vk::DeviceSize, usage)?;
    device.write_buffer(&range, 0, bytes)?;
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::recording::RecordingDevice;
    use ash::vk::Handle;

    fn buffer(raw: u64) -> BufferRange {
        BufferRange {
            buffer: vk::Buffer::from_raw(raw),
            offset: 0,
            size: 256,
        }
    }

    #[test]
    fn test_flush_submits_once() {
        let mut device = RecordingDevice::new(2);
        let mut binder = DescriptorBinder::new();
        let set = vk::DescriptorSet::from_raw(7);

        binder.write_storage_buffer(set, 0, &buffer(1));
        binder.write_uniform_buffer(set, 1, &buffer(2));
        binder.write_sampled_texture(set, 2, 3, vk::ImageView::from_raw(3), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        binder.write_sampler(set, 3, vk::Sampler::from_raw(4));
        assert_eq!(binder.pending_count(), 4);

        assert_eq!(binder.flush(&mut device), 4);
        assert_eq!(device.descriptor_update_calls(), 1);
        let writes = device.descriptor_writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(writes[2].array_element, 3);
        assert_eq!(writes[3].descriptor_type, vk::DescriptorType::SAMPLER);
        assert_eq!(binder.pending_count(), 0);
        assert_eq!(binder.pooled_count(), 4);
    }

    #[test]
    fn test_records_are_reused() {
        let mut device = RecordingDevice::new(2);
        let mut binder = DescriptorBinder::new();
        let set = vk::DescriptorSet::from_raw(1);

        for _ in 0..3 {
            binder.write_storage_buffer(set, 0, &buffer(9));
            binder.write_sampler(set, 1, vk::Sampler::from_raw(5));
            binder.flush(&mut device);
        }

        let stats = binder.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.reused, 4);
        assert_eq!(stats.flushes, 3);
    }

    #[test]
    fn test_empty_flush_is_free() {
        let mut device = RecordingDevice::new(2);
        let mut binder = DescriptorBinder::new();
        assert_eq!(binder.flush(&mut device), 0);
        assert_eq!(device.descriptor_update_calls(), 0);
    }

    #[test]
    fn test_upload_temp_writes_bytes() {
        let mut device = RecordingDevice::new(2);
        let range = upload_temp(&mut device, "test", vk::BufferUsageFlags::STORAGE_BUFFER, &[1.0_f32, 2.0, 3.0]).unwrap();
        assert_eq!(range.size, 12);
        assert_eq!(device.buffer_contents(range.buffer).map(<[u8]>::len), Some(12));
    }
}
