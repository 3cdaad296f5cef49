//! Texture and sampler handles supplied by the asset collaborator

use ash::vk;

/// A sampled image view
#[derive(Debug, Clone)]
pub struct Texture {
    /// Debug name
    pub name: String,
    /// Image view bound into descriptor sets
    pub view: vk::ImageView,
    /// Layout the image is in when sampled
    pub layout: vk::ImageLayout,
}

impl Texture {
    /// A texture read in `SHADER_READ_ONLY_OPTIMAL`
    pub fn new(name: impl Into<String>, view: vk::ImageView) -> Self {
        Self {
            name: name.into(),
            view,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

/// A sampler object
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Debug name
    pub name: String,
    /// Sampler handle
    pub handle: vk::Sampler,
}

impl Sampler {
    /// Wrap a sampler handle
    pub fn new(name: impl Into<String>, handle: vk::Sampler) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }
}
