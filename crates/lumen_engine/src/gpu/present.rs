//! Swapchain acquire/present policy
//!
//! Window and swapchain objects belong to the presentation collaborator,
//! reached through [`Presenter`]. [`FramePresenter`] wraps it with the
//! recovery rules the frame loop relies on:
//!
//! - a window with zero area is never rendered to; the frame is skipped;
//! - an out-of-date, suboptimal or lost surface triggers a full rebuild:
//!   the device is drained with `wait_idle` before the presenter destroys
//!   per-image resources, then acquisition is retried once;
//! - a rebuild that fails skips the frame, and the next acquire tries again.

use ash::vk;
use thiserror::Error;

use super::device::{GpuError, GraphicsDevice};

/// Presentation errors
#[derive(Error, Debug)]
pub enum PresentError {
    /// The swapchain no longer matches the surface
    #[error("Swapchain out of date")]
    OutOfDate,
    /// The swapchain still works but should be rebuilt
    #[error("Swapchain suboptimal")]
    Suboptimal,
    /// The surface was lost
    #[error("Surface lost")]
    SurfaceLost,
    /// Device failure while presenting
    #[error("Device error: {0}")]
    Device(#[from] GpuError),
}

impl PresentError {
    /// Whether rebuilding the swapchain can recover from this error
    pub fn needs_rebuild(&self) -> bool {
        matches!(self, Self::OutOfDate | Self::Suboptimal | Self::SurfaceLost)
    }
}

/// Services consumed from the window/presentation collaborator
pub trait Presenter {
    /// Current drawable size of the window
    fn extent(&self) -> vk::Extent2D;

    /// Acquire the next backbuffer, returning its index
    fn acquire_next_image(&mut self) -> Result<u32, PresentError>;

    /// Present the acquired backbuffer
    fn present(&mut self, image_index: u32) -> Result<(), PresentError>;

    /// Destroy and recreate the swapchain for the current extent
    fn rebuild_swapchain(&mut self) -> Result<(), PresentError>;
}

/// Outcome of [`FramePresenter::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Render into this backbuffer
    Ready(u32),
    /// Skip rendering this frame
    Skip,
}

/// Applies rebuild and skip rules around a [`Presenter`]
#[derive(Debug, Default)]
pub struct FramePresenter {
    rebuild_pending: bool,
    rebuilds: u64,
    skipped: u64,
}

impl FramePresenter {
    /// Create the policy wrapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the swapchain stale, e.g. on a resize notification
    pub fn notify_resized(&mut self) {
        self.rebuild_pending = true;
    }

    /// Number of swapchain rebuilds performed
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Number of frames skipped
    pub fn skipped_count(&self) -> u64 {
        self.skipped
    }

    /// Acquire a backbuffer, rebuilding the swapchain if needed.
    ///
    /// Only device failures are returned as errors.
    pub fn acquire(
        &mut self,
        presenter: &mut dyn Presenter,
        device: &mut dyn GraphicsDevice,
    ) -> Result<AcquireOutcome, PresentError> {
        let extent = presenter.extent();
        if extent.width == 0 || extent.height == 0 {
            log::trace!("Window has zero area, skipping frame");
            return Ok(self.skip());
        }

        if self.rebuild_pending && !self.rebuild(presenter, device)? {
            return Ok(self.skip());
        }

        match presenter.acquire_next_image() {
            Ok(index) => Ok(AcquireOutcome::Ready(index)),
            Err(error) if error.needs_rebuild() => {
                log::debug!("Acquire failed ({error}), rebuilding swapchain");
                if !self.rebuild(presenter, device)? {
                    return Ok(self.skip());
                }
                match presenter.acquire_next_image() {
                    Ok(index) => Ok(AcquireOutcome::Ready(index)),
                    Err(error) if error.needs_rebuild() => {
                        self.rebuild_pending = true;
                        Ok(self.skip())
                    }
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Present a backbuffer; a stale swapchain is rebuilt on the next acquire
    pub fn present(&mut self, presenter: &mut dyn Presenter, image_index: u32) -> Result<(), PresentError> {
        match presenter.present(image_index) {
            Ok(()) => Ok(()),
            Err(error) if error.needs_rebuild() => {
                log::debug!("Present reported {error}, scheduling swapchain rebuild");
                self.rebuild_pending = true;
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn rebuild(&mut self, presenter: &mut dyn Presenter, device: &mut dyn GraphicsDevice) -> Result<bool, PresentError> {
        // Nothing in flight may still reference the old swapchain images
        device.wait_idle()?;
        match presenter.rebuild_swapchain() {
            Ok(()) => {
                self.rebuild_pending = false;
                self.rebuilds += 1;
                log::info!("Swapchain rebuilt ({} total)", self.rebuilds);
                Ok(true)
            }
            Err(PresentError::Device(error)) => Err(PresentError::Device(error)),
            Err(error) => {
                log::warn!("Swapchain rebuild failed: {error}");
                self.rebuild_pending = true;
                Ok(false)
            }
        }
    }

    fn skip(&mut self) -> AcquireOutcome {
        self.skipped += 1;
        AcquireOutcome::Skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::recording::RecordingDevice;
    use std::collections::VecDeque;

    struct ScriptedPresenter {
        extent: vk::Extent2D,
        acquire_results: VecDeque<Result<u32, PresentError>>,
        rebuild_fails: bool,
        rebuilds: u32,
    }

    impl ScriptedPresenter {
        fn new(width: u32, height: u32) -> Self {
            Self {
                extent: vk::Extent2D { width, height },
                acquire_results: VecDeque::new(),
                rebuild_fails: false,
                rebuilds: 0,
            }
        }
    }

    impl Presenter for ScriptedPresenter {
        fn extent(&self) -> vk::Extent2D {
            self.extent
        }

        fn acquire_next_image(&mut self) -> Result<u32, PresentError> {
            self.acquire_results.pop_front().unwrap_or(Ok(0))
        }

        fn present(&mut self, _image_index: u32) -> Result<(), PresentError> {
            Err(PresentError::Suboptimal)
        }

        fn rebuild_swapchain(&mut self) -> Result<(), PresentError> {
            if self.rebuild_fails {
                return Err(PresentError::SurfaceLost);
            }
            self.rebuilds += 1;
            Ok(())
        }
    }

    #[test]
    fn test_zero_area_skips_without_acquire() {
        let mut presenter = ScriptedPresenter::new(0, 600);
        presenter.acquire_results.push_back(Ok(3));
        let mut device = RecordingDevice::new(2);
        let mut frames = FramePresenter::new();

        let outcome = frames.acquire(&mut presenter, &mut device).unwrap();
        assert_eq!(outcome, AcquireOutcome::Skip);
        assert_eq!(presenter.acquire_results.len(), 1);
        assert_eq!(frames.skipped_count(), 1);
    }

    #[test]
    fn test_out_of_date_waits_idle_then_rebuilds() {
        let mut presenter = ScriptedPresenter::new(800, 600);
        presenter.acquire_results.push_back(Err(PresentError::OutOfDate));
        presenter.acquire_results.push_back(Ok(1));
        let mut device = RecordingDevice::new(2);
        let mut frames = FramePresenter::new();

        let outcome = frames.acquire(&mut presenter, &mut device).unwrap();
        assert_eq!(outcome, AcquireOutcome::Ready(1));
        assert_eq!(device.wait_idle_calls(), 1);
        assert_eq!(presenter.rebuilds, 1);
        assert_eq!(frames.rebuild_count(), 1);
    }

    #[test]
    fn test_failed_rebuild_skips_and_retries_later() {
        let mut presenter = ScriptedPresenter::new(800, 600);
        presenter.acquire_results.push_back(Err(PresentError::SurfaceLost));
        presenter.rebuild_fails = true;
        let mut device = RecordingDevice::new(2);
        let mut frames = FramePresenter::new();

        assert_eq!(frames.acquire(&mut presenter, &mut device).unwrap(), AcquireOutcome::Skip);

        presenter.rebuild_fails = false;
        assert_eq!(frames.acquire(&mut presenter, &mut device).unwrap(), AcquireOutcome::Ready(0));
        assert_eq!(presenter.rebuilds, 1);
        assert_eq!(device.wait_idle_calls(), 2);
    }

    #[test]
    fn test_suboptimal_present_schedules_rebuild() {
        let mut presenter = ScriptedPresenter::new(800, 600);
        let mut device = RecordingDevice::new(2);
        let mut frames = FramePresenter::new();

        frames.present(&mut presenter, 0).unwrap();
        assert_eq!(presenter.rebuilds, 0);
        frames.acquire(&mut presenter, &mut device).unwrap();
        assert_eq!(presenter.rebuilds, 1);
    }

    #[test]
    fn test_resize_notification_rebuilds() {
        let mut presenter = ScriptedPresenter::new(800, 600);
        let mut device = RecordingDevice::new(2);
        let mut frames = FramePresenter::new();

        frames.notify_resized();
        frames.acquire(&mut presenter, &mut device).unwrap();
        assert_eq!(presenter.rebuilds, 1);
        frames.acquire(&mut presenter, &mut device).unwrap();
        assert_eq!(presenter.rebuilds, 1);
    }
}
