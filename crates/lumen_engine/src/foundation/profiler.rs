//! Hierarchical frame profiler
//!
//! The profiler is an explicit context object threaded through the frame's
//! call chain. Samples are opened with [`Profiler::scope`], which returns a
//! guard that closes the sample when dropped; nested samples are opened
//! through the guard itself, so begin/end pairing cannot go wrong.
//!
//! ```
//! use lumen_engine::foundation::profiler::Profiler;
//!
//! let mut profiler = Profiler::new(true);
//! profiler.begin_frame();
//! {
//!     let mut draw = profiler.scope("Draw");
//!     let _shadows = draw.scope("Shadows");
//! }
//! profiler.end_frame().unwrap();
//! assert!(profiler.last_frame().unwrap().find("Shadows").is_some());
//! ```

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// Number of completed frames kept for inspection
pub const PROFILER_FRAME_COUNT: usize = 8;

/// Profiler errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProfilerError {
    /// `end_frame` was called without a matching `begin_frame`
    #[error("No profiler frame is active")]
    NoActiveFrame,
}

/// Result type for profiler operations
pub type ProfilerResult<T> = Result<T, ProfilerError>;

/// One timed node of a frame's sample tree
#[derive(Debug, Clone)]
pub struct ProfilerSample {
    /// Sample label
    pub label: String,
    /// Accumulated time spent inside the sample
    pub duration: Duration,
    /// Indices of child samples within the frame
    pub children: Vec<usize>,
    parent: Option<usize>,
    start: Instant,
}

/// A completed (or in-progress) frame of samples; index 0 is the root
#[derive(Debug, Clone)]
pub struct ProfilerFrame {
    samples: Vec<ProfilerSample>,
}

impl ProfilerFrame {
    fn new(start: Instant) -> Self {
        Self {
            samples: vec![ProfilerSample {
                label: "Frame".to_string(),
                duration: Duration::ZERO,
                children: Vec::new(),
                parent: None,
                start,
            }],
        }
    }

    /// Root sample covering the whole frame
    pub fn root(&self) -> &ProfilerSample {
        &self.samples[0]
    }

    /// Sample by index
    pub fn sample(&self, index: usize) -> Option<&ProfilerSample> {
        self.samples.get(index)
    }

    /// Total frame duration
    pub fn duration(&self) -> Duration {
        self.root().duration
    }

    /// First sample with the given label, depth-first
    pub fn find(&self, label: &str) -> Option<&ProfilerSample> {
        self.samples.iter().find(|sample| sample.label == label)
    }

    /// Number of samples in the frame, including the root
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds only its root
    pub fn is_empty(&self) -> bool {
        self.samples.len() <= 1
    }

    fn write_sample(&self, index: usize, depth: usize, out: &mut String) {
        let sample = &self.samples[index];
        let _ = writeln!(
            out,
            "{}{}: {:.2}ms",
            "  ".repeat(depth),
            sample.label,
            sample.duration.as_secs_f64() * 1000.0
        );
        for &child in &sample.children {
            self.write_sample(child, depth + 1, out);
        }
    }
}

/// Hierarchical timing context
#[derive(Debug)]
pub struct Profiler {
    enabled: bool,
    frames: VecDeque<ProfilerFrame>,
    current: Option<ProfilerFrame>,
    stack: Vec<usize>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Profiler {
    /// Create a profiler; a disabled profiler records nothing
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            frames: VecDeque::with_capacity(PROFILER_FRAME_COUNT),
            current: None,
            stack: Vec::new(),
        }
    }

    /// Whether samples are being recorded
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable recording; takes effect at the next frame
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Start a new frame. An unfinished previous frame is closed first.
    pub fn begin_frame(&mut self) {
        if self.current.is_some() {
            log::warn!("Profiler frame started while the previous frame was still open");
            let _ = self.end_frame();
        }
        if !self.enabled {
            return;
        }
        self.current = Some(ProfilerFrame::new(Instant::now()));
        self.stack.clear();
        self.stack.push(0);
    }

    /// Close the current frame and store it in the history ring
    pub fn end_frame(&mut self) -> ProfilerResult<()> {
        if !self.enabled && self.current.is_none() {
            return Ok(());
        }
        let mut frame = self.current.take().ok_or(ProfilerError::NoActiveFrame)?;
        let now = Instant::now();
        // Samples still open are closed at the frame boundary
        for &index in self.stack.iter().rev() {
            let sample = &mut frame.samples[index];
            sample.duration += now.duration_since(sample.start);
        }
        self.stack.clear();

        if self.frames.len() == PROFILER_FRAME_COUNT {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Open a new child sample under the innermost open sample
    pub fn scope(&mut self, label: impl Into<String>) -> ProfileScope<'_> {
        let active = self.begin_sample(label.into(), false);
        ProfileScope { profiler: self, active }
    }

    /// Re-open an existing sibling sample with this label, accumulating
    /// its time, or open a new one if there is none
    pub fn resume_scope(&mut self, label: impl Into<String>) -> ProfileScope<'_> {
        let active = self.begin_sample(label.into(), true);
        ProfileScope { profiler: self, active }
    }

    /// Most recently completed frame
    pub fn last_frame(&self) -> Option<&ProfilerFrame> {
        self.frames.back()
    }

    /// Completed frames, oldest first
    pub fn frames(&self) -> impl Iterator<Item = &ProfilerFrame> {
        self.frames.iter()
    }

    /// Indented text dump of the last completed frame
    pub fn format_last_frame(&self) -> String {
        let mut out = String::new();
        if let Some(frame) = self.last_frame() {
            frame.write_sample(0, 0, &mut out);
        }
        out
    }

    fn begin_sample(&mut self, label: String, resume: bool) -> bool {
        let Some(frame) = self.current.as_mut() else {
            return false;
        };
        let Some(&parent) = self.stack.last() else {
            return false;
        };
        let now = Instant::now();

        if resume {
            let existing = frame.samples[parent]
                .children
                .iter()
                .copied()
                .find(|&child| frame.samples[child].label == label);
            if let Some(index) = existing {
                frame.samples[index].start = now;
                self.stack.push(index);
                return true;
            }
        }

        let index = frame.samples.len();
        frame.samples.push(ProfilerSample {
            label,
            duration: Duration::ZERO,
            children: Vec::new(),
            parent: Some(parent),
            start: now,
        });
        frame.samples[parent].children.push(index);
        self.stack.push(index);
        true
    }

    fn end_sample(&mut self) {
        let Some(frame) = self.current.as_mut() else {
            return;
        };
        // The root stays on the stack until end_frame
        if self.stack.len() <= 1 {
            return;
        }
        if let Some(index) = self.stack.pop() {
            let sample = &mut frame.samples[index];
            sample.duration += sample.start.elapsed();
            debug_assert_eq!(sample.parent, self.stack.last().copied());
        }
    }
}

/// Guard for an open profiler sample; the sample ends when this is dropped.
///
/// Dereferences to the [`Profiler`] so nested scopes and other calls taking
/// `&mut Profiler` can be made through it.
#[must_use = "the sample ends as soon as the scope guard is dropped"]
pub struct ProfileScope<'a> {
    profiler: &'a mut Profiler,
    active: bool,
}

impl Deref for ProfileScope<'_> {
    type Target = Profiler;

    fn deref(&self) -> &Profiler {
        self.profiler
    }
}

impl DerefMut for ProfileScope<'_> {
    fn deref_mut(&mut self) -> &mut Profiler {
        self.profiler
    }
}

impl Drop for ProfileScope<'_> {
    fn drop(&mut self) {
        if self.active {
            self.profiler.end_sample();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_scopes_build_tree() {
        let mut profiler = Profiler::new(true);
        profiler.begin_frame();
        {
            let mut render = profiler.scope("Render");
            {
                let _sort = render.scope("Sort");
            }
            let _draw = render.scope("Draw");
        }
        profiler.end_frame().unwrap();

        let frame = profiler.last_frame().unwrap();
        assert_eq!(frame.len(), 4);
        let root = frame.root();
        assert_eq!(root.children.len(), 1);
        let render = frame.sample(root.children[0]).unwrap();
        assert_eq!(render.label, "Render");
        let labels: Vec<_> = render
            .children
            .iter()
            .map(|&i| frame.sample(i).unwrap().label.as_str())
            .collect();
        assert_eq!(labels, vec!["Sort", "Draw"]);
    }

    #[test]
    fn test_resume_reuses_sample() {
        let mut profiler = Profiler::new(true);
        profiler.begin_frame();
        for _ in 0..3 {
            let _scope = profiler.resume_scope("Draw mesh");
        }
        profiler.end_frame().unwrap();

        let frame = profiler.last_frame().unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.root().children.len(), 1);
    }

    #[test]
    fn test_ring_keeps_last_frames() {
        let mut profiler = Profiler::new(true);
        for _ in 0..PROFILER_FRAME_COUNT + 3 {
            profiler.begin_frame();
            profiler.end_frame().unwrap();
        }
        assert_eq!(profiler.frames().count(), PROFILER_FRAME_COUNT);
    }

    #[test]
    fn test_end_without_begin_fails() {
        let mut profiler = Profiler::new(true);
        assert_eq!(profiler.end_frame(), Err(ProfilerError::NoActiveFrame));
    }

    #[test]
    fn test_disabled_records_nothing() {
        let mut profiler = Profiler::new(false);
        profiler.begin_frame();
        {
            let _scope = profiler.scope("Draw");
        }
        profiler.end_frame().unwrap();
        assert!(profiler.last_frame().is_none());
    }

    #[test]
    fn test_format_indents_by_depth() {
        let mut profiler = Profiler::new(true);
        profiler.begin_frame();
        {
            let mut outer = profiler.scope("Outer");
            let _inner = outer.scope("Inner");
        }
        profiler.end_frame().unwrap();

        let text = profiler.format_last_frame();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Frame: "));
        assert!(lines[1].starts_with("  Outer: "));
        assert!(lines[2].starts_with("    Inner: "));
        assert!(lines[2].ends_with("ms"));
    }
}
