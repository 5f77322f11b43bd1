//! Video input.

pub mod webcam;

use image::DynamicImage;

use crate::timer::Timer;

/// A source of camera frames.
///
/// Frame sources are opened and used on the thread that reads from them, so they don't need to be
/// [`Send`].
pub trait FrameSource {
    /// Reads the next frame, blocking until one is available.
    ///
    /// Errors are considered transient: callers may retry after a failed read.
    fn read(&mut self) -> anyhow::Result<DynamicImage>;

    /// Returns profiling timers to include in throughput logs.
    fn timers(&self) -> Vec<&Timer> {
        Vec::new()
    }
}

impl<F: FrameSource + ?Sized> FrameSource for Box<F> {
    fn read(&mut self) -> anyhow::Result<DynamicImage> {
        (**self).read()
    }

    fn timers(&self) -> Vec<&Timer> {
        (**self).timers()
    }
}
