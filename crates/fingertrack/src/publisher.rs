//! The capture, detect and publish loop.
//!
//! The [`Publisher`] reads a frame, runs it through the shared detector with a synthetic
//! timestamp, and publishes the first hand's index fingertip and gesture to a [`TrackingState`].
//! Frames without a hand leave the published state untouched.

use std::{
    panic::resume_unwind,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::bail;
use image::imageops;

use crate::{
    detector::SharedDetector,
    hand::gesture::classify,
    timer::{RateLog, Timer},
    tracking::{FingerState, TrackingState},
    video::FrameSource,
};

/// Publisher loop configuration.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    frame_interval: Duration,
    retry_delay: Duration,
    mirror: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(33),
            retry_delay: Duration::from_millis(100),
            mirror: true,
        }
    }
}

impl PublisherOptions {
    /// Sets the time to sleep after each cycle.
    ///
    /// This also determines how far the detector timestamp advances per frame, so that the
    /// timestamps emulate a camera running at that rate.
    pub fn frame_interval(self, frame_interval: Duration) -> Self {
        Self {
            frame_interval,
            ..self
        }
    }

    /// Sets the time to wait before retrying after a failed camera read.
    pub fn retry_delay(self, retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            ..self
        }
    }

    /// Sets whether frames are flipped horizontally before detection.
    ///
    /// Mirroring is enabled by default, so that moving a hand to the right moves the published
    /// position to the right for a user facing the camera.
    pub fn mirror(self, mirror: bool) -> Self {
        Self { mirror, ..self }
    }

    /// The timestamp increment per processed frame, in milliseconds. Always at least 1.
    pub fn timestamp_step_ms(&self) -> u64 {
        u64::try_from(self.frame_interval.as_millis())
            .unwrap_or(u64::MAX)
            .max(1)
    }
}

/// The outcome of a single [`Publisher::cycle`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cycle {
    /// A hand was found and its state was published.
    Published(FingerState),
    /// The detector found no hand. The published state is unchanged.
    NoHand,
    /// No frame could be read. The timestamp was not advanced.
    ReadFailed,
    /// The detector returned an error. The published state is unchanged.
    DetectFailed,
}

/// Turns camera frames into [`TrackingState`] updates.
pub struct Publisher<F: FrameSource> {
    camera: F,
    detector: SharedDetector,
    state: Arc<TrackingState>,
    options: PublisherOptions,
    timestamp_ms: u64,
    rate: RateLog,
    t_read: Timer,
    t_detect: Timer,
}

impl<F: FrameSource> Publisher<F> {
    pub fn new(
        camera: F,
        detector: SharedDetector,
        state: Arc<TrackingState>,
        options: PublisherOptions,
    ) -> Self {
        Self {
            camera,
            detector,
            state,
            options,
            timestamp_ms: 0,
            rate: RateLog::new("publisher"),
            t_read: Timer::new("read"),
            t_detect: Timer::new("detect"),
        }
    }

    /// Returns the timestamp passed to the detector for the most recent frame, or 0 if no frame
    /// has been processed yet.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Runs one capture, detect and publish cycle.
    ///
    /// Camera and detector failures are logged and reported in the returned [`Cycle`], they never
    /// stop the publisher.
    pub fn cycle(&mut self) -> Cycle {
        let frame = match self.t_read.time(|| self.camera.read()) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("failed to read camera frame: {e:#}");
                return Cycle::ReadFailed;
            }
        };

        let mut image = frame.into_rgb8();
        if self.options.mirror {
            imageops::flip_horizontal_in_place(&mut image);
        }

        // The counter is the only timestamp source, so timestamps keep increasing even if the
        // detector rejects a frame.
        self.timestamp_ms += self.options.timestamp_step_ms();
        let timestamp_ms = self.timestamp_ms;
        let result = self
            .t_detect
            .time(|| self.detector.detect_for_video(&image, timestamp_ms));
        let mut timers = vec![&self.t_read, &self.t_detect];
        timers.extend(self.camera.timers());
        self.rate.frame(&timers);

        let hands = match result {
            Ok(hands) => hands,
            Err(e) => {
                log::warn!("hand detection failed at {timestamp_ms}ms: {e}");
                return Cycle::DetectFailed;
            }
        };

        let Some((hand, tip)) = hands
            .first()
            .and_then(|hand| Some((hand, hand.index_finger_tip()?)))
        else {
            return Cycle::NoHand;
        };

        let state = FingerState {
            x: tip.x(),
            y: tip.y(),
            gesture: classify(hand.landmarks()),
        };
        self.state.publish(state);
        log::trace!(
            "{timestamp_ms}ms: published {state:?} (presence {:.2}, {:?} hand)",
            hand.presence(),
            hand.handedness(),
        );
        Cycle::Published(state)
    }

    /// Runs cycles until `stop` is set.
    ///
    /// `stop` is checked between cycles, so a cycle that is blocked on the camera or the detector
    /// is finished first.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            let pause = match self.cycle() {
                Cycle::ReadFailed => self.options.retry_delay,
                _ => self.options.frame_interval,
            };
            thread::sleep(pause);
        }
    }
}

/// Spawns a thread running a [`Publisher`].
///
/// The camera is opened on the publisher thread by calling `open`, since frame sources do not
/// have to be [`Send`]. This function blocks until `open` returns, and returns its error if it
/// fails.
pub fn spawn<F, O>(
    open: O,
    detector: SharedDetector,
    state: Arc<TrackingState>,
    options: PublisherOptions,
) -> anyhow::Result<PublisherHandle>
where
    F: FrameSource + 'static,
    O: FnOnce() -> anyhow::Result<F> + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let (opened, open_result) = mpsc::sync_channel(1);

    let thread_stop = stop.clone();
    let handle = thread::Builder::new()
        .name("publisher".into())
        .spawn(move || {
            let camera = match open() {
                Ok(camera) => {
                    opened.send(Ok(())).ok();
                    camera
                }
                Err(e) => {
                    opened.send(Err(e)).ok();
                    return;
                }
            };

            log::trace!("publisher starting");
            Publisher::new(camera, detector, state, options).run(&thread_stop);
            log::trace!("publisher exiting");
        })?;

    let handle = PublisherHandle {
        stop,
        handle: Some(handle),
    };
    match open_result.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            // The thread panicked while opening the camera. Dropping the handle propagates it.
            drop(handle);
            bail!("publisher thread exited before opening the camera")
        }
    }
}

/// Owns the publisher thread.
///
/// When dropped, the publisher is asked to stop and the thread is joined. If the thread has
/// panicked, the panic is forwarded to the thread dropping the handle.
pub struct PublisherHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PublisherHandle {
    /// Returns whether the publisher thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                if !thread::panicking() {
                    resume_unwind(payload);
                }
            }
        }
    }
}
