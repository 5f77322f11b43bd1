//! V4L2 webcam access.
//!
//! Currently, only V4L2 `VIDEO_CAPTURE` devices yielding JFIF JPEG or Motion JPEG frames are
//! supported.

use std::{cmp::Reverse, env};

use anyhow::{bail, Context};
use image::{DynamicImage, ImageFormat};
use linuxvideo::{
    format::{FrameIntervals, FrameSizes, PixFormat, PixelFormat},
    stream::ReadStream,
    BufType, CapabilityFlags, Device, Fract,
};

use crate::resolution::Resolution;
use crate::timer::Timer;

use super::FrameSource;

/// Environment variable that forces the webcam device to use (matched against the card name).
pub const ENV_VAR_WEBCAM_NAME: &str = "FINGERTRACK_WEBCAM_NAME";

/// Indicates whether to prefer a higher resolution or frame rate.
///
/// By default, [`ParamPreference::Resolution`] is used, selecting the smallest resolution that is
/// at least as large as the desired one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParamPreference {
    /// Prefer increased resolution over higher frame rates.
    #[default]
    Resolution,
    /// Prefer higher frame rate over higher image resolution.
    Framerate,
}

#[derive(Debug, Default, Clone, Copy)]
struct FramePrefs {
    resolution: Option<Resolution>,
    fps: Option<u32>,
    pref: ParamPreference,
}

/// Format negotiation options.
///
/// All format preferences are best-effort: if the camera cannot deliver them, the closest
/// supported format is used instead.
#[derive(Debug, Default, Clone)]
pub struct WebcamOptions {
    name: Option<String>,
    frame: FramePrefs,
}

impl WebcamOptions {
    /// Sets the name of the webcam device to open.
    ///
    /// If no webcam with the given name can be found, opening the webcam will result in an error.
    #[inline]
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the desired image resolution.
    #[inline]
    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.frame.resolution = Some(resolution);
        self
    }

    /// Sets the desired frame rate.
    #[inline]
    pub fn fps(mut self, fps: u32) -> Self {
        self.frame.fps = Some(fps);
        self
    }

    /// Selects whether to prefer a higher resolution or frame rate.
    ///
    /// When the camera cannot deliver the desired frame rate or resolution, this parameter controls
    /// which one will be maintained.
    #[inline]
    pub fn prefer(mut self, pref: ParamPreference) -> Self {
        self.frame.pref = pref;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameFormat {
    resolution: Resolution,
    fps: u32,
}

fn negotiate_format(device: &Device, prefs: FramePrefs) -> anyhow::Result<(PixFormat, Fract)> {
    let mut pixel_format = None;
    for format in device.formats(BufType::VIDEO_CAPTURE) {
        let format = format?;
        if format.pixel_format() == PixelFormat::JPEG || format.pixel_format() == PixelFormat::MJPG {
            pixel_format = Some(format.pixel_format());
            break;
        }
    }

    let Some(pixel_format) = pixel_format else {
        bail!("no supported pixel format found");
    };

    let mut formats = Vec::new();
    let mut frame_intervals = Vec::new();
    match device.frame_sizes(pixel_format)? {
        FrameSizes::Discrete(sizes) => {
            for size in sizes {
                let intervals =
                    match device.frame_intervals(pixel_format, size.width(), size.height())? {
                        FrameIntervals::Discrete(intervals) => intervals,
                        FrameIntervals::Stepwise(_) | FrameIntervals::Continuous(_) => {
                            bail!("stepwise or continuous frame rates are not supported")
                        }
                    };
                for rate in intervals {
                    let interval = *rate.fract();
                    formats.push(FrameFormat {
                        resolution: Resolution::new(size.width(), size.height()),
                        fps: (1.0 / interval.as_f32()).round() as u32,
                    });
                    frame_intervals.push(interval);
                }
            }
        }
        FrameSizes::Stepwise(_) | FrameSizes::Continuous(_) => {
            bail!("stepwise or continuous resolutions are not supported");
        }
    }

    let Some(index) = relax_until_match(&formats, prefs) else {
        bail!("failed to negotiate a webcam format");
    };
    let fmt = formats[index];
    Ok((
        PixFormat::new(
            fmt.resolution.width(),
            fmt.resolution.height(),
            pixel_format,
        ),
        frame_intervals[index],
    ))
}

/// Drops preferences one at a time (least important first) until a format matches.
///
/// Returns the index of the selected format.
fn relax_until_match(formats: &[FrameFormat], mut prefs: FramePrefs) -> Option<usize> {
    loop {
        if let Some(fmt) = negotiate_format_step(formats, prefs) {
            return Some(fmt);
        }

        log::debug!("failed to negotiate format with prefs {:?}", prefs);
        let relaxed = match prefs.pref {
            ParamPreference::Resolution => {
                prefs.fps.take().is_some() || prefs.resolution.take().is_some()
            }
            ParamPreference::Framerate => {
                prefs.resolution.take().is_some() || prefs.fps.take().is_some()
            }
        };
        if !relaxed {
            return None;
        }
        log::debug!("retrying with new prefs {:?}", prefs);
    }
}

fn negotiate_format_step(formats: &[FrameFormat], prefs: FramePrefs) -> Option<usize> {
    let eligible = formats.iter().enumerate().filter(|(_, fmt)| {
        prefs.resolution.map_or(true, |res| {
            fmt.resolution.width() >= res.width() && fmt.resolution.height() >= res.height()
        }) && prefs.fps.map_or(true, |fps| fmt.fps >= fps)
    });
    // Among the eligible formats, the one closest to the preferences wins: larger frames only cost
    // decoding and inference time.
    let best = match prefs.pref {
        ParamPreference::Resolution => eligible
            .max_by_key(|(_, fmt)| (Reverse(fmt.resolution.num_pixels()), fmt.fps)),
        ParamPreference::Framerate => eligible
            .max_by_key(|(_, fmt)| (fmt.fps, Reverse(fmt.resolution.num_pixels()))),
    };
    best.map(|(index, _)| index)
}

/// A webcam yielding a stream of decoded frames.
pub struct Webcam {
    stream: ReadStream,
    resolution: Resolution,
    t_dequeue: Timer,
    t_decode: Timer,
}

impl Webcam {
    /// Opens the first supported webcam found.
    ///
    /// If a name is configured (via [`WebcamOptions::name`] or [`ENV_VAR_WEBCAM_NAME`]), only a
    /// device with that card name is accepted.
    ///
    /// This function can block for a significant amount of time while the webcam initializes (on
    /// the order of hundreds of milliseconds).
    pub fn open(options: WebcamOptions) -> anyhow::Result<Self> {
        let name_from_env = env::var(ENV_VAR_WEBCAM_NAME).ok();
        if let Some(name) = &name_from_env {
            log::debug!("webcam override: `{ENV_VAR_WEBCAM_NAME}` is set to '{name}'");
        }
        let name = options.name.as_deref().or(name_from_env.as_deref());

        for res in linuxvideo::list().context("failed to enumerate video devices")? {
            match res {
                Ok(dev) => match Self::open_impl(dev, name, options.frame) {
                    Ok(Some(webcam)) => return Ok(webcam),
                    Ok(None) => {}
                    Err(e) => {
                        log::debug!("{:#}", e);
                    }
                },
                Err(e) => {
                    log::warn!("{}", e);
                }
            }
        }

        match name {
            Some(name) => bail!("no supported webcam device named '{name}' found"),
            None => bail!("no supported webcam device found"),
        }
    }

    fn open_impl(
        dev: Device,
        name: Option<&str>,
        prefs: FramePrefs,
    ) -> anyhow::Result<Option<Self>> {
        let caps = dev.capabilities()?;
        if let Some(name) = name {
            if caps.card() != name {
                return Ok(None);
            }
        }

        let cap_flags = caps.device_capabilities();
        let path = dev.path()?;
        log::debug!(
            "device {} ({}) capabilities: {:?}",
            caps.card(),
            path.display(),
            cap_flags,
        );

        if !cap_flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
            return Ok(None);
        }

        let (pixfmt, fract) = negotiate_format(&dev, prefs)?;

        let capture = dev.video_capture(pixfmt)?;

        let format = capture.format();
        let resolution = Resolution::new(format.width(), format.height());

        let actual = capture.set_frame_interval(fract)?;

        if let Some(requested) = prefs.resolution.filter(|&res| res != resolution) {
            log::info!("requested resolution {requested} is not available, using {resolution}");
        }
        log::info!(
            "opened {} ({}), {} @ {:.1}Hz",
            caps.card(),
            path.display(),
            resolution,
            1.0 / actual.as_f32(),
        );

        let stream = capture.into_stream()?;

        Ok(Some(Self {
            stream,
            resolution,
            t_dequeue: Timer::new("dequeue"),
            t_decode: Timer::new("decode"),
        }))
    }

    /// Returns the negotiated frame resolution.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }
}

impl FrameSource for Webcam {
    /// Reads the next frame from the camera.
    ///
    /// If no frame is available, this method will block until one is. Webcams occasionally
    /// produce corrupted MJPG frames (USB data corruption); those are reported as errors.
    fn read(&mut self) -> anyhow::Result<DynamicImage> {
        let dequeue_guard = self.t_dequeue.start();
        let decoded = self.stream.dequeue(|buf| {
            drop(dequeue_guard);
            Ok(self
                .t_decode
                .time(|| image::load_from_memory_with_format(&buf, ImageFormat::Jpeg)))
        })?;
        decoded.context("webcam decode error")
    }

    fn timers(&self) -> Vec<&Timer> {
        vec![&self.t_dequeue, &self.t_decode]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(width: u32, height: u32, fps: u32) -> FrameFormat {
        FrameFormat {
            resolution: Resolution::new(width, height),
            fps,
        }
    }

    fn formats() -> Vec<FrameFormat> {
        vec![
            format(640, 480, 30),
            format(1280, 720, 30),
            format(1280, 720, 10),
            format(1920, 1080, 5),
        ]
    }

    fn negotiate(prefs: FramePrefs) -> Option<FrameFormat> {
        let formats = formats();
        relax_until_match(&formats, prefs).map(|index| formats[index])
    }

    #[test]
    fn picks_closest_matching_format() {
        let prefs = FramePrefs {
            resolution: Some(Resolution::VGA),
            fps: Some(30),
            pref: ParamPreference::Resolution,
        };
        assert_eq!(negotiate(prefs), Some(format(640, 480, 30)));

        let prefs = FramePrefs {
            resolution: Some(Resolution::RES_720P),
            fps: None,
            pref: ParamPreference::Resolution,
        };
        assert_eq!(negotiate(prefs), Some(format(1280, 720, 30)));
    }

    #[test]
    fn resolution_is_best_effort() {
        let prefs = FramePrefs {
            resolution: Some(Resolution::new(3840, 2160)),
            fps: Some(30),
            pref: ParamPreference::Resolution,
        };
        // fps is dropped first, then resolution
        assert_eq!(negotiate(prefs), Some(format(640, 480, 30)));

        let prefs = FramePrefs {
            resolution: Some(Resolution::new(1920, 1080)),
            fps: Some(60),
            pref: ParamPreference::Resolution,
        };
        assert_eq!(negotiate(prefs), Some(format(1920, 1080, 5)));
    }

    #[test]
    fn framerate_preference_keeps_fps() {
        let prefs = FramePrefs {
            resolution: Some(Resolution::new(1920, 1080)),
            fps: Some(30),
            pref: ParamPreference::Framerate,
        };
        assert_eq!(negotiate(prefs), Some(format(640, 480, 30)));
    }

    #[test]
    fn no_formats() {
        assert_eq!(relax_until_match(&[], FramePrefs::default()), None);
    }
}
