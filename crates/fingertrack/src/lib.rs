//! Webcam hand tracking served over HTTP.
//!
//! A background [`Publisher`][publisher::Publisher] continuously reads webcam frames, runs them
//! through a hand landmark detector, and publishes the position of the index fingertip together
//! with a coarse [`Gesture`][hand::gesture::Gesture] to a shared [`TrackingState`]. The HTTP
//! [`server`] hands out the latest published value and offers a stateless single-image detection
//! endpoint.
//!
//! # Coordinates
//!
//! Landmark coordinates are normalized: X and Y are in range 0.0 to 1.0, relative to the image
//! width and height. Y points *down*, like in the image. Z is a relative depth value and is not
//! used for gesture classification.
//!
//! # Environment Variables
//!
//! Every command line flag can also be set through an environment variable. The most useful ones:
//!
//! * `FINGERTRACK_WEBCAM_NAME`: Forces the device to use for [`Webcam`]s created without an
//!   explicit device name. If unset, the first device that supports a compatible image format will
//!   be used.
//! * `FINGERTRACK_MODEL`: Path to the ONNX hand landmark model.
//! * `FINGERTRACK_PALM_MODEL`: Path to the ONNX palm detection model.
//! * `RUST_LOG`: Overrides the log filter set up by [`init_logger!`].
//!
//! [`TrackingState`]: tracking::TrackingState
//! [`Webcam`]: video::webcam::Webcam

use log::LevelFilter;

pub mod detection;
pub mod detector;
pub mod hand;
pub mod landmark;
pub mod nn;
pub mod publisher;
pub mod rect;
pub mod resolution;
pub mod server;
pub mod timer;
pub mod tracking;
pub mod video;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("hyper"), LevelFilter::Warn)
        .filter(Some("tract_onnx"), LevelFilter::Warn)
        .filter(Some("tract_core"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and `fingertrack` will log at *trace*
/// level. Otherwise, they will log at *debug* level.
///
/// `hyper` and `tract` will always log at *warn* level, everything else at *info*. `RUST_LOG` is
/// applied on top of these defaults.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
