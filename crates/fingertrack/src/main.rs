use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use fingertrack::{
    detector::{DetectorOptions, RunningMode, SharedDetector},
    hand::landmarker::HandLandmarker,
    publisher::{self, PublisherOptions},
    resolution::Resolution,
    server::{self, AppState},
    tracking::TrackingState,
    video::{
        webcam::{ParamPreference, Webcam, WebcamOptions, ENV_VAR_WEBCAM_NAME},
        FrameSource,
    },
};

/// Tracks the index fingertip in webcam frames and serves it over HTTP.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Config {
    /// Address to serve the HTTP API on.
    #[arg(long, env = "FINGERTRACK_LISTEN", default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Path to the ONNX hand landmark model.
    #[arg(long, env = "FINGERTRACK_MODEL", default_value = "hand_landmark_full.onnx")]
    model: PathBuf,

    /// Path to the ONNX palm detection model.
    #[arg(
        long,
        env = "FINGERTRACK_PALM_MODEL",
        default_value = DetectorOptions::DEFAULT_PALM_MODEL
    )]
    palm_model: PathBuf,

    /// Name of the webcam to use. Defaults to the first compatible device.
    #[arg(long, env = ENV_VAR_WEBCAM_NAME)]
    camera: Option<String>,

    /// Requested capture resolution. The closest supported one is used if unavailable.
    #[arg(long, default_value = "640x480")]
    resolution: Resolution,

    /// Requested capture frame rate.
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Favor the requested frame rate over the requested resolution.
    #[arg(long)]
    prefer_framerate: bool,

    /// Delay between processed frames, also used as the detector timestamp increment.
    #[arg(long, default_value_t = 33)]
    frame_interval_ms: u64,

    /// Do not mirror frames horizontally before detection.
    #[arg(long)]
    no_mirror: bool,

    /// Maximum number of hands to detect per frame.
    #[arg(long, default_value_t = DetectorOptions::DEFAULT_NUM_HANDS)]
    num_hands: usize,

    /// Minimum confidence for a hand to be detected.
    #[arg(long, default_value_t = DetectorOptions::DEFAULT_MIN_CONFIDENCE)]
    min_detection_confidence: f32,

    /// Minimum confidence for a tracked hand to stay tracked.
    #[arg(long, default_value_t = DetectorOptions::DEFAULT_MIN_CONFIDENCE)]
    min_tracking_confidence: f32,

    /// Largest accepted `POST /process_frame` body, in bytes.
    #[arg(
        long,
        env = "FINGERTRACK_MAX_FRAME_BYTES",
        default_value_t = server::DEFAULT_MAX_FRAME_BYTES
    )]
    max_frame_bytes: usize,

    /// Exit if the camera cannot be opened instead of serving the default state.
    #[arg(long)]
    require_camera: bool,

    /// Open the camera, read a single frame, and exit.
    #[arg(long)]
    check_camera: bool,
}

impl Config {
    fn detector_options(&self) -> DetectorOptions {
        DetectorOptions::new(&self.model)
            .palm_model(&self.palm_model)
            .running_mode(RunningMode::Video)
            .num_hands(self.num_hands)
            .min_hand_detection_confidence(self.min_detection_confidence)
            .min_tracking_confidence(self.min_tracking_confidence)
    }

    fn webcam_options(&self) -> WebcamOptions {
        let options = WebcamOptions::default()
            .resolution(self.resolution)
            .fps(self.fps)
            .prefer(if self.prefer_framerate {
                ParamPreference::Framerate
            } else {
                ParamPreference::Resolution
            });
        match &self.camera {
            Some(name) => options.name(name.clone()),
            None => options,
        }
    }

    fn publisher_options(&self) -> PublisherOptions {
        PublisherOptions::default()
            .frame_interval(Duration::from_millis(self.frame_interval_ms))
            .mirror(!self.no_mirror)
    }
}

fn main() -> anyhow::Result<ExitCode> {
    fingertrack::init_logger!();

    let config = Config::parse();
    log::debug!("{config:?}");

    if config.check_camera {
        return Ok(check_camera(config.webcam_options()));
    }

    let landmarker = HandLandmarker::new(config.detector_options())?;
    let detector = SharedDetector::new(landmarker);
    let tracking = Arc::new(TrackingState::new());

    let webcam_options = config.webcam_options();
    let publisher = match publisher::spawn(
        move || Webcam::open(webcam_options),
        detector.clone(),
        tracking.clone(),
        config.publisher_options(),
    ) {
        Ok(handle) => Some(handle),
        Err(e) if config.require_camera => {
            return Err(e.context("failed to start tracking"));
        }
        Err(e) => {
            log::error!("failed to open camera: {e:#}");
            log::warn!("serving the default finger state, only POST /process_frame is functional");
            None
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let state = AppState {
        tracking,
        detector,
        max_frame_bytes: config.max_frame_bytes,
    };
    let result = runtime.block_on(server::serve(config.listen, state));

    if publisher.is_some() {
        log::info!("stopping publisher");
    }
    drop(publisher);

    result.map(|()| ExitCode::SUCCESS)
}

fn check_camera(options: WebcamOptions) -> ExitCode {
    let mut webcam = match Webcam::open(options) {
        Ok(webcam) => webcam,
        Err(e) => {
            log::error!("camera cannot be opened: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let negotiated = webcam.resolution();
    match webcam.read() {
        Ok(frame) => {
            let frame = frame.into_rgb8();
            log::info!(
                "camera is working, read a {}x{} frame (negotiated {negotiated})",
                frame.width(),
                frame.height()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("camera opened, but reading a frame failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
