//! Artemis demo: stream frames from the built-in virtual camera.

use std::sync::Arc;
use std::time::Instant;

use artemis::device::sim::{SimOptions, SimTransport};
use artemis::{CameraCapture, CameraConfig, PipelineClock, PipelineHandle, Pulled};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Settings {
    camera: CameraConfig,
    /// Frames to emit before shutting down.
    frames: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            frames: 120,
        }
    }
}

/// Pipeline time measured from process start.
struct UptimeClock(Instant);

impl PipelineClock for UptimeClock {
    fn running_time(&self) -> std::time::Duration {
        self.0.elapsed()
    }
}

/// Optional `artemis.toml` next to the working directory, overridable via
/// `ARTEMIS__*` environment variables.
fn load_settings() -> Result<Settings> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("artemis").required(false))
        .add_source(config::Environment::with_prefix("ARTEMIS").separator("__"))
        .build()?;
    Ok(settings.try_deserialize()?)
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("artemis=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Artemis launching...");

    let mut settings = load_settings()?;
    if settings.camera.camera_id.is_empty() {
        settings.camera.camera_id = "SIM-0".to_string();
    }

    let pipeline = PipelineHandle::with_clock(Arc::new(UptimeClock(Instant::now())));
    {
        let pipeline = pipeline.clone();
        ctrlc::set_handler(move || pipeline.set_running(false))?;
    }

    let transport = Arc::new(SimTransport::new(SimOptions::default()));
    let mut capture = CameraCapture::new(transport, settings.camera, pipeline);

    capture.start()?;

    let caps = capture.query_caps()?;
    info!(
        "Camera reports {}x{}, raw formats {:?}, mosaic formats {:?}",
        caps.width, caps.height, caps.raw_formats, caps.mosaic_formats
    );
    let format = caps
        .raw_formats
        .first()
        .or(caps.mosaic_formats.first())
        .copied()
        .ok_or_else(|| eyre!("camera offers no negotiable formats"))?;
    capture.commit_format(format)?;

    let snapshot = capture.read_back()?;
    info!("Device reports exposure {:?} and gain {:?}", snapshot.exposure_time, snapshot.gain);

    let mut emitted = 0u64;
    while emitted < settings.frames {
        match capture.pull() {
            Pulled::Frame(frame) => {
                emitted += 1;
                if emitted % 30 == 0 {
                    info!(
                        "Frame {} ({} bytes, {} at {}x{}, pts {:?})",
                        frame.offset,
                        frame.data.len(),
                        frame.format,
                        frame.width,
                        frame.height,
                        frame.pts
                    );
                }
            }
            Pulled::Cancelled => {
                warn!("Capture was cancelled before the requested frame count");
                break;
            }
        }
    }

    capture.stop();
    capture.disconnect();
    info!("Artemis shutting down after {emitted} frames");
    Ok(())
}
