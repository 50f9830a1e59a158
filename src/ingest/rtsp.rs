//! RTSP camera source backed by GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink` with RGB caps and a
//! one-buffer, drop-oldest appsink so the decoder never queues stale frames.
//! Without the `rtsp-gstreamer` feature, constructing the source fails.

use anyhow::Result;
#[cfg(feature = "rtsp-gstreamer")]
use anyhow::{anyhow, Context};
#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::Duration;

use super::{CapturedImage, FrameSource, SourceConfig};

pub struct RtspSource {
    config: SourceConfig,
    #[cfg(feature = "rtsp-gstreamer")]
    pipeline: Option<GstPipeline>,
}

#[cfg(feature = "rtsp-gstreamer")]
struct GstPipeline {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

impl RtspSource {
    #[cfg(feature = "rtsp-gstreamer")]
    pub fn new(config: SourceConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            pipeline: None,
        })
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    pub fn new(config: SourceConfig) -> Result<Self> {
        anyhow::bail!(
            "RTSP stream {} requires the rtsp-gstreamer feature",
            config.url
        )
    }

    #[cfg(feature = "rtsp-gstreamer")]
    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstPipeline {
    fn build(url: &str, target_fps: u32) -> Result<Self> {
        let rate = if target_fps > 0 {
            format!(" ! videorate drop-only=true ! video/x-raw,framerate={}/1", target_fps)
        } else {
            String::new()
        };
        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert{} ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url, rate
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self { pipeline, appsink })
    }

    /// Surface pipeline errors and end-of-stream as read failures.
    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("RTSP stream reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstPipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        self.pipeline = None;
        let pipeline = GstPipeline::build(&self.config.url, self.config.target_fps)?;
        pipeline
            .pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        self.pipeline = Some(pipeline);
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CapturedImage> {
        let timeout = self.frame_timeout();
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("RTSP source not connected"))?;
        pipeline.check_bus()?;

        let sample = pipeline
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| anyhow!("RTSP stream stalled"))?;
        sample_to_image(&sample)
    }

    fn disconnect(&mut self) {
        self.pipeline = None;
    }

    fn describe(&self) -> String {
        format!("{} (gstreamer)", self.config.url)
    }
}

#[cfg(not(feature = "rtsp-gstreamer"))]
impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        anyhow::bail!("RTSP support not compiled in")
    }

    fn next_frame(&mut self) -> Result<CapturedImage> {
        anyhow::bail!("RTSP support not compiled in")
    }

    fn disconnect(&mut self) {}

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_image(sample: &gstreamer::Sample) -> Result<CapturedImage> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok(CapturedImage {
            pixels: data.get(..row_bytes * height as usize)
                .context("RTSP buffer shorter than frame")?
                .to_vec(),
            width,
            height,
        });
    }

    // Strip per-row padding.
    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Ok(CapturedImage {
        pixels,
        width,
        height,
    })
}

#[cfg(all(test, not(feature = "rtsp-gstreamer")))]
mod tests {
    use super::*;

    #[test]
    fn rtsp_without_gstreamer_is_a_configuration_error() {
        let config = SourceConfig {
            url: "rtsp://camera.local:554/stream".to_string(),
            ..SourceConfig::default()
        };
        let err = RtspSource::new(config).err().unwrap();
        assert!(err.to_string().contains("rtsp-gstreamer"));
    }
}
