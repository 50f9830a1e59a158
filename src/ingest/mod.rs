//! Frame ingestion.
//!
//! Sources are selected by URL scheme:
//! - `stub://` synthetic frames (testing and offline runs)
//! - `http(s)://` MJPEG or single-JPEG cameras (feature: ingest-mjpeg)
//! - `rtsp://` IP cameras via GStreamer (feature: rtsp-gstreamer)
//!
//! A source only knows how to connect and decode. Reconnects, failure counting
//! and fan-out live in `reader`.

#[cfg(feature = "ingest-mjpeg")]
pub mod mjpeg;
pub mod reader;
pub mod rtsp;
pub mod synthetic;

use std::time::Duration;

use anyhow::{anyhow, Result};

#[cfg(feature = "ingest-mjpeg")]
pub use mjpeg::MjpegSource;
pub use reader::{
    ReaderAction, ReaderEvent, ReaderState, ReconnectPolicy, StreamReader, StreamStatus,
    StreamStatusSnapshot,
};
pub use rtsp::RtspSource;
pub use synthetic::SyntheticSource;

/// Decoded RGB24 image straight from a source, before sequencing.
#[derive(Clone, Debug)]
pub struct CapturedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Connection settings shared by every source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub url: String,
    /// Target frame rate. Sources decimate to this rate.
    pub target_fps: u32,
    /// Dimensions used by the synthetic source.
    pub width: u32,
    pub height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// A video source the reader can drive.
pub trait FrameSource: Send {
    /// Open (or reopen) the underlying stream.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next decoded frame is available.
    fn next_frame(&mut self) -> Result<CapturedImage>;

    /// Release the stream handle. Safe to call when not connected.
    fn disconnect(&mut self);

    fn describe(&self) -> String;
}

/// Build the source for `config.url` without connecting it.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let scheme = config
        .url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| anyhow!("stream url '{}' has no scheme", config.url))?;
    match scheme.as_str() {
        "stub" => Ok(Box::new(SyntheticSource::new(config.clone()))),
        "http" | "https" => {
            #[cfg(feature = "ingest-mjpeg")]
            {
                Ok(Box::new(MjpegSource::new(config.clone())?))
            }
            #[cfg(not(feature = "ingest-mjpeg"))]
            {
                anyhow::bail!("HTTP streams require the ingest-mjpeg feature")
            }
        }
        "rtsp" | "rtsps" => Ok(Box::new(RtspSource::new(config.clone())?)),
        other => Err(anyhow!(
            "unsupported stream scheme '{}'; expected stub, http(s) or rtsp",
            other
        )),
    }
}

/// Minimum spacing between emitted frames for `target_fps`.
pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_scheme_builds_synthetic_source() {
        let source = open_source(&SourceConfig::default()).unwrap();
        assert!(source.describe().contains("stub://camera"));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let config = SourceConfig {
            url: "ftp://camera/stream".to_string(),
            ..SourceConfig::default()
        };
        let err = open_source(&config).err().unwrap();
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn url_without_scheme_is_rejected() {
        let config = SourceConfig {
            url: "camera.local".to_string(),
            ..SourceConfig::default()
        };
        assert!(open_source(&config).is_err());
    }

    #[test]
    fn frame_interval_tracks_fps() {
        assert_eq!(frame_interval(10), Duration::from_millis(100));
        assert_eq!(frame_interval(0), Duration::ZERO);
    }
}
