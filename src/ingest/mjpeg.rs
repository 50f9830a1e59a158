//! HTTP MJPEG / JPEG camera source.
//!
//! Handles `multipart/x-mixed-replace` MJPEG streams (ESP32-CAM, most IP
//! cameras' `/stream` endpoints) and plain JPEG snapshot URLs, which are polled.
//! JPEGs are decoded in memory to RGB24.

use std::io::Read;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use url::Url;

use super::{frame_interval, CapturedImage, FrameSource, SourceConfig};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// A stalled stream surfaces as a read error after this long.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MjpegSource {
    config: SourceConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl MjpegSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let url = Url::parse(&config.url).context("parse stream url")?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported mjpeg scheme '{}'; expected http(s)",
                url.scheme()
            ));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Ok(Self {
            config,
            agent,
            stream: None,
            last_frame_at: None,
            frame_count: 0,
        })
    }
}

impl FrameSource for MjpegSource {
    fn connect(&mut self) -> Result<()> {
        self.stream = None;
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("connect to http stream {}", self.config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        log::info!("MjpegSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CapturedImage> {
        let min_interval = frame_interval(self.config.target_fps);
        loop {
            let jpeg_bytes = match &mut self.stream {
                Some(HttpStream::Mjpeg(stream)) => {
                    let bytes = stream.read_next_jpeg()?;
                    // The camera pushes at its own rate; skip frames that come early.
                    if remaining_wait(self.last_frame_at, Instant::now(), min_interval).is_some() {
                        continue;
                    }
                    bytes
                }
                Some(HttpStream::SingleJpeg) => {
                    if let Some(wait) =
                        remaining_wait(self.last_frame_at, Instant::now(), min_interval)
                    {
                        std::thread::sleep(wait);
                    }
                    fetch_single_jpeg(&self.agent, &self.config.url)?
                }
                None => return Err(anyhow!("http source not connected")),
            };

            let image = decode_jpeg(&jpeg_bytes)?;
            self.frame_count += 1;
            self.last_frame_at = Some(Instant::now());
            return Ok(image);
        }
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }

    fn describe(&self) -> String {
        format!("{} ({} frames)", self.config.url, self.frame_count)
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            // Garbage between boundaries; keep only a possible partial marker.
            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

/// Time left before the next frame is due, or `None` if it is due now.
fn remaining_wait(last: Option<Instant>, now: Instant, interval: Duration) -> Option<Duration> {
    let elapsed = now.saturating_duration_since(last?);
    interval.checked_sub(elapsed).filter(|left| !left.is_zero())
}

fn decode_jpeg(bytes: &[u8]) -> Result<CapturedImage> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    Ok(CapturedImage {
        pixels: image.into_rgb8().into_raw(),
        width,
        height,
    })
}

/// Byte range of the first complete SOI..EOI JPEG in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w[0] == 0xFF && w[1] == 0xD8)?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == 0xD9)?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tiny_jpeg() -> Vec<u8> {
        let pixels = vec![128u8; 8 * 8 * 3];
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
            .encode(&pixels, 8, 8, image::ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn finds_jpeg_between_multipart_headers() {
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        body.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        body.extend_from_slice(b"\r\n--frame\r\n");
        let (start, end) = find_jpeg_bounds(&body).unwrap();
        assert_eq!(&body[start..end], &[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
    }

    #[test]
    fn incomplete_jpeg_has_no_bounds() {
        assert!(find_jpeg_bounds(&[0xFF, 0xD8, 1, 2, 3]).is_none());
        assert!(find_jpeg_bounds(&[1, 2, 3]).is_none());
    }

    #[test]
    fn stream_yields_each_jpeg_in_order() {
        let jpeg = tiny_jpeg();
        let mut body = Vec::new();
        for _ in 0..2 {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&jpeg);
            body.extend_from_slice(b"\r\n");
        }
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));

        for _ in 0..2 {
            let bytes = stream.read_next_jpeg().unwrap();
            let image = decode_jpeg(&bytes).unwrap();
            assert_eq!((image.width, image.height), (8, 8));
            assert_eq!(image.pixels.len(), 8 * 8 * 3);
        }
        assert!(stream.read_next_jpeg().is_err());
    }

    #[test]
    fn remaining_wait_covers_the_rest_of_the_interval() {
        let interval = Duration::from_millis(200);
        let now = Instant::now();
        assert_eq!(remaining_wait(None, now, interval), None);
        assert_eq!(
            remaining_wait(Some(now), now + Duration::from_millis(50), interval),
            Some(Duration::from_millis(150))
        );
        assert_eq!(remaining_wait(Some(now), now + interval, interval), None);
        assert_eq!(remaining_wait(Some(now), now + Duration::from_secs(1), interval), None);
    }

    /// Serves `jpeg` to every request and counts requests.
    fn snapshot_server(jpeg: Vec<u8>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/capture", listener.local_addr().unwrap());
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        std::thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(mut conn) = conn else { break };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match conn.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    jpeg.len()
                );
                let _ = conn.write_all(header.as_bytes());
                let _ = conn.write_all(&jpeg);
            }
        });
        (url, requests)
    }

    #[test]
    fn snapshot_camera_is_polled_at_the_target_rate() {
        let (url, requests) = snapshot_server(tiny_jpeg());
        let mut source = MjpegSource::new(SourceConfig {
            url,
            target_fps: 5,
            ..SourceConfig::default()
        })
        .unwrap();
        source.connect().unwrap();
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        let started = Instant::now();
        for _ in 0..3 {
            let image = source.next_frame().unwrap();
            assert_eq!((image.width, image.height), (8, 8));
        }

        // One fetch per frame, spaced by the 200 ms interval.
        assert_eq!(requests.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn rejects_non_http_url() {
        let config = SourceConfig {
            url: "rtsp://camera/stream".to_string(),
            ..SourceConfig::default()
        };
        assert!(MjpegSource::new(config).is_err());
    }
}
