//! Per-consumer MJPEG streams pulled from the frame cache.
//!
//! Each consumer polls the cache on its own schedule. Nothing here ever
//! blocks the capture loop: a slow consumer just sees fewer frames, and a
//! fast one may see the same frame twice.

use std::convert::Infallible;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use image::codecs::jpeg::JpegEncoder;
use tracing::{debug, warn};

use crate::capture::frame::{CachedFrame, CanonicalFrame};
use crate::error::EncodeError;
use crate::pipeline::FrameCache;
use crate::StreamConfig;

pub const BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Wait between polls while the cache is still empty.
    pub poll_interval: Duration,
    /// Pause after each emitted part.
    pub frame_interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            frame_interval: Duration::from_millis(33),
            jpeg_quality: 80,
        }
    }
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            frame_interval: Duration::from_millis(config.frame_interval_ms),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
        }
    }
}

/// One JPEG-encoded cache entry.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub sequence: u64,
    pub jpeg: Bytes,
}

impl EncodedFrame {
    /// Frame as one `multipart/x-mixed-replace` part.
    pub fn to_multipart(&self) -> Bytes {
        let mut part = BytesMut::with_capacity(self.jpeg.len() + 64);
        part.put_slice(b"--");
        part.put_slice(BOUNDARY.as_bytes());
        part.put_slice(b"\r\nContent-Type: image/jpeg\r\n\r\n");
        part.put_slice(&self.jpeg);
        part.put_slice(b"\r\n");
        part.freeze()
    }
}

pub fn encode_jpeg(frame: &CanonicalFrame, quality: u8) -> Result<Bytes, EncodeError> {
    let mut buf = Cursor::new(Vec::with_capacity(frame.image.as_raw().len() / 8));
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(&frame.image)?;
    Ok(Bytes::from(buf.into_inner()))
}

async fn encode_entry(entry: Arc<CachedFrame>, quality: u8) -> Result<EncodedFrame, EncodeError> {
    let sequence = entry.sequence;
    let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&entry.frame, quality)).await??;
    Ok(EncodedFrame { sequence, jpeg })
}

/// Fans the latest cached frame out to any number of consumers.
#[derive(Clone)]
pub struct StreamMultiplexer {
    cache: Arc<FrameCache>,
    settings: StreamSettings,
    consumers: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

struct ConsumerGuard(Arc<AtomicUsize>);

impl ConsumerGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        let active = counter.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("qc_stream_consumers").set(active as f64);
        debug!(active, "stream consumer attached");
        Self(counter)
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let active = self.0.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!("qc_stream_consumers").set(active as f64);
        debug!(active, "stream consumer detached");
    }
}

impl StreamMultiplexer {
    pub fn new(cache: Arc<FrameCache>, settings: StreamSettings) -> Self {
        Self {
            cache,
            settings,
            consumers: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// End every open stream at its next poll. Used on shutdown so that
    /// long-lived consumers do not hold the server open.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn active_consumers(&self) -> usize {
        self.consumers.load(Ordering::Relaxed)
    }

    /// Encode the current frame once, for single-shot snapshots.
    pub async fn encode_snapshot(&self) -> Result<Option<EncodedFrame>, EncodeError> {
        match self.cache.snapshot() {
            Some(entry) => encode_entry(entry, self.settings.jpeg_quality).await.map(Some),
            None => Ok(None),
        }
    }

    /// Unbounded sequence of encoded frames for one consumer.
    ///
    /// The same frame is re-emitted when nothing new was published between
    /// polls; its previous encoding is reused and the next emission waits at
    /// least `poll_interval`.
    pub fn subscribe(&self) -> impl Stream<Item = EncodedFrame> + Send + 'static {
        let cache = Arc::clone(&self.cache);
        let settings = self.settings.clone();
        let counter = Arc::clone(&self.consumers);
        let closed = Arc::clone(&self.closed);

        stream! {
            let _consumer = ConsumerGuard::new(counter);
            let mut last: Option<EncodedFrame> = None;
            while !closed.load(Ordering::Acquire) {
                let Some(entry) = cache.snapshot() else {
                    tokio::time::sleep(settings.poll_interval).await;
                    continue;
                };

                let (encoded, repeat) = match last.take() {
                    Some(prev) if prev.sequence == entry.sequence => (prev, true),
                    _ => match encode_entry(entry, settings.jpeg_quality).await {
                        Ok(encoded) => (encoded, false),
                        Err(err) => {
                            warn!("Failed to encode frame for stream: {}", err);
                            tokio::time::sleep(settings.poll_interval).await;
                            continue;
                        }
                    },
                };
                last = Some(encoded.clone());
                yield encoded;

                // A repeat waits at least one poll so an idle cache is not
                // re-sent at socket speed.
                let pause = if repeat {
                    settings.frame_interval.max(settings.poll_interval)
                } else {
                    settings.frame_interval
                };
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    /// [`subscribe`](Self::subscribe) framed as multipart body chunks.
    pub fn multipart(&self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        self.subscribe().map(|frame| Ok(frame.to_multipart()))
    }
}
