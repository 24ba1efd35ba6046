// SPDX-License-Identifier: MPL-2.0

//! Codec, capture and container capability traits
//!
//! The recording pipeline only talks to hardware through these traits. An
//! encoder is polled: [`HardwareEncoder::dequeue_output`] never blocks and
//! reports one event at a time, the way a hardware codec's output queue does.

#[cfg(test)]
pub(crate) mod testing;

use crate::config::{AudioSpec, Size};
use crate::constants::{FRAME_RATE, IFRAME_INTERVAL_SECS};
use crate::errors::MediaResult;
use crate::gpu::SurfaceTarget;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Track kinds a container holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Encoder configuration, and the output format reported once encoding starts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub bit_rate: u32,
    pub frame_rate: u32,
    pub i_frame_interval: u32,
    pub sample_rate: u32,
    pub channel_count: u32,
    /// Backend-specific stream description (e.g. GStreamer caps with codec data)
    pub caps: Option<String>,
}

impl MediaFormat {
    pub fn video(mime: &str, size: Size, bit_rate: u32) -> Self {
        Self {
            mime: mime.to_string(),
            width: size.width,
            height: size.height,
            bit_rate,
            frame_rate: FRAME_RATE,
            i_frame_interval: IFRAME_INTERVAL_SECS,
            ..Default::default()
        }
    }

    pub fn audio(mime: &str, spec: &AudioSpec) -> Self {
        Self {
            mime: mime.to_string(),
            bit_rate: spec.bitrate,
            sample_rate: spec.sample_rate,
            channel_count: spec.channels.count(),
            ..Default::default()
        }
    }

    pub fn with_caps(mut self, caps: impl Into<String>) -> Self {
        self.caps = Some(caps.into());
        self
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

/// Metadata for one encoded buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    /// Start of the payload inside the buffer
    pub offset: usize,
    /// Payload length in bytes
    pub size: usize,
    pub presentation_time_us: i64,
    pub key_frame: bool,
    pub end_of_stream: bool,
}

impl BufferInfo {
    /// The payload described by this info, if it lies inside `data`
    pub fn payload<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        data.get(self.offset..self.offset.checked_add(self.size)?)
    }
}

/// One event from an encoder's output queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderOutput {
    /// Nothing ready yet
    TryAgainLater,
    /// The encoder settled its output format; register it with the muxer
    FormatChanged(MediaFormat),
    /// An encoded buffer; hand `index` back with `release_output_buffer`
    Buffer {
        index: usize,
        data: Vec<u8>,
        info: BufferInfo,
    },
}

/// A (typically hardware) encoder driven by polling
pub trait HardwareEncoder: Send {
    fn configure(&mut self, format: &MediaFormat) -> MediaResult<()>;

    /// Surface frames are rendered into; only valid after `configure`
    fn create_input_surface(&mut self) -> MediaResult<Arc<dyn SurfaceTarget>>;

    fn start(&mut self) -> MediaResult<()>;

    /// Claim a free input slot, if any
    fn dequeue_input_buffer(&mut self) -> MediaResult<Option<usize>>;

    /// Fill a claimed slot and hand it to the encoder
    fn queue_input_buffer(
        &mut self,
        index: usize,
        data: &[u8],
        presentation_time_us: i64,
    ) -> MediaResult<()>;

    /// Poll the output queue without blocking
    fn dequeue_output(&mut self) -> MediaResult<EncoderOutput>;

    fn release_output_buffer(&mut self, index: usize) -> MediaResult<()>;

    /// Ask for the next output buffer to be a sync frame
    fn request_key_frame(&mut self) -> MediaResult<()>;

    /// No more input follows; the output queue ends with end-of-stream
    fn signal_end_of_input(&mut self) -> MediaResult<()>;

    fn stop(&mut self) -> MediaResult<()>;
    fn release(&mut self);
}

/// Microphone or other PCM16 source
pub trait AudioCapture: Send {
    fn start(&mut self) -> MediaResult<()>;
    fn is_recording(&self) -> bool;
    /// Copy available samples into `buf` without blocking; returns bytes written
    fn read(&mut self, buf: &mut [u8]) -> MediaResult<usize>;
    fn stop(&mut self) -> MediaResult<()>;
    fn release(&mut self);
}

/// Writes encoded tracks into one container file
pub trait ContainerMuxer: Send {
    /// Register a track; returns its index
    fn add_track(&mut self, format: &MediaFormat) -> MediaResult<usize>;
    fn start(&mut self) -> MediaResult<()>;
    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> MediaResult<()>;
    /// Finalize the container; may block until the file is complete
    fn stop(&mut self) -> MediaResult<()>;
    fn release(&mut self);
}

/// Factory for the pieces of a recording pipeline
pub trait MediaBackend: Send + Sync {
    /// Create an unconfigured encoder for `mime`
    fn create_encoder(&self, mime: &str) -> MediaResult<Box<dyn HardwareEncoder>>;
    fn create_audio_capture(&self, spec: &AudioSpec) -> MediaResult<Box<dyn AudioCapture>>;
    fn create_muxer(&self, output: &Path) -> MediaResult<Box<dyn ContainerMuxer>>;
}

/// Monotonic clock in microseconds, used to stamp encoded samples
pub fn monotonic_micros() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    // Offset by one second so the first stamp is strictly positive
    let epoch = EPOCH.get_or_init(Instant::now);
    1_000_000 + epoch.elapsed().as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_bounds() {
        let data = [1u8, 2, 3, 4, 5];
        let info = BufferInfo {
            offset: 1,
            size: 3,
            ..Default::default()
        };
        assert_eq!(info.payload(&data), Some(&[2u8, 3, 4][..]));

        let past_end = BufferInfo {
            offset: 4,
            size: 3,
            ..Default::default()
        };
        assert_eq!(past_end.payload(&data), None);
    }

    #[test]
    fn test_monotonic_micros_positive_and_increasing() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_video_format_carries_rate_hints() {
        let format = MediaFormat::video("video/avc", Size::new(640, 480), 1_000_000);
        assert_eq!(format.frame_rate, FRAME_RATE);
        assert_eq!(format.i_frame_interval, IFRAME_INTERVAL_SECS);
        assert_eq!(format.size(), Size::new(640, 480));
    }
}
