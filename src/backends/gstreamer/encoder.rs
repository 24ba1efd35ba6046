// SPDX-License-Identifier: MPL-2.0

//! Polled encoder on top of a private GStreamer pipeline
//!
//! ```text
//! video: appsrc (RGBA) ! videoconvert ! <h264 enc> ! h264parse ! avc/au caps ! appsink
//! audio: appsrc (S16LE) ! audioconvert ! audioresample ! <aac enc> ! aacparse ! appsink
//! ```

use super::{first_available, make_element, pending_error, set_if_present};
use super::{AUDIO_ENCODERS, VIDEO_ENCODERS};
use crate::config::Size;
use crate::errors::{GpuError, GpuResult, MediaError, MediaResult};
use crate::gpu::SurfaceTarget;
use crate::media::{BufferInfo, EncoderOutput, HardwareEncoder, MediaFormat, TrackKind};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSrc};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bitrate settings for `name`, whose units differ between plugins
fn configure_video_encoder(encoder: &gst::Element, name: &str, format: &MediaFormat) {
    let kbps = (format.bit_rate / 1000).max(1).to_string();
    let key_int = (format.frame_rate * format.i_frame_interval).max(1).to_string();

    match name {
        "x264enc" => {
            set_if_present(encoder, "tune", "zerolatency");
            set_if_present(encoder, "speed-preset", "veryfast");
            set_if_present(encoder, "bitrate", &kbps);
            set_if_present(encoder, "key-int-max", &key_int);
        }
        "openh264enc" => {
            set_if_present(encoder, "rate-control", "bitrate");
            set_if_present(encoder, "usage-type", "camera");
            set_if_present(encoder, "bitrate", &format.bit_rate.to_string());
            set_if_present(encoder, "gop-size", &key_int);
        }
        "vah264enc" => {
            set_if_present(encoder, "rate-control", "cbr");
            set_if_present(encoder, "bitrate", &kbps);
            set_if_present(encoder, "key-int-max", &key_int);
        }
        "vaapih264enc" => {
            set_if_present(encoder, "rate-control", "cbr");
            set_if_present(encoder, "bitrate", &kbps);
            set_if_present(encoder, "keyframe-period", &key_int);
        }
        "nvh264enc" => {
            set_if_present(encoder, "rc-mode", "cbr");
            set_if_present(encoder, "bitrate", &kbps);
            set_if_present(encoder, "gop-size", &key_int);
        }
        _ => {
            debug!(encoder = name, "Using encoder with default configuration");
        }
    }
}

fn configure_audio_encoder(encoder: &gst::Element, name: &str, format: &MediaFormat) {
    let bitrate = match name {
        // faac takes kbps
        "faac" => format.bit_rate / 1000,
        _ => format.bit_rate,
    };
    set_if_present(encoder, "bitrate", &bitrate.to_string());
}

struct EncoderPipeline {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
}

impl EncoderPipeline {
    fn video(format: &MediaFormat) -> MediaResult<Self> {
        let encoder_name = first_available(VIDEO_ENCODERS)
            .ok_or_else(|| MediaError::Unavailable("no H.264 encoder installed".into()))?;
        info!(encoder = encoder_name, size = %format.size(), bitrate = format.bit_rate, "Building video encoder");

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGBA")
            .field("width", format.width as i32)
            .field("height", format.height as i32)
            .field("framerate", gst::Fraction::new(format.frame_rate as i32, 1))
            .build();
        let appsrc = AppSrc::builder()
            .name("video-input")
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(true)
            .do_timestamp(true)
            .build();

        let convert = make_element("videoconvert", "convert")?;
        let encoder = make_element(encoder_name, "encoder")?;
        configure_video_encoder(&encoder, encoder_name, format);
        let parse = make_element("h264parse", "parse")?;
        let filter = make_element("capsfilter", "avc-filter")?;
        filter.set_property(
            "caps",
            gst::Caps::builder("video/x-h264")
                .field("stream-format", "avc")
                .field("alignment", "au")
                .build(),
        );

        let appsink = AppSink::builder().name("video-output").sync(false).build();

        let pipeline = gst::Pipeline::with_name("video-encoder");
        let elements = [
            appsrc.upcast_ref::<gst::Element>(),
            &convert,
            &encoder,
            &parse,
            &filter,
            appsink.upcast_ref::<gst::Element>(),
        ];
        pipeline
            .add_many(elements)
            .map_err(|e| MediaError::Configure(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many(elements)
            .map_err(|e| MediaError::Configure(format!("Failed to link elements: {}", e)))?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
        })
    }

    fn audio(format: &MediaFormat) -> MediaResult<Self> {
        let encoder_name = first_available(AUDIO_ENCODERS)
            .ok_or_else(|| MediaError::Unavailable("no AAC encoder installed".into()))?;
        info!(
            encoder = encoder_name,
            rate = format.sample_rate,
            channels = format.channel_count,
            "Building audio encoder"
        );

        let caps = gst::Caps::builder("audio/x-raw")
            .field("format", "S16LE")
            .field("layout", "interleaved")
            .field("rate", format.sample_rate as i32)
            .field("channels", format.channel_count as i32)
            .build();
        let appsrc = AppSrc::builder()
            .name("audio-input")
            .caps(&caps)
            .format(gst::Format::Time)
            .build();

        let convert = make_element("audioconvert", "convert")?;
        let resample = make_element("audioresample", "resample")?;
        let encoder = make_element(encoder_name, "encoder")?;
        configure_audio_encoder(&encoder, encoder_name, format);
        let parse = make_element("aacparse", "parse")?;
        let appsink = AppSink::builder().name("audio-output").sync(false).build();

        let pipeline = gst::Pipeline::with_name("audio-encoder");
        let elements = [
            appsrc.upcast_ref::<gst::Element>(),
            &convert,
            &resample,
            &encoder,
            &parse,
            appsink.upcast_ref::<gst::Element>(),
        ];
        pipeline
            .add_many(elements)
            .map_err(|e| MediaError::Configure(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many(elements)
            .map_err(|e| MediaError::Configure(format!("Failed to link elements: {}", e)))?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
        })
    }

    fn shutdown(&self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Encoder input fed by presenting RGBA frames
pub struct GstInputSurface {
    appsrc: AppSrc,
    size: Size,
}

impl SurfaceTarget for GstInputSurface {
    fn size(&self) -> Size {
        self.size
    }

    fn present(&self, pixels: &[u8], size: Size) -> GpuResult<()> {
        if size != self.size {
            return Err(GpuError::Surface(format!(
                "encoder surface is {}, frame is {}",
                self.size, size
            )));
        }
        self.appsrc
            .push_buffer(gst::Buffer::from_slice(pixels.to_vec()))
            .map(|_| ())
            .map_err(|e| GpuError::Surface(format!("encoder rejected frame: {:?}", e)))
    }
}

/// [`HardwareEncoder`] backed by a GStreamer encoder element
pub struct GstEncoder {
    kind: TrackKind,
    format: Option<MediaFormat>,
    pipeline: Option<EncoderPipeline>,
    pending: VecDeque<EncoderOutput>,
    format_reported: bool,
    eos_reported: bool,
    next_input: usize,
    next_output: usize,
}

impl GstEncoder {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            format: None,
            pipeline: None,
            pending: VecDeque::new(),
            format_reported: false,
            eos_reported: false,
            next_input: 0,
            next_output: 0,
        }
    }

    fn pipeline(&self) -> MediaResult<&EncoderPipeline> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| MediaError::Codec(format!("{} encoder not configured", self.kind)))
    }

    fn buffer_output(&mut self, data: Vec<u8>, info: BufferInfo) -> EncoderOutput {
        let index = self.next_output;
        self.next_output += 1;
        EncoderOutput::Buffer { index, data, info }
    }

    /// Turn one pulled sample into queue events
    fn push_sample(&mut self, sample: gst::Sample) -> MediaResult<()> {
        if !self.format_reported {
            self.format_reported = true;
            let format = self.format.clone().unwrap_or_default();
            let format = match sample.caps() {
                Some(caps) => format.with_caps(caps.to_string()),
                None => format,
            };
            self.pending.push_back(EncoderOutput::FormatChanged(format));
        }

        let Some(buffer) = sample.buffer() else {
            return Ok(());
        };
        let map = buffer
            .map_readable()
            .map_err(|e| MediaError::Codec(format!("Failed to map output buffer: {}", e)))?;
        let data = map.as_slice().to_vec();
        let info = BufferInfo {
            offset: 0,
            size: data.len(),
            presentation_time_us: buffer.pts().map(|t| t.useconds() as i64).unwrap_or(0),
            key_frame: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
            end_of_stream: false,
        };
        let output = self.buffer_output(data, info);
        self.pending.push_back(output);
        Ok(())
    }
}

impl HardwareEncoder for GstEncoder {
    fn configure(&mut self, format: &MediaFormat) -> MediaResult<()> {
        let pipeline = match self.kind {
            TrackKind::Video => EncoderPipeline::video(format)?,
            TrackKind::Audio => EncoderPipeline::audio(format)?,
        };
        self.format = Some(format.clone());
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn create_input_surface(&mut self) -> MediaResult<Arc<dyn SurfaceTarget>> {
        if self.kind != TrackKind::Video {
            return Err(MediaError::Configure(
                "audio encoders take buffers, not a surface".into(),
            ));
        }
        let size = self.format.as_ref().map(MediaFormat::size).unwrap_or_default();
        Ok(Arc::new(GstInputSurface {
            appsrc: self.pipeline()?.appsrc.clone(),
            size,
        }))
    }

    fn start(&mut self) -> MediaResult<()> {
        let pipeline = self.pipeline()?;
        pipeline
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| {
                let detail = pending_error(&pipeline.pipeline).unwrap_or_default();
                MediaError::Codec(format!("Failed to start {} encoder: {} {}", self.kind, e, detail))
            })?;
        debug!(kind = %self.kind, "Encoder pipeline playing");
        Ok(())
    }

    fn dequeue_input_buffer(&mut self) -> MediaResult<Option<usize>> {
        match self.kind {
            // Video input arrives through the surface
            TrackKind::Video => Ok(None),
            TrackKind::Audio => {
                let index = self.next_input;
                self.next_input += 1;
                Ok(Some(index))
            }
        }
    }

    fn queue_input_buffer(
        &mut self,
        _index: usize,
        data: &[u8],
        presentation_time_us: i64,
    ) -> MediaResult<()> {
        let mut buffer = gst::Buffer::from_slice(data.to_vec());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_useconds(presentation_time_us.max(0) as u64));
        }
        self.pipeline()?
            .appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| MediaError::Codec(format!("Encoder rejected input: {:?}", e)))
    }

    fn dequeue_output(&mut self) -> MediaResult<EncoderOutput> {
        if let Some(output) = self.pending.pop_front() {
            return Ok(output);
        }

        let (error, sample, eos) = {
            let pipeline = self.pipeline()?;
            let error = pending_error(&pipeline.pipeline);
            let sample = pipeline.appsink.try_pull_sample(gst::ClockTime::ZERO);
            (error, sample, pipeline.appsink.is_eos())
        };
        if let Some(error) = error {
            return Err(MediaError::Codec(error));
        }

        if let Some(sample) = sample {
            self.push_sample(sample)?;
            return Ok(self
                .pending
                .pop_front()
                .unwrap_or(EncoderOutput::TryAgainLater));
        }

        if eos && !self.eos_reported {
            self.eos_reported = true;
            let info = BufferInfo {
                end_of_stream: true,
                ..Default::default()
            };
            return Ok(self.buffer_output(Vec::new(), info));
        }
        Ok(EncoderOutput::TryAgainLater)
    }

    fn release_output_buffer(&mut self, _index: usize) -> MediaResult<()> {
        // Output data is copied out of the sample when dequeued
        Ok(())
    }

    fn request_key_frame(&mut self) -> MediaResult<()> {
        let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        if !self.pipeline()?.appsink.send_event(event) {
            warn!(kind = %self.kind, "Encoder ignored key frame request");
        }
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> MediaResult<()> {
        self.pipeline()?
            .appsrc
            .end_of_stream()
            .map(|_| ())
            .map_err(|e| MediaError::Codec(format!("Failed to signal end of input: {:?}", e)))
    }

    fn stop(&mut self) -> MediaResult<()> {
        if let Some(pipeline) = &self.pipeline {
            pipeline
                .pipeline
                .set_state(gst::State::Ready)
                .map_err(|e| MediaError::Codec(format!("Failed to stop encoder: {}", e)))?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown();
            debug!(kind = %self.kind, "Encoder pipeline released");
        }
        self.pending.clear();
    }
}

impl Drop for GstEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_encoder_errors() {
        let mut encoder = GstEncoder::new(TrackKind::Video);
        assert!(matches!(encoder.start(), Err(MediaError::Codec(_))));
        assert!(encoder.create_input_surface().is_err());
        assert!(encoder.dequeue_output().is_err());
        assert_eq!(encoder.dequeue_input_buffer(), Ok(None));
        encoder.release();
    }

    #[test]
    fn test_audio_input_slots_increment() {
        let mut encoder = GstEncoder::new(TrackKind::Audio);
        assert_eq!(encoder.dequeue_input_buffer(), Ok(Some(0)));
        assert_eq!(encoder.dequeue_input_buffer(), Ok(Some(1)));
    }
}
