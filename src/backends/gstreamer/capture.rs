// SPDX-License-Identifier: MPL-2.0

//! Microphone capture into interleaved PCM16

use super::{AUDIO_SOURCES, first_available, pending_error};
use crate::config::AudioSpec;
use crate::errors::{MediaError, MediaResult};
use crate::media::AudioCapture;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use tracing::{debug, info, warn};

/// Non-blocking PCM16 source on top of the default audio input
pub struct GstAudioCapture {
    pipeline: Option<gst::Pipeline>,
    appsink: AppSink,
    /// Bytes pulled from the sink that did not fit the last read
    leftover: Vec<u8>,
    recording: bool,
}

impl GstAudioCapture {
    pub fn new(spec: &AudioSpec) -> MediaResult<Self> {
        let source = first_available(AUDIO_SOURCES)
            .ok_or_else(|| MediaError::Unavailable("no audio source element".into()))?;

        let pipeline_str = format!(
            "{} ! audioconvert ! audioresample ! \
             audio/x-raw,format=S16LE,layout=interleaved,rate={},channels={} ! \
             appsink name=capture-sink sync=false max-buffers=64 drop=true",
            source,
            spec.sample_rate,
            spec.channels.count()
        );
        info!(pipeline = %pipeline_str, "Creating audio capture pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| MediaError::Capture(format!("Failed to parse pipeline: {}", e)))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| MediaError::Capture("Failed to cast to pipeline".into()))?;
        let appsink = pipeline
            .by_name("capture-sink")
            .and_then(|e| e.dynamic_cast::<AppSink>().ok())
            .ok_or_else(|| MediaError::Capture("capture sink missing".into()))?;

        Ok(Self {
            pipeline: Some(pipeline),
            appsink,
            leftover: Vec::new(),
            recording: false,
        })
    }
}

impl AudioCapture for GstAudioCapture {
    fn start(&mut self) -> MediaResult<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| MediaError::Capture("capture released".into()))?;
        pipeline.set_state(gst::State::Playing).map_err(|e| {
            let detail = pending_error(pipeline).unwrap_or_default();
            MediaError::Capture(format!("Failed to start capture: {} {}", e, detail))
        })?;
        self.recording = true;
        debug!("Audio capture started");
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.recording
    }

    fn read(&mut self, buf: &mut [u8]) -> MediaResult<usize> {
        if let Some(pipeline) = &self.pipeline
            && let Some(error) = pending_error(pipeline)
        {
            return Err(MediaError::Capture(error));
        }

        while self.leftover.len() < buf.len() {
            let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) else {
                break;
            };
            let Some(buffer) = sample.buffer() else {
                continue;
            };
            let map = buffer
                .map_readable()
                .map_err(|e| MediaError::Capture(format!("Failed to map buffer: {}", e)))?;
            self.leftover.extend_from_slice(map.as_slice());
        }

        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }

    fn stop(&mut self) -> MediaResult<()> {
        self.recording = false;
        if let Some(pipeline) = &self.pipeline {
            pipeline
                .set_state(gst::State::Null)
                .map_err(|e| MediaError::Capture(format!("Failed to stop capture: {}", e)))?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.recording = false;
        self.leftover.clear();
        if let Some(pipeline) = self.pipeline.take()
            && let Err(e) = pipeline.set_state(gst::State::Null)
        {
            warn!(error = %e, "Failed to release audio capture");
        }
    }
}

impl Drop for GstAudioCapture {
    fn drop(&mut self) {
        self.release();
    }
}
