// SPDX-License-Identifier: MPL-2.0

//! Video and audio encoder drain logic
//!
//! Each wrapper owns one [`HardwareEncoder`] and moves its output into the
//! shared [`MuxSynchronizer`]. A call to `drain` does a bounded amount of
//! non-blocking work and reports whether anything happened, so the drain
//! loops in the recorder only back off when the encoder is idle.

use super::muxer::MuxSynchronizer;
use crate::config::{AudioSpec, Size};
use crate::constants::{AUDIO_MIME_AAC, VIDEO_MIME_AVC};
use crate::errors::{RecordingError, RecordingResult};
use crate::gpu::SurfaceTarget;
use crate::media::{
    AudioCapture, BufferInfo, EncoderOutput, HardwareEncoder, MediaBackend, MediaFormat,
    TrackKind, monotonic_micros,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// PCM frames per channel handed to the audio encoder per input slot
const AUDIO_SAMPLES_PER_SLOT: usize = 1024;

/// Outcome of one drain step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Something was consumed or produced; call again right away
    Progress,
    /// Nothing was ready
    Idle,
    /// The encoder reported end-of-stream
    Finished,
}

/// Register a reported output format, rejecting a second change once the
/// container is running
async fn register_format(
    muxer: &MuxSynchronizer,
    kind: TrackKind,
    format: MediaFormat,
) -> RecordingResult<()> {
    if muxer.is_started() {
        return Err(RecordingError::DuplicateFormatChange(kind));
    }
    debug!(%kind, caps = ?format.caps, "Encoder output format settled");
    muxer.add_track(kind, format).await?;
    Ok(())
}

fn release_encoder(kind: TrackKind, encoder: &mut dyn HardwareEncoder) {
    if let Err(e) = encoder.stop() {
        warn!(%kind, error = %e, "Failed to stop encoder");
    }
    encoder.release();
}

async fn write_video(muxer: &MuxSynchronizer, data: &[u8], info: &BufferInfo) {
    match info.payload(data) {
        Some(payload) => {
            let info = BufferInfo {
                offset: 0,
                ..*info
            };
            muxer.write(TrackKind::Video, payload, &info).await;
        }
        None => warn!(
            offset = info.offset,
            size = info.size,
            len = data.len(),
            "Video buffer info outside buffer"
        ),
    }
}

/// H.264 encoder fed through a render surface
pub struct VideoEncoderWrapper {
    encoder: Box<dyn HardwareEncoder>,
    muxer: MuxSynchronizer,
    input_surface: Arc<dyn SurfaceTarget>,
    size: Size,
    key_frame_requested: bool,
    released: bool,
}

impl VideoEncoderWrapper {
    /// Create, configure and start the video encoder
    pub fn new(
        backend: &dyn MediaBackend,
        size: Size,
        bitrate: u32,
        muxer: MuxSynchronizer,
    ) -> RecordingResult<Self> {
        let format = MediaFormat::video(VIDEO_MIME_AVC, size, bitrate);
        let mut encoder = backend.create_encoder(VIDEO_MIME_AVC)?;
        encoder.configure(&format)?;
        let input_surface = encoder.create_input_surface()?;
        encoder.start()?;

        info!(%size, bitrate, "Video encoder started");

        Ok(Self {
            encoder,
            muxer,
            input_surface,
            size,
            key_frame_requested: false,
            released: false,
        })
    }

    /// Surface the video sink renders into
    pub fn input_surface(&self) -> Arc<dyn SurfaceTarget> {
        Arc::clone(&self.input_surface)
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Handle at most one output event
    pub async fn drain(&mut self) -> RecordingResult<DrainStatus> {
        match self.encoder.dequeue_output()? {
            EncoderOutput::TryAgainLater => Ok(DrainStatus::Idle),
            EncoderOutput::FormatChanged(format) => {
                register_format(&self.muxer, TrackKind::Video, format).await?;
                Ok(DrainStatus::Progress)
            }
            EncoderOutput::Buffer {
                index,
                data,
                mut info,
            } => {
                if self.muxer.is_started() && info.size > 0 {
                    info.presentation_time_us = monotonic_micros();

                    // Sync frames produced before the container started were
                    // dropped, so ask for a fresh one
                    if !self.key_frame_requested {
                        self.encoder.request_key_frame()?;
                        self.key_frame_requested = true;
                    }
                    write_video(&self.muxer, &data, &info).await;
                }

                self.encoder.release_output_buffer(index)?;

                if info.end_of_stream {
                    debug!("Video encoder reached end of stream");
                    Ok(DrainStatus::Finished)
                } else {
                    Ok(DrainStatus::Progress)
                }
            }
        }
    }

    pub fn signal_end_of_input(&mut self) -> RecordingResult<()> {
        self.encoder.signal_end_of_input()?;
        Ok(())
    }

    /// Stop and release the encoder; safe to call more than once
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            release_encoder(TrackKind::Video, self.encoder.as_mut());
        }
    }
}

impl Drop for VideoEncoderWrapper {
    fn drop(&mut self) {
        self.release();
    }
}

/// AAC encoder fed from an audio capture device
pub struct AudioEncoderWrapper {
    encoder: Box<dyn HardwareEncoder>,
    capture: Box<dyn AudioCapture>,
    muxer: MuxSynchronizer,
    scratch: Vec<u8>,
    /// Input slot claimed while no audio was available
    pending_slot: Option<usize>,
    input_ended: bool,
    released: bool,
}

impl AudioEncoderWrapper {
    /// Create and start the audio encoder around an existing capture
    pub fn new(
        backend: &dyn MediaBackend,
        spec: &AudioSpec,
        capture: Box<dyn AudioCapture>,
        muxer: MuxSynchronizer,
    ) -> RecordingResult<Self> {
        let format = MediaFormat::audio(AUDIO_MIME_AAC, spec);
        let mut encoder = backend.create_encoder(AUDIO_MIME_AAC)?;
        encoder.configure(&format)?;
        encoder.start()?;

        // PCM16
        let slot_bytes = AUDIO_SAMPLES_PER_SLOT * spec.channels.count() as usize * 2;

        info!(
            sample_rate = spec.sample_rate,
            channels = spec.channels.count(),
            bitrate = spec.bitrate,
            "Audio encoder started"
        );

        Ok(Self {
            encoder,
            capture,
            muxer,
            scratch: vec![0; slot_bytes],
            pending_slot: None,
            input_ended: false,
            released: false,
        })
    }

    /// Feed one chunk of captured audio, then drain every ready output
    pub async fn drain(&mut self) -> RecordingResult<DrainStatus> {
        let mut progressed = false;

        if !self.input_ended {
            progressed = self.feed()?;
        }

        loop {
            match self.encoder.dequeue_output()? {
                EncoderOutput::TryAgainLater => break,
                EncoderOutput::FormatChanged(format) => {
                    register_format(&self.muxer, TrackKind::Audio, format).await?;
                    progressed = true;
                    break;
                }
                EncoderOutput::Buffer { index, data, info } => {
                    if self.muxer.is_started() && info.size > 0 && info.presentation_time_us > 0 {
                        if let Some(payload) = info.payload(&data) {
                            let info = BufferInfo { offset: 0, ..info };
                            self.muxer.write(TrackKind::Audio, payload, &info).await;
                        }
                    }
                    self.encoder.release_output_buffer(index)?;
                    progressed = true;

                    if info.end_of_stream {
                        debug!("Audio encoder reached end of stream");
                        return Ok(DrainStatus::Finished);
                    }
                }
            }
        }

        Ok(if progressed {
            DrainStatus::Progress
        } else {
            DrainStatus::Idle
        })
    }

    /// Move one chunk of captured audio into an encoder input slot
    fn feed(&mut self) -> RecordingResult<bool> {
        if !self.capture.is_recording() {
            self.capture.start()?;
        }

        let slot = match self.pending_slot.take() {
            Some(slot) => Some(slot),
            None => self.encoder.dequeue_input_buffer()?,
        };
        let Some(index) = slot else {
            return Ok(false);
        };

        let read = self.capture.read(&mut self.scratch)?;
        if read > 0 {
            self.encoder
                .queue_input_buffer(index, &self.scratch[..read], monotonic_micros())?;
            Ok(true)
        } else {
            self.pending_slot = Some(index);
            Ok(false)
        }
    }

    pub fn signal_end_of_input(&mut self) -> RecordingResult<()> {
        self.input_ended = true;
        if let Err(e) = self.capture.stop() {
            warn!(error = %e, "Failed to stop audio capture");
        }
        self.encoder.signal_end_of_input()?;
        Ok(())
    }

    /// Stop and release the encoder and the capture; safe to call more than once
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            release_encoder(TrackKind::Audio, self.encoder.as_mut());
            if self.capture.is_recording() {
                if let Err(e) = self.capture.stop() {
                    warn!(error = %e, "Failed to stop audio capture");
                }
            }
            self.capture.release();
        }
    }
}

impl Drop for AudioEncoderWrapper {
    fn drop(&mut self) {
        self.release();
    }
}
