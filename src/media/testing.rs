// SPDX-License-Identifier: MPL-2.0

//! Scripted media backend for unit tests
//!
//! Encoders behave like a minimal codec: `start` reports the output
//! format, every frame presented to the input surface (or every queued
//! audio chunk) becomes one encoded buffer, and end of input becomes an
//! end-of-stream buffer. Tests reach into the shared state through the
//! handles the backend keeps.

use crate::config::{AudioSpec, Size};
use crate::constants::VIDEO_MIME_AVC;
use crate::errors::{GpuResult, MediaError, MediaResult};
use crate::gpu::SurfaceTarget;
use crate::media::{
    AudioCapture, BufferInfo, ContainerMuxer, EncoderOutput, HardwareEncoder, MediaBackend,
    MediaFormat,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct EncoderState {
    pub format: Option<MediaFormat>,
    pub outputs: VecDeque<EncoderOutput>,
    pub next_index: usize,
    pub queued_inputs: Vec<Vec<u8>>,
    pub presented: Vec<Size>,
    pub released_outputs: usize,
    pub key_frame_requests: u32,
    pub end_of_input: bool,
    pub stopped: bool,
    pub released: u32,
}

impl EncoderState {
    fn push_buffer(&mut self, data: Vec<u8>, end_of_stream: bool) {
        let index = self.next_index;
        self.next_index += 1;
        let info = BufferInfo {
            offset: 0,
            size: data.len(),
            presentation_time_us: 1 + index as i64,
            key_frame: index == 0,
            end_of_stream,
        };
        self.outputs.push_back(EncoderOutput::Buffer { index, data, info });
    }
}

/// Test access to an encoder created by [`MockBackend`]
#[derive(Clone, Default)]
pub struct EncoderHandle(pub Arc<Mutex<EncoderState>>);

impl EncoderHandle {
    pub fn state(&self) -> std::sync::MutexGuard<'_, EncoderState> {
        self.0.lock().unwrap()
    }

    pub fn push(&self, output: EncoderOutput) {
        self.state().outputs.push_back(output);
    }
}

pub struct MockEncoder {
    handle: EncoderHandle,
}

impl HardwareEncoder for MockEncoder {
    fn configure(&mut self, format: &MediaFormat) -> MediaResult<()> {
        self.handle.state().format = Some(format.clone());
        Ok(())
    }

    fn create_input_surface(&mut self) -> MediaResult<Arc<dyn SurfaceTarget>> {
        let size = self
            .handle
            .state()
            .format
            .as_ref()
            .map(MediaFormat::size)
            .ok_or_else(|| MediaError::Configure("not configured".into()))?;
        Ok(Arc::new(MockSurface {
            size,
            encoder: self.handle.clone(),
        }))
    }

    fn start(&mut self) -> MediaResult<()> {
        let mut state = self.handle.state();
        let format = state.format.clone().unwrap_or_default().with_caps("mock");
        state.outputs.push_back(EncoderOutput::FormatChanged(format));
        Ok(())
    }

    fn dequeue_input_buffer(&mut self) -> MediaResult<Option<usize>> {
        Ok(Some(0))
    }

    fn queue_input_buffer(&mut self, _index: usize, data: &[u8], _pts: i64) -> MediaResult<()> {
        let mut state = self.handle.state();
        state.queued_inputs.push(data.to_vec());
        state.push_buffer(data.to_vec(), false);
        Ok(())
    }

    fn dequeue_output(&mut self) -> MediaResult<EncoderOutput> {
        Ok(self
            .handle
            .state()
            .outputs
            .pop_front()
            .unwrap_or(EncoderOutput::TryAgainLater))
    }

    fn release_output_buffer(&mut self, _index: usize) -> MediaResult<()> {
        self.handle.state().released_outputs += 1;
        Ok(())
    }

    fn request_key_frame(&mut self) -> MediaResult<()> {
        self.handle.state().key_frame_requests += 1;
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> MediaResult<()> {
        let mut state = self.handle.state();
        state.end_of_input = true;
        state.push_buffer(Vec::new(), true);
        Ok(())
    }

    fn stop(&mut self) -> MediaResult<()> {
        self.handle.state().stopped = true;
        Ok(())
    }

    fn release(&mut self) {
        self.handle.state().released += 1;
    }
}

/// Encoder input surface; every presented frame becomes an encoded buffer
pub struct MockSurface {
    size: Size,
    encoder: EncoderHandle,
}

impl SurfaceTarget for MockSurface {
    fn size(&self) -> Size {
        self.size
    }

    fn present(&self, pixels: &[u8], size: Size) -> GpuResult<()> {
        let mut state = self.encoder.state();
        if state.end_of_input {
            return Ok(());
        }
        state.presented.push(size);
        let digest = pixels.iter().take(8).copied().collect();
        state.push_buffer(digest, false);
        Ok(())
    }
}

#[derive(Default)]
pub struct CaptureState {
    pub recording: bool,
    pub starts: u32,
    pub reads: u32,
    /// Chunks returned by successive reads; empty reads return no data
    pub chunks: VecDeque<Vec<u8>>,
    pub released: u32,
}

#[derive(Clone, Default)]
pub struct CaptureHandle(pub Arc<Mutex<CaptureState>>);

impl CaptureHandle {
    pub fn state(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.0.lock().unwrap()
    }
}

pub struct MockCapture {
    handle: CaptureHandle,
}

impl AudioCapture for MockCapture {
    fn start(&mut self) -> MediaResult<()> {
        let mut state = self.handle.state();
        state.recording = true;
        state.starts += 1;
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.handle.state().recording
    }

    fn read(&mut self, buf: &mut [u8]) -> MediaResult<usize> {
        let mut state = self.handle.state();
        state.reads += 1;
        match state.chunks.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn stop(&mut self) -> MediaResult<()> {
        self.handle.state().recording = false;
        Ok(())
    }

    fn release(&mut self) {
        self.handle.state().released += 1;
    }
}

#[derive(Default)]
pub struct MuxLog {
    pub output: Option<PathBuf>,
    pub tracks: Vec<MediaFormat>,
    pub started: u32,
    pub samples: Vec<(usize, usize, i64)>,
    pub stopped: u32,
    pub released: u32,
}

#[derive(Clone, Default)]
pub struct MuxHandle(pub Arc<Mutex<MuxLog>>);

impl MuxHandle {
    pub fn log(&self) -> std::sync::MutexGuard<'_, MuxLog> {
        self.0.lock().unwrap()
    }

    pub fn video_samples(&self) -> usize {
        let log = self.log();
        let video = log.tracks.iter().position(|t| t.mime == VIDEO_MIME_AVC);
        log.samples
            .iter()
            .filter(|(track, _, _)| Some(*track) == video)
            .count()
    }
}

pub struct MockMuxer {
    handle: MuxHandle,
}

impl ContainerMuxer for MockMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> MediaResult<usize> {
        let mut log = self.handle.log();
        log.tracks.push(format.clone());
        Ok(log.tracks.len() - 1)
    }

    fn start(&mut self) -> MediaResult<()> {
        self.handle.log().started += 1;
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> MediaResult<()> {
        self.handle
            .log()
            .samples
            .push((track, data.len(), info.presentation_time_us));
        Ok(())
    }

    fn stop(&mut self) -> MediaResult<()> {
        self.handle.log().stopped += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.handle.log().released += 1;
    }
}

/// Backend whose every product can be inspected after the fact
#[derive(Default)]
pub struct MockBackend {
    pub encoders: Mutex<Vec<(String, EncoderHandle)>>,
    pub captures: Mutex<Vec<CaptureHandle>>,
    pub muxers: Mutex<Vec<MuxHandle>>,
    /// Audio chunks every new capture starts with
    pub audio_chunks: Vec<Vec<u8>>,
    pub fail_capture: bool,
}

impl MockBackend {
    pub fn encoder(&self, mime: &str) -> Option<EncoderHandle> {
        self.encoders
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(m, _)| m == mime)
            .map(|(_, h)| h.clone())
    }

    pub fn muxer(&self) -> Option<MuxHandle> {
        self.muxers.lock().unwrap().last().cloned()
    }

    pub fn capture(&self) -> Option<CaptureHandle> {
        self.captures.lock().unwrap().last().cloned()
    }
}

impl MediaBackend for MockBackend {
    fn create_encoder(&self, mime: &str) -> MediaResult<Box<dyn HardwareEncoder>> {
        let handle = EncoderHandle::default();
        self.encoders
            .lock()
            .unwrap()
            .push((mime.to_string(), handle.clone()));
        Ok(Box::new(MockEncoder { handle }))
    }

    fn create_audio_capture(&self, _spec: &AudioSpec) -> MediaResult<Box<dyn AudioCapture>> {
        if self.fail_capture {
            return Err(MediaError::Capture("no microphone".into()));
        }
        let handle = CaptureHandle::default();
        handle.state().chunks = self.audio_chunks.iter().cloned().collect();
        self.captures.lock().unwrap().push(handle.clone());
        Ok(Box::new(MockCapture { handle }))
    }

    fn create_muxer(&self, output: &Path) -> MediaResult<Box<dyn ContainerMuxer>> {
        let handle = MuxHandle::default();
        handle.log().output = Some(output.to_path_buf());
        self.muxers.lock().unwrap().push(handle.clone());
        Ok(Box::new(MockMuxer { handle }))
    }
}
