// SPDX-License-Identifier: MPL-2.0

//! Recording session pipeline
//!
//! A [`Recorder`] owns the encoders and the muxer for one output file:
//!
//! ```text
//!  video sink ──► encoder surface ──► VideoEncoderWrapper ─┐
//!                                                          ├─► MuxSynchronizer ──► file
//!  audio capture ─────────────────► AudioEncoderWrapper ───┘
//! ```
//!
//! Each encoder is drained by its own tokio task. The tasks never block;
//! they meet only at the muxer's lock. The video loop is the master: when
//! it ends, for end-of-stream or an error, audio stops too.

use super::encoder::{AudioEncoderWrapper, DrainStatus, VideoEncoderWrapper};
use super::muxer::MuxSynchronizer;
use crate::config::{RecordingSession, Size};
use crate::constants::timing;
use crate::errors::{RecordingError, RecordingResult};
use crate::gpu::SurfaceTarget;
use crate::media::{MediaBackend, TrackKind};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

enum TrackEncoder {
    Video(VideoEncoderWrapper),
    Audio(AudioEncoderWrapper),
}

impl TrackEncoder {
    fn kind(&self) -> TrackKind {
        match self {
            TrackEncoder::Video(_) => TrackKind::Video,
            TrackEncoder::Audio(_) => TrackKind::Audio,
        }
    }

    fn poll_interval(&self) -> Duration {
        match self {
            TrackEncoder::Video(_) => timing::VIDEO_POLL_INTERVAL,
            TrackEncoder::Audio(_) => timing::AUDIO_POLL_INTERVAL,
        }
    }

    async fn drain(&mut self) -> RecordingResult<DrainStatus> {
        match self {
            TrackEncoder::Video(video) => video.drain().await,
            TrackEncoder::Audio(audio) => audio.drain().await,
        }
    }

    fn signal_end_of_input(&mut self) -> RecordingResult<()> {
        match self {
            TrackEncoder::Video(video) => video.signal_end_of_input(),
            TrackEncoder::Audio(audio) => audio.signal_end_of_input(),
        }
    }

    /// Flush buffered output into the container
    async fn finish(&mut self) {
        let kind = self.kind();
        if let Err(e) = self.signal_end_of_input() {
            warn!(%kind, error = %e, "Failed to signal end of input");
            return;
        }

        let deadline = Instant::now() + timing::EOS_TIMEOUT;
        loop {
            if Instant::now() >= deadline {
                warn!(%kind, "Timed out waiting for encoder end of stream");
                return;
            }
            match self.drain().await {
                Ok(DrainStatus::Finished) => return,
                Ok(DrainStatus::Progress) => tokio::task::yield_now().await,
                Ok(DrainStatus::Idle) => tokio::time::sleep(self.poll_interval()).await,
                Err(e) => {
                    warn!(%kind, error = %e, "Encoder flush failed");
                    return;
                }
            }
        }
    }

    fn release(&mut self) {
        match self {
            TrackEncoder::Video(video) => video.release(),
            TrackEncoder::Audio(audio) => audio.release(),
        }
    }
}

struct LoopOutcome {
    encoder: TrackEncoder,
    result: RecordingResult<()>,
    /// The encoder already delivered end-of-stream
    finished: bool,
}

async fn run_drain_loop(mut encoder: TrackEncoder, writing: Arc<AtomicBool>) -> LoopOutcome {
    let kind = encoder.kind();
    let master = kind == TrackKind::Video;
    debug!(%kind, "Drain loop started");

    let mut finished = false;
    let result = loop {
        if !writing.load(Ordering::SeqCst) {
            break Ok(());
        }
        match encoder.drain().await {
            Ok(DrainStatus::Progress) => tokio::task::yield_now().await,
            Ok(DrainStatus::Idle) => tokio::time::sleep(encoder.poll_interval()).await,
            Ok(DrainStatus::Finished) => {
                finished = true;
                if master {
                    writing.store(false, Ordering::SeqCst);
                }
                break Ok(());
            }
            Err(e) => {
                error!(%kind, error = %e, "Drain loop terminated");
                if master {
                    writing.store(false, Ordering::SeqCst);
                }
                break Err(e);
            }
        }
    };

    debug!(%kind, finished, "Drain loop exited");
    LoopOutcome {
        encoder,
        result,
        finished,
    }
}

/// Encoders, drain loops and muxer for one output file
pub struct Recorder {
    output: PathBuf,
    size: Size,
    input_surface: Arc<dyn SurfaceTarget>,
    muxer: MuxSynchronizer,
    /// The video sink draws into the input surface while set
    running: Arc<AtomicBool>,
    /// The drain loops keep going while set
    writing: Arc<AtomicBool>,
    idle: Vec<TrackEncoder>,
    loops: Vec<JoinHandle<LoopOutcome>>,
    released: bool,
}

impl Recorder {
    /// Build the pipeline for `session` with the video resolved to `size`
    ///
    /// If the session asks for audio but no capture device can be opened,
    /// the recording continues video-only.
    pub fn new(
        backend: &dyn MediaBackend,
        session: &RecordingSession,
        size: Size,
    ) -> RecordingResult<Self> {
        info!(
            output = %session.output.display(),
            %size,
            bitrate = session.video.bitrate,
            audio = session.audio.is_some(),
            "Creating recorder"
        );

        let capture = match &session.audio {
            Some(spec) => match backend.create_audio_capture(spec) {
                Ok(capture) => Some((spec, capture)),
                Err(e) => {
                    warn!(error = %e, "Audio capture unavailable, recording video only");
                    None
                }
            },
            None => None,
        };

        let muxer = MuxSynchronizer::new(backend.create_muxer(&session.output)?, capture.is_some());

        let audio = match capture {
            Some((spec, capture)) => Some(AudioEncoderWrapper::new(
                backend,
                spec,
                capture,
                muxer.clone(),
            )?),
            None => None,
        };

        let video = VideoEncoderWrapper::new(backend, size, session.video.bitrate, muxer.clone())?;
        let input_surface = video.input_surface();

        let mut idle = vec![TrackEncoder::Video(video)];
        if let Some(audio) = audio {
            idle.push(TrackEncoder::Audio(audio));
        }

        Ok(Self {
            output: session.output.clone(),
            size,
            input_surface,
            muxer,
            running: Arc::new(AtomicBool::new(false)),
            writing: Arc::new(AtomicBool::new(false)),
            idle,
            loops: Vec::new(),
            released: false,
        })
    }

    /// Surface the video sink should render into
    pub fn input_surface(&self) -> Arc<dyn SurfaceTarget> {
        Arc::clone(&self.input_surface)
    }

    /// Resolved video size
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn has_audio(&self) -> bool {
        self.muxer.audio_expected()
    }

    /// True between `start` and `release`
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the drain loops on `runtime`
    pub fn start(&mut self, runtime: &Handle) {
        if self.released || !self.loops.is_empty() {
            return;
        }

        self.writing.store(true, Ordering::SeqCst);
        for encoder in self.idle.drain(..) {
            let writing = Arc::clone(&self.writing);
            self.loops.push(runtime.spawn(run_drain_loop(encoder, writing)));
        }
        self.running.store(true, Ordering::SeqCst);
        info!(output = %self.output.display(), "Recording started");
    }

    /// Stop the loops, flush and release the encoders, then finalize the file
    ///
    /// Resolves to the output path, or to the first error a drain loop hit.
    pub async fn release(mut self) -> RecordingResult<PathBuf> {
        self.released = true;
        self.running.store(false, Ordering::SeqCst);
        self.writing.store(false, Ordering::SeqCst);

        let mut first_error: Option<RecordingError> = None;
        // (encoder, needs flush); encoders that never ran have nothing buffered
        let mut encoders: Vec<(TrackEncoder, bool)> =
            self.idle.drain(..).map(|encoder| (encoder, false)).collect();

        for joined in join_all(self.loops.drain(..)).await {
            match joined {
                Ok(outcome) => {
                    if let Err(e) = outcome.result {
                        first_error.get_or_insert(e);
                    }
                    encoders.push((outcome.encoder, !outcome.finished));
                }
                Err(e) => {
                    error!(error = %e, "Drain loop task failed");
                    first_error.get_or_insert(e.into());
                }
            }
        }

        // Video first, then audio, then the container
        encoders.sort_by_key(|(encoder, _)| encoder.kind() != TrackKind::Video);
        for (encoder, needs_flush) in encoders.iter_mut() {
            if *needs_flush {
                encoder.finish().await;
            }
            encoder.release();
        }

        let samples = self.muxer.samples_written();
        let finalized = self.muxer.release().await;
        if finalized {
            info!(output = %self.output.display(), samples, "Recording finalized");
        } else {
            warn!(output = %self.output.display(), "Recording ended before the container started");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(self.output.clone()),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if !self.released {
            debug!(output = %self.output.display(), "Recorder dropped without release");
            self.running.store(false, Ordering::SeqCst);
            self.writing.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioSpec, VideoSpec};
    use crate::constants::{AUDIO_MIME_AAC, VIDEO_MIME_AVC};
    use crate::media::testing::MockBackend;
    use crate::media::{EncoderOutput, MediaFormat};

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn session(audio: bool) -> RecordingSession {
        let session = RecordingSession::new("/tmp/recorder-test.mp4").with_video(VideoSpec::default());
        if audio {
            session.with_audio(AudioSpec::default())
        } else {
            session
        }
    }

    #[tokio::test]
    async fn test_video_only_recording() {
        let backend = MockBackend::default();
        let mut recorder = Recorder::new(&backend, &session(false), Size::new(64, 48)).unwrap();
        assert!(!recorder.is_running());

        recorder.start(&Handle::current());
        assert!(recorder.is_running());

        let surface = recorder.input_surface();
        for _ in 0..3 {
            surface.present(&[7; 16], Size::new(64, 48)).unwrap();
        }

        let mux = backend.muxer().unwrap();
        wait_until(|| mux.video_samples() == 3).await;

        let output = recorder.release().await.unwrap();
        assert_eq!(output, PathBuf::from("/tmp/recorder-test.mp4"));

        let video = backend.encoder(VIDEO_MIME_AVC).unwrap();
        let state = video.state();
        assert_eq!(state.key_frame_requests, 1);
        assert!(state.end_of_input);
        assert!(state.stopped);
        assert_eq!(state.released, 1);
        assert_eq!(state.format.as_ref().map(MediaFormat::size), Some(Size::new(64, 48)));

        let log = mux.log();
        assert_eq!(log.tracks.len(), 1);
        assert_eq!(log.started, 1);
        assert_eq!(log.stopped, 1);
        assert_eq!(log.released, 1);
    }

    #[tokio::test]
    async fn test_audio_session_waits_for_both_tracks() {
        let backend = MockBackend {
            audio_chunks: vec![vec![1; 64], Vec::new(), vec![2; 64]],
            ..Default::default()
        };
        let mut recorder = Recorder::new(&backend, &session(true), Size::new(32, 32)).unwrap();
        assert!(recorder.has_audio());
        recorder.start(&Handle::current());

        let mux = backend.muxer().unwrap();
        let audio = backend.encoder(AUDIO_MIME_AAC).unwrap();
        wait_until(|| mux.log().started == 1).await;
        wait_until(|| audio.state().queued_inputs.len() == 2).await;

        assert_eq!(mux.log().tracks.len(), 2);
        assert_eq!(audio.state().queued_inputs[1], vec![2; 64]);
        assert!(backend.capture().unwrap().state().starts >= 1);

        recorder.release().await.unwrap();
        assert_eq!(audio.state().released, 1);
        assert_eq!(backend.capture().unwrap().state().released, 1);
    }

    #[tokio::test]
    async fn test_missing_capture_falls_back_to_video_only() {
        let backend = MockBackend {
            fail_capture: true,
            ..Default::default()
        };
        let recorder = Recorder::new(&backend, &session(true), Size::new(32, 32)).unwrap();
        assert!(!recorder.has_audio());
        assert!(backend.encoder(AUDIO_MIME_AAC).is_none());
        recorder.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_format_change_ends_session_with_error() {
        let backend = MockBackend::default();
        let mut recorder = Recorder::new(&backend, &session(false), Size::new(32, 32)).unwrap();
        recorder.start(&Handle::current());

        let mux = backend.muxer().unwrap();
        wait_until(|| mux.log().started == 1).await;

        let video = backend.encoder(VIDEO_MIME_AVC).unwrap();
        video.push(EncoderOutput::FormatChanged(MediaFormat::default()));
        wait_until(|| video.state().outputs.is_empty()).await;

        let err = recorder.release().await.unwrap_err();
        assert_eq!(err, RecordingError::DuplicateFormatChange(TrackKind::Video));
        // The container that did start is still finalized
        assert_eq!(mux.log().stopped, 1);
    }

    #[tokio::test]
    async fn test_release_without_start() {
        let backend = MockBackend::default();
        let recorder = Recorder::new(&backend, &session(false), Size::new(32, 32)).unwrap();
        recorder.release().await.unwrap();

        let video = backend.encoder(VIDEO_MIME_AVC).unwrap();
        assert_eq!(video.state().released, 1);
        assert!(!video.state().end_of_input);
        let mux = backend.muxer().unwrap();
        assert_eq!(mux.log().stopped, 0);
        assert_eq!(mux.log().released, 1);
    }
}
