// SPDX-License-Identifier: MPL-2.0

//! Shared access to the container muxer
//!
//! The video and audio drain loops both write into one container. A
//! container cannot accept samples until every track it will hold has been
//! registered, so the synchronizer starts the muxer exactly once: when the
//! video track and, for sessions with audio, the audio track are known.
//! Registration and writes serialize on one async mutex.

use crate::errors::{RecordingError, RecordingResult};
use crate::media::{BufferInfo, ContainerMuxer, MediaFormat, TrackKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

struct MuxState {
    muxer: Option<Box<dyn ContainerMuxer>>,
    video_track: Option<usize>,
    audio_track: Option<usize>,
}

struct Shared {
    state: Mutex<MuxState>,
    audio_expected: bool,
    started: AtomicBool,
    written: AtomicU64,
}

/// Track-registration barrier in front of a [`ContainerMuxer`]
#[derive(Clone)]
pub struct MuxSynchronizer {
    shared: Arc<Shared>,
}

impl MuxSynchronizer {
    /// Wrap `muxer`; `audio_expected` decides whether an audio track must
    /// be registered before the container starts
    pub fn new(muxer: Box<dyn ContainerMuxer>, audio_expected: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MuxState {
                    muxer: Some(muxer),
                    video_track: None,
                    audio_track: None,
                }),
                audio_expected,
                started: AtomicBool::new(false),
                written: AtomicU64::new(0),
            }),
        }
    }

    /// True once every expected track is registered and the container started
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn audio_expected(&self) -> bool {
        self.shared.audio_expected
    }

    /// Number of samples handed to the container so far
    pub fn samples_written(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }

    /// Register a track and start the container if it was the last one
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The container is running after this call
    /// * `Ok(false)` - Still waiting for another track
    /// * `Err(_)` - The kind was already registered, the container already
    ///   started, or the muxer rejected the format
    pub async fn add_track(&self, kind: TrackKind, format: MediaFormat) -> RecordingResult<bool> {
        let mut state = self.shared.state.lock().await;

        if self.is_started() {
            return Err(RecordingError::TrackRegistration(format!(
                "{} track added after the container started",
                kind
            )));
        }
        if kind == TrackKind::Audio && !self.shared.audio_expected {
            return Err(RecordingError::TrackRegistration(
                "audio track added to a video-only session".to_string(),
            ));
        }

        let registered = match kind {
            TrackKind::Video => state.video_track,
            TrackKind::Audio => state.audio_track,
        };
        if registered.is_some() {
            return Err(RecordingError::TrackRegistration(format!(
                "{} track registered twice",
                kind
            )));
        }

        let muxer = state.muxer.as_mut().ok_or_else(|| {
            RecordingError::TrackRegistration("muxer already released".to_string())
        })?;
        let index = muxer.add_track(&format)?;
        info!(%kind, index, mime = %format.mime, "Registered track");

        match kind {
            TrackKind::Video => state.video_track = Some(index),
            TrackKind::Audio => state.audio_track = Some(index),
        }

        let ready = state.video_track.is_some()
            && (!self.shared.audio_expected || state.audio_track.is_some());
        if ready {
            if let Some(muxer) = state.muxer.as_mut() {
                muxer.start()?;
            }
            self.shared.started.store(true, Ordering::SeqCst);
            info!("All tracks registered, container started");
        }
        Ok(ready)
    }

    /// Write one encoded sample
    ///
    /// Samples arriving before the container started are dropped. Write
    /// failures are logged and the sample is lost.
    pub async fn write(&self, kind: TrackKind, data: &[u8], info: &BufferInfo) {
        if !self.is_started() {
            debug!(%kind, "Dropping sample written before the container started");
            return;
        }

        let mut state = self.shared.state.lock().await;
        let track = match kind {
            TrackKind::Video => state.video_track,
            TrackKind::Audio => state.audio_track,
        };
        let (Some(track), Some(muxer)) = (track, state.muxer.as_mut()) else {
            debug!(%kind, "Dropping sample for a missing track");
            return;
        };

        match muxer.write_sample(track, data, info) {
            Ok(()) => {
                self.shared.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(%kind, error = %e, pts = info.presentation_time_us, "Failed to write sample");
            }
        }
    }

    /// Finalize and release the container
    ///
    /// Idempotent. A container that never started is released without being
    /// finalized. Returns whether a finished container was written.
    pub async fn release(&self) -> bool {
        let muxer = self.shared.state.lock().await.muxer.take();
        let Some(mut muxer) = muxer else {
            return false;
        };

        let started = self.shared.started.swap(false, Ordering::SeqCst);
        // Finalizing can block on file I/O
        let finished = tokio::task::spawn_blocking(move || {
            let mut finished = false;
            if started {
                match muxer.stop() {
                    Ok(()) => finished = true,
                    Err(e) => error!(error = %e, "Failed to finalize container"),
                }
            }
            // An unstarted container still holds its output file and pipeline
            muxer.release();
            finished
        })
        .await;

        match finished {
            Ok(finished) => {
                debug!(finished, "Muxer released");
                finished
            }
            Err(e) => {
                error!(error = %e, "Muxer release task failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MediaResult;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Log {
        tracks: Vec<String>,
        started: u32,
        samples: Vec<(usize, Vec<u8>)>,
        stopped: u32,
        released: u32,
    }

    struct RecordingMuxer(Arc<StdMutex<Log>>);

    impl ContainerMuxer for RecordingMuxer {
        fn add_track(&mut self, format: &MediaFormat) -> MediaResult<usize> {
            let mut log = self.0.lock().unwrap();
            log.tracks.push(format.mime.clone());
            Ok(log.tracks.len() - 1)
        }
        fn start(&mut self) -> MediaResult<()> {
            self.0.lock().unwrap().started += 1;
            Ok(())
        }
        fn write_sample(&mut self, track: usize, data: &[u8], _: &BufferInfo) -> MediaResult<()> {
            self.0.lock().unwrap().samples.push((track, data.to_vec()));
            Ok(())
        }
        fn stop(&mut self) -> MediaResult<()> {
            self.0.lock().unwrap().stopped += 1;
            Ok(())
        }
        fn release(&mut self) {
            self.0.lock().unwrap().released += 1;
        }
    }

    fn synchronizer(audio: bool) -> (MuxSynchronizer, Arc<StdMutex<Log>>) {
        let log = Arc::new(StdMutex::new(Log::default()));
        let mux = MuxSynchronizer::new(Box::new(RecordingMuxer(Arc::clone(&log))), audio);
        (mux, log)
    }

    fn format(mime: &str) -> MediaFormat {
        MediaFormat {
            mime: mime.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_starts_after_last_expected_track() {
        let (mux, log) = synchronizer(true);

        assert!(!mux.add_track(TrackKind::Video, format("video/avc")).await.unwrap());
        assert!(!mux.is_started());
        assert_eq!(log.lock().unwrap().started, 0);

        assert!(mux.add_track(TrackKind::Audio, format("audio/mp4a-latm")).await.unwrap());
        assert!(mux.is_started());
        assert_eq!(log.lock().unwrap().started, 1);
    }

    #[tokio::test]
    async fn test_video_only_starts_immediately() {
        let (mux, _log) = synchronizer(false);
        assert!(mux.add_track(TrackKind::Video, format("video/avc")).await.unwrap());
        assert!(mux.is_started());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (mux, _log) = synchronizer(true);
        mux.add_track(TrackKind::Video, format("video/avc")).await.unwrap();
        let err = mux
            .add_track(TrackKind::Video, format("video/avc"))
            .await
            .unwrap_err();
        assert!(matches!(err, RecordingError::TrackRegistration(_)));
    }

    #[tokio::test]
    async fn test_writes_before_start_are_dropped() {
        let (mux, log) = synchronizer(true);
        let info = BufferInfo {
            size: 3,
            ..Default::default()
        };

        mux.add_track(TrackKind::Video, format("video/avc")).await.unwrap();
        mux.write(TrackKind::Video, &[1, 2, 3], &info).await;
        assert!(log.lock().unwrap().samples.is_empty());

        mux.add_track(TrackKind::Audio, format("audio/mp4a-latm")).await.unwrap();
        mux.write(TrackKind::Audio, &[4, 5, 6], &info).await;
        assert_eq!(log.lock().unwrap().samples, vec![(1, vec![4, 5, 6])]);
        assert_eq!(mux.samples_written(), 1);
    }

    #[tokio::test]
    async fn test_release_only_finalizes_started_container() {
        let (mux, log) = synchronizer(true);
        mux.add_track(TrackKind::Video, format("video/avc")).await.unwrap();

        assert!(!mux.release().await);
        assert!(!mux.release().await);
        assert!(!mux.is_started());
        let log = log.lock().unwrap();
        assert_eq!(log.started, 0);
        assert_eq!(log.stopped, 0);
        // Resources are freed once even though nothing was finalized
        assert_eq!(log.released, 1);
    }

    #[tokio::test]
    async fn test_release_finalizes_once() {
        let (mux, log) = synchronizer(false);
        mux.add_track(TrackKind::Video, format("video/avc")).await.unwrap();

        assert!(mux.release().await);
        assert!(!mux.release().await);
        let log = log.lock().unwrap();
        assert_eq!(log.stopped, 1);
        assert_eq!(log.released, 1);
    }
}
