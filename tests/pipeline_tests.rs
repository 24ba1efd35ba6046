// SPDX-License-Identifier: MPL-2.0

//! End-to-end tests: test pattern camera through the distributor into the
//! analysis sink and a recording session

use camera_fanout::backends::{SoftwareGraphics, TestPatternCamera, TextureStore};
use camera_fanout::config::AudioSpec;
use camera_fanout::errors::{GpuResult, MediaError, MediaResult};
use camera_fanout::gpu::transform::IDENTITY;
use camera_fanout::gpu::{GraphicsContext, SurfaceTarget};
use camera_fanout::media::{
    AudioCapture, BufferInfo, ContainerMuxer, EncoderOutput, HardwareEncoder, MediaBackend,
    MediaFormat,
};
use camera_fanout::{
    AnalysisImage, Analyzer, DistributorConfig, FrameDistributor, RecordingController,
    RecordingSession, RecordingState, Rotation, Size, SourceInfo, VideoSpec,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;

#[derive(Default)]
struct EncoderLog {
    format: Option<MediaFormat>,
    outputs: VecDeque<EncoderOutput>,
    frames: usize,
    ended: bool,
}

impl EncoderLog {
    fn push(&mut self, data: Vec<u8>, end_of_stream: bool) {
        let index = self.frames;
        self.frames += 1;
        let info = BufferInfo {
            offset: 0,
            size: data.len(),
            presentation_time_us: 1 + index as i64,
            key_frame: index == 0,
            end_of_stream,
        };
        self.outputs
            .push_back(EncoderOutput::Buffer { index, data, info });
    }
}

/// One encoded buffer per presented frame
struct FrameCountingEncoder(Arc<Mutex<EncoderLog>>);

struct EncoderSurface {
    size: Size,
    log: Arc<Mutex<EncoderLog>>,
}

impl SurfaceTarget for EncoderSurface {
    fn size(&self) -> Size {
        self.size
    }

    fn present(&self, pixels: &[u8], size: Size) -> GpuResult<()> {
        assert_eq!(size, self.size);
        let mut log = self.log.lock().unwrap();
        if !log.ended {
            log.push(pixels[..4].to_vec(), false);
        }
        Ok(())
    }
}

impl HardwareEncoder for FrameCountingEncoder {
    fn configure(&mut self, format: &MediaFormat) -> MediaResult<()> {
        self.0.lock().unwrap().format = Some(format.clone());
        Ok(())
    }

    fn create_input_surface(&mut self) -> MediaResult<Arc<dyn SurfaceTarget>> {
        let size = self.0.lock().unwrap().format.as_ref().unwrap().size();
        Ok(Arc::new(EncoderSurface {
            size,
            log: self.0.clone(),
        }))
    }

    fn start(&mut self) -> MediaResult<()> {
        let mut log = self.0.lock().unwrap();
        let format = log.format.clone().unwrap();
        log.outputs.push_back(EncoderOutput::FormatChanged(format));
        Ok(())
    }

    fn dequeue_input_buffer(&mut self) -> MediaResult<Option<usize>> {
        Ok(None)
    }

    fn queue_input_buffer(&mut self, _: usize, _: &[u8], _: i64) -> MediaResult<()> {
        Ok(())
    }

    fn dequeue_output(&mut self) -> MediaResult<EncoderOutput> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .outputs
            .pop_front()
            .unwrap_or(EncoderOutput::TryAgainLater))
    }

    fn release_output_buffer(&mut self, _: usize) -> MediaResult<()> {
        Ok(())
    }

    fn request_key_frame(&mut self) -> MediaResult<()> {
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> MediaResult<()> {
        let mut log = self.0.lock().unwrap();
        log.ended = true;
        log.push(Vec::new(), true);
        Ok(())
    }

    fn stop(&mut self) -> MediaResult<()> {
        Ok(())
    }

    fn release(&mut self) {}
}

#[derive(Default)]
struct ContainerLog {
    tracks: Vec<MediaFormat>,
    samples: Vec<Vec<u8>>,
    started: bool,
    stopped: bool,
}

struct RecordingMuxer(Arc<Mutex<ContainerLog>>);

impl ContainerMuxer for RecordingMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> MediaResult<usize> {
        let mut log = self.0.lock().unwrap();
        log.tracks.push(format.clone());
        Ok(log.tracks.len() - 1)
    }

    fn start(&mut self) -> MediaResult<()> {
        self.0.lock().unwrap().started = true;
        Ok(())
    }

    fn write_sample(&mut self, _track: usize, data: &[u8], info: &BufferInfo) -> MediaResult<()> {
        let payload = info.payload(data).unwrap().to_vec();
        self.0.lock().unwrap().samples.push(payload);
        Ok(())
    }

    fn stop(&mut self) -> MediaResult<()> {
        self.0.lock().unwrap().stopped = true;
        Ok(())
    }

    fn release(&mut self) {}
}

#[derive(Default)]
struct Backend {
    encoder: Arc<Mutex<EncoderLog>>,
    container: Arc<Mutex<ContainerLog>>,
}

impl MediaBackend for Backend {
    fn create_encoder(&self, _mime: &str) -> MediaResult<Box<dyn HardwareEncoder>> {
        Ok(Box::new(FrameCountingEncoder(self.encoder.clone())))
    }

    fn create_audio_capture(&self, _spec: &AudioSpec) -> MediaResult<Box<dyn AudioCapture>> {
        Err(MediaError::Unavailable("no microphone".into()))
    }

    fn create_muxer(&self, _output: &Path) -> MediaResult<Box<dyn ContainerMuxer>> {
        Ok(Box::new(RecordingMuxer(self.container.clone())))
    }
}

fn source() -> SourceInfo {
    SourceInfo {
        resolution: Size::new(32, 16),
        rotation: Rotation::Deg0,
        sensor_orientation: Rotation::Deg0,
    }
}

fn start_distributor(
    store: &TextureStore,
    backend: Arc<dyn MediaBackend>,
    config: DistributorConfig,
) -> FrameDistributor {
    let store = store.clone();
    FrameDistributor::new(
        move || {
            let ctx: Box<dyn GraphicsContext> = Box::new(SoftwareGraphics::new(store));
            Ok(ctx)
        },
        backend,
        config,
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pattern_camera_feeds_analysis() {
    let store = TextureStore::new();
    let dist = start_distributor(
        &store,
        Arc::new(Backend::default()),
        DistributorConfig::default(),
    );

    let seen: Arc<Mutex<Vec<(Size, [u8; 4])>>> = Arc::default();
    let sink = seen.clone();
    let analyzer: Analyzer = Arc::new(move |image: AnalysisImage| {
        let first = [image.data()[0], image.data()[1], image.data()[2], image.data()[3]];
        sink.lock().unwrap().push((image.size(), first));
    });
    let binding = dist.attach_source(source(), Some(analyzer)).await.unwrap();
    let gate = binding.analysis.clone().unwrap();

    let mut camera = TestPatternCamera::start(
        store,
        binding.texture,
        binding.buffer_size,
        dist.clone(),
        Duration::ZERO,
        Some(5),
    );
    tokio::task::spawn_blocking(move || camera.join())
        .await
        .unwrap();
    dist.flush().await.unwrap();

    // Pixel buffers lag by one frame
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    for (size, pixel) in seen.iter() {
        assert_eq!(*size, Size::new(32, 16));
        assert_eq!(pixel[3], 255);
    }
    assert_eq!(gate.delivered(), 4);
    assert_eq!(gate.dropped(), 0);
    drop(seen);

    dist.release().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recording_session_end_to_end() {
    let store = TextureStore::new();
    let backend = Arc::new(Backend::default());
    let dist = start_distributor(&store, backend.clone(), DistributorConfig::default());
    let binding = dist.attach_source(source(), None).await.unwrap();
    store
        .fill(binding.texture, binding.buffer_size, [0, 0, 255, 255])
        .unwrap();

    let controller = RecordingController::new(Handle::current());
    dist.connect_recorder(controller.clone());
    let mut state = controller.subscribe();

    let session = RecordingSession::new("/tmp/pipeline-test.mp4")
        .with_video(VideoSpec::matching(1_000_000));
    controller.start(session);
    state
        .wait_for(|s| *s == RecordingState::Running)
        .await
        .unwrap();

    for ts in 0..6 {
        dist.on_frame_available(IDENTITY, ts).unwrap();
    }
    dist.flush().await.unwrap();

    let output = controller.stop().await.unwrap();
    assert_eq!(output, Some(PathBuf::from("/tmp/pipeline-test.mp4")));
    assert_eq!(controller.state(), RecordingState::Stopped);

    let encoder = backend.encoder.lock().unwrap();
    assert_eq!(
        encoder.format.as_ref().map(MediaFormat::size),
        Some(Size::new(32, 16))
    );
    drop(encoder);

    let container = backend.container.lock().unwrap();
    assert_eq!(container.tracks.len(), 1);
    assert!(container.started);
    assert!(container.stopped);
    assert_eq!(container.samples.len(), 6);
    // Every frame carries the texture colour
    assert!(container.samples.iter().all(|s| s == &[0, 0, 255, 255]));
    drop(container);

    dist.release().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rotation_update_keeps_worker_running() {
    let store = TextureStore::new();
    let dist = start_distributor(
        &store,
        Arc::new(Backend::default()),
        DistributorConfig::default(),
    );
    let binding = dist.attach_source(source(), None).await.unwrap();
    store
        .fill(binding.texture, binding.buffer_size, [1, 2, 3, 255])
        .unwrap();

    dist.update_rotation(Rotation::Deg90).unwrap();
    dist.on_frame_available(IDENTITY, 1).unwrap();
    dist.flush().await.unwrap();
    assert_eq!(dist.status(), camera_fanout::gpu::worker::WorkerStatus::Ready);

    dist.release().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pattern_camera_stops_on_request() {
    let store = TextureStore::new();
    let dist = start_distributor(
        &store,
        Arc::new(Backend::default()),
        DistributorConfig::default(),
    );
    let binding = dist.attach_source(source(), None).await.unwrap();

    let mut camera = TestPatternCamera::start(
        store,
        binding.texture,
        binding.buffer_size,
        dist.clone(),
        Duration::from_millis(5),
        None,
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(camera.is_running());

    let camera = tokio::task::spawn_blocking(move || {
        camera.stop();
        camera
    })
    .await
    .unwrap();
    assert!(!camera.is_running());
    let delivered = camera.frames_delivered();
    assert!(delivered > 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(camera.frames_delivered(), delivered);

    dist.flush().await.unwrap();
    dist.release().await;
}
