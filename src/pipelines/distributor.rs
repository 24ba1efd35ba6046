// SPDX-License-Identifier: MPL-2.0

//! Frame distribution loop
//!
//! [`FrameDistributor`] owns the render worker. Every camera frame becomes
//! one job on that worker which draws, in order, the preview, the video
//! sink (while recording) and the analysis sink. All public methods post
//! work and return; the ones that produce a value return a [`Pending`].

use super::analysis::{AnalysisGate, AnalysisHandler, Analyzer};
use super::video::{Recorder, RecordingController, RecordingTarget, VideoHandler};
use crate::config::{DistributorConfig, RecordingSession, Rotation, SourceInfo};
use crate::errors::{GpuError, GpuResult, RecordingError, RecordingResult};
use crate::gpu::sink::Sink;
use crate::gpu::transform::{Mat4, preview_matrix};
use crate::gpu::worker::{GpuWorker, Pending, WorkerState, WorkerStatus};
use crate::gpu::{Frame, GraphicsContext, Size, SurfaceId, SurfaceTarget, TextureId};
use crate::media::MediaBackend;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What the camera needs to start producing frames
#[derive(Debug, Clone)]
pub struct CameraBinding {
    /// Texture the camera writes every frame into
    pub texture: TextureId,
    /// Buffer size to request from the camera
    pub buffer_size: Size,
    /// Backpressure statistics, when an analyzer is attached
    pub analysis: Option<AnalysisGate>,
}

struct PreviewSink {
    sink: Sink,
    matrix: Mat4,
    sensor: Rotation,
}

struct RenderState {
    ctx: Box<dyn GraphicsContext>,
    config: DistributorConfig,
    backend: Arc<dyn MediaBackend>,
    runtime: Handle,
    /// Keeps a surface current while no window is bound
    idle_surface: Option<SurfaceId>,
    window: Option<SurfaceId>,
    texture: Option<TextureId>,
    preview: Option<PreviewSink>,
    video: Option<VideoHandler>,
    analysis: Option<AnalysisHandler>,
    released: bool,
}

impl RenderState {
    fn attach(
        &mut self,
        source: SourceInfo,
        analyzer: Option<Analyzer>,
    ) -> GpuResult<CameraBinding> {
        if self.texture.is_some() {
            debug!("Replacing attached source");
            self.release_sinks();
        }

        let ctx = self.ctx.as_mut();
        let config = &self.config;

        let preview = Sink::new(ctx, "preview", source.rotation, &config.preview)?;
        self.preview = Some(PreviewSink {
            sink: preview,
            matrix: preview_matrix(
                config.normalize_preview,
                source.rotation,
                source.sensor_orientation,
            ),
            sensor: source.sensor_orientation,
        });

        let texture = ctx.create_texture()?;
        self.texture = Some(texture);

        let analysis = match analyzer {
            Some(analyzer) => {
                let handler = AnalysisHandler::new(ctx, &source, &config.analysis, analyzer)?;
                let gate = handler.gate();
                self.analysis = Some(handler);
                Some(gate)
            }
            None => None,
        };

        self.video = Some(VideoHandler::new(ctx, &source, &config.video)?);

        info!(
            resolution = %source.resolution,
            rotation = source.rotation.degrees(),
            sensor = source.sensor_orientation.degrees(),
            %texture,
            "Camera source attached"
        );

        Ok(CameraBinding {
            texture,
            buffer_size: source.resolution,
            analysis,
        })
    }

    fn bind_window(&mut self, target: Arc<dyn SurfaceTarget>) -> GpuResult<()> {
        if let Some(old) = self.window.take() {
            self.ctx.destroy_surface(old);
        }
        let surface = self.ctx.create_window_surface(target)?;
        debug!(%surface, "Preview surface bound");
        self.window = Some(surface);
        Ok(())
    }

    fn draw_frame(&mut self, transform: Mat4, timestamp_ns: i64) -> GpuResult<()> {
        let Some(texture) = self.texture else {
            return Ok(());
        };
        let frame = Frame {
            texture,
            transform,
            timestamp_ns,
        };
        let ctx = self.ctx.as_mut();

        if let (Some(preview), Some(window)) = (&self.preview, self.window) {
            ctx.make_current(window)?;
            let size = ctx.surface_size(window)?;
            ctx.set_viewport(size);
            preview
                .sink
                .draw(ctx, frame.texture, &frame.transform, &preview.matrix)?;
            ctx.swap_buffers()?;
        }

        if let Some(video) = self.video.as_mut() {
            video.record_frame(ctx, &frame)?;
        }

        if let Some(analysis) = self.analysis.as_mut() {
            analysis.generate(ctx, &frame)?;
        }

        Ok(())
    }

    fn update_rotation(&mut self, rotation: Rotation) {
        if let Some(preview) = self.preview.as_mut() {
            preview.matrix =
                preview_matrix(self.config.normalize_preview, rotation, preview.sensor);
        }
        if let Some(video) = self.video.as_mut() {
            video.update_rotation(rotation);
        }
        if let Some(analysis) = self.analysis.as_mut() {
            analysis.update_rotation(rotation);
        }
    }

    fn begin_recording(&mut self, session: &RecordingSession) {
        match self.video.as_mut() {
            Some(video) => video.begin(
                self.ctx.as_mut(),
                self.backend.as_ref(),
                session,
                &self.runtime,
            ),
            None => warn!("Recording requested before a camera source was attached"),
        }
    }

    fn take_recording(&mut self) -> RecordingResult<Recorder> {
        match self.video.as_mut() {
            Some(video) => video.take_session(self.ctx.as_mut()),
            None => Err(RecordingError::NotRecording),
        }
    }

    fn release_sinks(&mut self) {
        let ctx = self.ctx.as_mut();
        if let Some(mut preview) = self.preview.take() {
            preview.sink.release(ctx);
        }
        if let Some(mut video) = self.video.take() {
            video.release(ctx, &self.runtime);
        }
        if let Some(mut analysis) = self.analysis.take() {
            analysis.release(ctx);
        }
        if let Some(texture) = self.texture.take() {
            ctx.delete_texture(texture);
        }
    }
}

impl WorkerState for RenderState {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.release_sinks();
        if let Some(window) = self.window.take() {
            self.ctx.destroy_surface(window);
        }
        if let Some(idle) = self.idle_surface.take() {
            self.ctx.destroy_surface(idle);
        }
        self.ctx.release();
    }
}

struct Shared {
    runtime: Handle,
    /// True once a source is attached and the video sink exists
    ready: watch::Sender<bool>,
}

/// Distributes camera frames to the preview, video and analysis sinks
#[derive(Clone)]
pub struct FrameDistributor {
    worker: GpuWorker<RenderState>,
    shared: Arc<Shared>,
}

impl FrameDistributor {
    /// Start the render worker
    ///
    /// `make_context` runs on the worker thread. Must be called from within
    /// a tokio runtime; recording tasks are spawned on it.
    pub fn new<F>(
        make_context: F,
        backend: Arc<dyn MediaBackend>,
        config: DistributorConfig,
    ) -> GpuResult<Self>
    where
        F: FnOnce() -> GpuResult<Box<dyn GraphicsContext>> + Send + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|e| GpuError::ContextInit(format!("no async runtime: {}", e)))?;
        let state_runtime = runtime.clone();

        let worker = GpuWorker::spawn("frame-distributor", move || {
            let mut ctx = make_context()?;
            let idle = ctx.create_offscreen_surface(Size::new(1, 1))?;
            ctx.make_current(idle)?;
            debug!(capabilities = ?ctx.capabilities(), "Graphics context ready");

            Ok(RenderState {
                ctx,
                config,
                backend,
                runtime: state_runtime,
                idle_surface: Some(idle),
                window: None,
                texture: None,
                preview: None,
                video: None,
                analysis: None,
                released: false,
            })
        })?;

        let (ready, _) = watch::channel(false);
        Ok(Self {
            worker,
            shared: Arc::new(Shared { runtime, ready }),
        })
    }

    /// Build the sinks for `source` and allocate the camera texture
    ///
    /// A sink that cannot be built is fatal for the worker.
    pub fn attach_source(
        &self,
        source: SourceInfo,
        analyzer: Option<Analyzer>,
    ) -> Pending<CameraBinding> {
        let ready = self.shared.ready.clone();
        self.worker.call(move |state| {
            let binding = state.attach(source, analyzer)?;
            ready.send_replace(true);
            Ok(binding)
        })
    }

    /// Present the preview to `target`, replacing any earlier target
    pub fn bind_surface(&self, target: Arc<dyn SurfaceTarget>) -> GpuResult<()> {
        self.worker.submit(move |state| state.bind_window(target))
    }

    /// The display rotated
    pub fn update_rotation(&self, rotation: Rotation) -> GpuResult<()> {
        self.worker.submit(move |state| {
            state.update_rotation(rotation);
            Ok(())
        })
    }

    /// The camera finished writing a frame into the texture
    ///
    /// `transform` is the texture transform the camera reported for it.
    pub fn on_frame_available(&self, transform: Mat4, timestamp_ns: i64) -> GpuResult<()> {
        self.worker
            .submit(move |state| state.draw_frame(transform, timestamp_ns))
    }

    /// Resolves once everything posted so far has run
    pub fn flush(&self) -> Pending<()> {
        self.worker.call(|_| Ok(()))
    }

    /// Let `controller` start sessions once a source is attached
    pub fn connect_recorder(&self, controller: RecordingController) {
        let distributor = self.clone();
        let mut ready = self.shared.ready.subscribe();
        let mut status = self.worker.subscribe();

        self.shared.runtime.spawn(async move {
            tokio::select! {
                attached = async { ready.wait_for(|ready| *ready).await.is_ok() } => {
                    if attached {
                        controller.worker_ready(Arc::new(distributor));
                    }
                }
                _ = async {
                    let _ = status
                        .wait_for(|s| matches!(s, WorkerStatus::Failed(_) | WorkerStatus::Released))
                        .await;
                } => {
                    debug!("Render worker stopped before a source was attached");
                }
            }
        });
    }

    pub fn status(&self) -> WorkerStatus {
        self.worker.status()
    }

    pub async fn wait_ready(&self) -> GpuResult<()> {
        self.worker.wait_ready().await
    }

    /// Release every graphics resource and stop the worker
    ///
    /// Idempotent. A running recording is finalized in the background.
    pub fn release(&self) -> impl Future<Output = ()> + Send + 'static {
        self.shared.ready.send_replace(false);
        self.worker.release()
    }
}

impl RecordingTarget for FrameDistributor {
    fn begin_recording(&self, session: RecordingSession) {
        let posted = self.worker.submit(move |state| {
            state.begin_recording(&session);
            Ok(())
        });
        if let Err(e) = posted {
            warn!(error = %e, "Could not post recording start");
        }
    }

    fn finish_recording(&self) -> BoxFuture<'static, RecordingResult<PathBuf>> {
        let taken = self.worker.call(|state| Ok(state.take_recording()));
        async move {
            let recorder = taken.await??;
            recorder.release().await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::software::SoftwareGraphics;
    use crate::backends::texture_store::TextureStore;
    use crate::config::{Crop, SinkConfiguration, VideoSpec};
    use crate::constants::VIDEO_MIME_AVC;
    use crate::gpu::Capabilities;
    use crate::gpu::transform::IDENTITY;
    use crate::media::testing::MockBackend;
    use crate::pipelines::analysis::AnalysisImage;
    use crate::pipelines::video::RecordingState;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Window {
        frames: Mutex<Vec<(Size, Vec<u8>)>>,
    }

    impl SurfaceTarget for Window {
        fn size(&self) -> Size {
            Size::new(8, 6)
        }

        fn present(&self, pixels: &[u8], size: Size) -> GpuResult<()> {
            self.frames.lock().unwrap().push((size, pixels.to_vec()));
            Ok(())
        }
    }

    fn source() -> SourceInfo {
        SourceInfo {
            resolution: Size::new(16, 12),
            rotation: Rotation::Deg0,
            sensor_orientation: Rotation::Deg0,
        }
    }

    fn distributor(
        store: &TextureStore,
        capabilities: Capabilities,
        backend: Arc<MockBackend>,
        config: DistributorConfig,
    ) -> FrameDistributor {
        let store = store.clone();
        FrameDistributor::new(
            move || {
                let ctx: Box<dyn GraphicsContext> =
                    Box::new(SoftwareGraphics::with_capabilities(store, capabilities));
                Ok(ctx)
            },
            backend,
            config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_preview_receives_frames() {
        let store = TextureStore::new();
        let dist = distributor(
            &store,
            Capabilities::default(),
            Arc::new(MockBackend::default()),
            DistributorConfig::default(),
        );
        dist.wait_ready().await.unwrap();

        let binding = dist.attach_source(source(), None).await.unwrap();
        assert_eq!(binding.buffer_size, Size::new(16, 12));
        store.fill(binding.texture, Size::new(16, 12), [255, 0, 0, 255]).unwrap();

        let window = Arc::new(Window::default());
        dist.bind_surface(window.clone()).unwrap();
        dist.on_frame_available(IDENTITY, 1).unwrap();
        dist.on_frame_available(IDENTITY, 2).unwrap();
        dist.flush().await.unwrap();

        let frames = window.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        let (size, pixels) = &frames[0];
        assert_eq!(*size, Size::new(8, 6));
        assert_eq!(&pixels[..4], &[255, 0, 0, 255]);
        drop(frames);

        dist.release().await;
        assert_eq!(dist.status(), WorkerStatus::Released);
        // Released twice is fine
        dist.release().await;
    }

    #[tokio::test]
    async fn test_analysis_backpressure_with_double_buffering() {
        let store = TextureStore::new();
        let capabilities = Capabilities {
            async_readback: true,
            edge_detect: false,
        };
        let config = DistributorConfig {
            analysis: SinkConfiguration::default().with_crop(Crop::new(0.0, 0.0, 0.5, 0.5)),
            ..Default::default()
        };
        let dist = distributor(&store, capabilities, Arc::new(MockBackend::default()), config);

        let held: Arc<Mutex<Vec<AnalysisImage>>> = Arc::default();
        let sink = held.clone();
        let analyzer: Analyzer = Arc::new(move |image| sink.lock().unwrap().push(image));

        let binding = dist.attach_source(source(), Some(analyzer)).await.unwrap();
        store.fill(binding.texture, Size::new(16, 12), [10, 20, 30, 255]).unwrap();
        let gate = binding.analysis.unwrap();

        // First frame only primes the transfer buffers
        dist.on_frame_available(IDENTITY, 1).unwrap();
        dist.flush().await.unwrap();
        assert!(held.lock().unwrap().is_empty());

        dist.on_frame_available(IDENTITY, 2).unwrap();
        dist.flush().await.unwrap();
        {
            let images = held.lock().unwrap();
            assert_eq!(images.len(), 1);
            assert_eq!(images[0].size(), Size::new(8, 6));
            assert_eq!(&images[0].data()[..4], &[10, 20, 30, 255]);
        }

        // The image is still held, so this frame is skipped
        dist.on_frame_available(IDENTITY, 3).unwrap();
        dist.flush().await.unwrap();
        assert_eq!(held.lock().unwrap().len(), 1);
        assert_eq!(gate.dropped(), 1);

        held.lock().unwrap().clear();
        dist.on_frame_available(IDENTITY, 4).unwrap();
        dist.flush().await.unwrap();
        assert_eq!(held.lock().unwrap().len(), 1);
        assert_eq!(gate.delivered(), 2);

        held.lock().unwrap().clear();
        dist.release().await;
    }

    #[tokio::test]
    async fn test_edge_detect_without_support_is_fatal() {
        let store = TextureStore::new();
        let config = DistributorConfig {
            preview: SinkConfiguration::default().with_edge_detect(true),
            ..Default::default()
        };
        let dist = distributor(
            &store,
            Capabilities::default(),
            Arc::new(MockBackend::default()),
            config,
        );

        let err = dist.attach_source(source(), None).await.unwrap_err();
        assert!(matches!(err, GpuError::ProgramCompile(_)));

        let mut status = dist.worker.subscribe();
        let settled = status
            .wait_for(|s| matches!(s, WorkerStatus::Failed(_)))
            .await
            .is_ok();
        assert!(settled);
        assert_eq!(dist.on_frame_available(IDENTITY, 1), Err(GpuError::Released));
    }

    #[tokio::test]
    async fn test_recording_matches_source_size() {
        let store = TextureStore::new();
        let backend = Arc::new(MockBackend::default());
        let dist = distributor(
            &store,
            Capabilities::default(),
            backend.clone(),
            DistributorConfig::default(),
        );

        let controller = RecordingController::new(Handle::current());
        dist.connect_recorder(controller.clone());

        // Requested before the worker can host it
        let session =
            RecordingSession::new("/tmp/distributor-test.mp4").with_video(VideoSpec::matching(1_000_000));
        controller.start(session);
        assert_eq!(controller.state(), RecordingState::Starting);

        let binding = dist.attach_source(source(), None).await.unwrap();
        store.fill(binding.texture, Size::new(16, 12), [0, 255, 0, 255]).unwrap();

        let mut state = controller.subscribe();
        state
            .wait_for(|s| *s == RecordingState::Running)
            .await
            .unwrap();

        for ts in 0..4 {
            dist.on_frame_available(IDENTITY, ts).unwrap();
        }
        dist.flush().await.unwrap();

        let encoder = backend.encoder(VIDEO_MIME_AVC).unwrap();
        assert_eq!(
            encoder.state().format.as_ref().map(|f| f.size()),
            Some(Size::new(16, 12))
        );
        assert_eq!(encoder.state().presented.len(), 4);

        let output = controller.stop().await.unwrap();
        assert_eq!(output, Some(PathBuf::from("/tmp/distributor-test.mp4")));
        assert_eq!(controller.state(), RecordingState::Stopped);

        let mux = backend.muxer().unwrap();
        assert_eq!(mux.log().stopped, 1);
        assert_eq!(mux.video_samples(), 4);

        // Frames after the stop do not reach the encoder
        dist.on_frame_available(IDENTITY, 9).unwrap();
        dist.flush().await.unwrap();
        assert_eq!(encoder.state().presented.len(), 4);

        dist.release().await;
    }

    #[tokio::test]
    async fn test_match_size_configures_720p_encoder() {
        let store = TextureStore::new();
        let backend = Arc::new(MockBackend::default());
        let dist = distributor(
            &store,
            Capabilities::default(),
            backend.clone(),
            DistributorConfig::default(),
        );

        let source = SourceInfo {
            resolution: Size::new(1280, 720),
            rotation: Rotation::Deg0,
            sensor_orientation: Rotation::Deg0,
        };
        let binding = dist.attach_source(source, None).await.unwrap();
        assert_eq!(binding.buffer_size, Size::new(1280, 720));
        store.fill(binding.texture, binding.buffer_size, [0, 0, 255, 255]).unwrap();

        let controller = RecordingController::new(Handle::current());
        dist.connect_recorder(controller.clone());
        let mut state = controller.subscribe();
        controller.start(
            RecordingSession::new("/tmp/distributor-720p.mp4").with_video(VideoSpec::matching(4_000_000)),
        );
        state
            .wait_for(|s| *s == RecordingState::Running)
            .await
            .unwrap();

        dist.on_frame_available(IDENTITY, 1).unwrap();
        dist.flush().await.unwrap();

        let encoder = backend.encoder(VIDEO_MIME_AVC).unwrap();
        assert_eq!(
            encoder.state().format.as_ref().map(|f| f.size()),
            Some(Size::new(1280, 720))
        );
        assert_eq!(encoder.state().presented, vec![Size::new(1280, 720)]);

        controller.stop().await.unwrap();
        dist.release().await;
    }

    #[tokio::test]
    async fn test_stop_without_pipeline_reports_not_recording() {
        let store = TextureStore::new();
        let dist = distributor(
            &store,
            Capabilities::default(),
            Arc::new(MockBackend::default()),
            DistributorConfig::default(),
        );
        dist.attach_source(source(), None).await.unwrap();

        let err = dist.finish_recording().await.unwrap_err();
        assert_eq!(err, RecordingError::NotRecording);
        dist.release().await;
    }
}
