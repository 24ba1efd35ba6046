// SPDX-License-Identifier: MPL-2.0

//! Video sink: draws frames into the active recorder's input surface

use super::recorder::Recorder;
use crate::config::{RecordingSession, Rotation, SinkConfiguration, SourceInfo};
use crate::errors::{GpuResult, RecordingError, RecordingResult};
use crate::gpu::sink::Sink;
use crate::gpu::transform::{Mat4, video_matrix};
use crate::gpu::{Frame, GraphicsContext, Size, SurfaceId};
use crate::media::MediaBackend;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

struct ActiveRecording {
    recorder: Recorder,
    surface: SurfaceId,
    size: Size,
}

/// Render-worker side of recording
///
/// Lives on the render worker. A session's pipeline is created by
/// [`VideoHandler::begin`] and handed back by [`VideoHandler::take_session`]
/// so it can be drained without blocking the worker.
pub struct VideoHandler {
    sink: Sink,
    /// Cropped source size, what `Match` dimensions resolve against
    source_size: Size,
    matrix: Mat4,
    sensor: Rotation,
    active: Option<ActiveRecording>,
    /// Why the last session could not start, reported on stop
    failure: Option<RecordingError>,
}

impl VideoHandler {
    pub fn new(
        ctx: &mut dyn GraphicsContext,
        source: &SourceInfo,
        config: &SinkConfiguration,
    ) -> GpuResult<Self> {
        let sink = Sink::new(ctx, "video", source.rotation, config)?;
        Ok(Self {
            sink,
            source_size: config.crop.crop_size(source.adjusted_base()),
            matrix: video_matrix(source.rotation, source.sensor_orientation),
            sensor: source.sensor_orientation,
            active: None,
            failure: None,
        })
    }

    pub fn source_size(&self) -> Size {
        self.source_size
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Build and start a recorder for `session`
    ///
    /// Failures do not affect the render worker; they are kept and returned
    /// by the next [`VideoHandler::take_session`].
    pub fn begin(
        &mut self,
        ctx: &mut dyn GraphicsContext,
        backend: &dyn MediaBackend,
        session: &RecordingSession,
        runtime: &Handle,
    ) {
        if self.active.is_some() {
            warn!("Recording pipeline already active");
            return;
        }
        self.failure = None;

        // Match dimensions are resolved now, against the current frame size
        let size = session.video.resolve(self.source_size);
        let mut recorder = match Recorder::new(backend, session, size) {
            Ok(recorder) => recorder,
            Err(e) => {
                error!(error = %e, "Failed to create recorder");
                self.failure = Some(e);
                return;
            }
        };

        let surface = match ctx.create_window_surface(recorder.input_surface()) {
            Ok(surface) => surface,
            Err(e) => {
                error!(error = %e, "Failed to wrap encoder input surface");
                self.failure = Some(e.into());
                runtime.spawn(async move {
                    let _ = recorder.release().await;
                });
                return;
            }
        };

        recorder.start(runtime);
        info!(%size, surface = %surface, "Video sink recording");
        self.active = Some(ActiveRecording {
            recorder,
            surface,
            size,
        });
    }

    /// Draw `frame` into the encoder surface if a session is running
    pub fn record_frame(&mut self, ctx: &mut dyn GraphicsContext, frame: &Frame) -> GpuResult<()> {
        let Some(active) = &self.active else {
            return Ok(());
        };
        if !active.recorder.is_running() {
            return Ok(());
        }

        ctx.make_current(active.surface)?;
        ctx.set_viewport(active.size);
        self.sink
            .draw(ctx, frame.texture, &frame.transform, &self.matrix)?;
        ctx.swap_buffers()
    }

    /// Detach the active session from the worker
    ///
    /// The encoder surface is destroyed here; the caller releases the
    /// returned recorder off the worker thread.
    pub fn take_session(&mut self, ctx: &mut dyn GraphicsContext) -> RecordingResult<Recorder> {
        match self.active.take() {
            Some(active) => {
                ctx.destroy_surface(active.surface);
                Ok(active.recorder)
            }
            None => Err(self.failure.take().unwrap_or(RecordingError::NotRecording)),
        }
    }

    pub fn update_rotation(&mut self, rotation: Rotation) {
        self.matrix = video_matrix(rotation, self.sensor);
    }

    /// Release the program and abandon any running session
    pub fn release(&mut self, ctx: &mut dyn GraphicsContext, runtime: &Handle) {
        self.sink.release(ctx);
        if let Some(active) = self.active.take() {
            warn!("Render worker released while recording, finalizing in background");
            ctx.destroy_surface(active.surface);
            runtime.spawn(async move {
                if let Err(e) = active.recorder.release().await {
                    warn!(error = %e, "Recording ended with an error");
                }
            });
        }
    }
}
