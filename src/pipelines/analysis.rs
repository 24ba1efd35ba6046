// SPDX-License-Identifier: MPL-2.0

//! Analysis sink: offscreen render, pixel readback, callback
//!
//! At most one image is ever outstanding. While the consumer holds an
//! [`AnalysisImage`], new frames are skipped before any draw or copy is
//! issued; closing or dropping the image reopens the gate and hands its
//! buffer back for reuse.

use crate::config::{Rotation, SinkConfiguration, SourceInfo};
use crate::errors::GpuResult;
use crate::gpu::readback::PixelReader;
use crate::gpu::sink::Sink;
use crate::gpu::transform::{Mat4, analysis_matrix};
use crate::gpu::{Frame, GraphicsContext, Size, SurfaceId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Consumer of analysis images
///
/// Called on the render worker; hand the image to another thread for
/// anything slow.
pub type Analyzer = Arc<dyn Fn(AnalysisImage) + Send + Sync>;

#[derive(Debug, Default)]
struct GateShared {
    busy: AtomicBool,
    spare: Mutex<Option<Vec<u8>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Single-slot backpressure between the render worker and the consumer
#[derive(Debug, Clone, Default)]
pub struct AnalysisGate {
    shared: Arc<GateShared>,
}

impl AnalysisGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot, returning a buffer to read into
    ///
    /// `None` while an image is still outstanding; the frame counts as dropped.
    fn try_acquire(&self) -> Option<Vec<u8>> {
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let spare = self
            .shared
            .spare
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Some(spare.unwrap_or_default())
    }

    /// Return the slot, keeping `buffer` for the next image
    fn restore(&self, buffer: Vec<u8>) {
        *self
            .shared
            .spare
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(buffer);
        self.shared.busy.store(false, Ordering::Release);
    }

    /// True while an image is held by the consumer
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Images handed to the analyzer
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Frames skipped because an image was outstanding
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// One analysis frame, RGBA with the top row first
pub struct AnalysisImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
    gate: Option<AnalysisGate>,
}

impl AnalysisImage {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// One row of pixels
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let stride = self.width as usize * 4;
        let start = y as usize * stride;
        self.data.get(start..start + stride)
    }

    /// Release the image so the next frame can be analyzed
    pub fn close(self) {}
}

impl fmt::Debug for AnalysisImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for AnalysisImage {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.restore(std::mem::take(&mut self.data));
        }
    }
}

/// Renders the analysis view offscreen and delivers it to the analyzer
pub struct AnalysisHandler {
    sink: Sink,
    surface: Option<SurfaceId>,
    size: Size,
    matrix: Mat4,
    sensor: Rotation,
    reader: PixelReader,
    gate: AnalysisGate,
    analyzer: Analyzer,
}

impl AnalysisHandler {
    pub fn new(
        ctx: &mut dyn GraphicsContext,
        source: &SourceInfo,
        config: &SinkConfiguration,
        analyzer: Analyzer,
    ) -> GpuResult<Self> {
        let size = config.crop.crop_size(source.adjusted_base());
        let sink = Sink::new(ctx, "analysis", source.rotation, config)?;
        let surface = ctx.create_offscreen_surface(size)?;
        let reader = PixelReader::new(ctx, size)?;

        debug!(
            %size,
            double_buffered = reader.is_double_buffered(),
            "Analysis sink ready"
        );

        Ok(Self {
            sink,
            surface: Some(surface),
            size,
            matrix: analysis_matrix(source.rotation, source.sensor_orientation),
            sensor: source.sensor_orientation,
            reader,
            gate: AnalysisGate::new(),
            analyzer,
        })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn gate(&self) -> AnalysisGate {
        self.gate.clone()
    }

    /// Render `frame` and deliver an image if one is ready
    pub fn generate(&mut self, ctx: &mut dyn GraphicsContext, frame: &Frame) -> GpuResult<()> {
        let Some(surface) = self.surface else {
            return Ok(());
        };
        let Some(mut buffer) = self.gate.try_acquire() else {
            trace!(timestamp = frame.timestamp_ns, "Analysis image outstanding, frame skipped");
            return Ok(());
        };

        match self.render(ctx, surface, frame, &mut buffer) {
            Ok(true) => {
                self.gate.shared.delivered.fetch_add(1, Ordering::Relaxed);
                (self.analyzer)(AnalysisImage {
                    width: self.size.width,
                    height: self.size.height,
                    data: buffer,
                    gate: Some(self.gate.clone()),
                });
                Ok(())
            }
            Ok(false) => {
                self.gate.restore(buffer);
                Ok(())
            }
            Err(e) => {
                self.gate.restore(buffer);
                Err(e)
            }
        }
    }

    fn render(
        &mut self,
        ctx: &mut dyn GraphicsContext,
        surface: SurfaceId,
        frame: &Frame,
        out: &mut Vec<u8>,
    ) -> GpuResult<bool> {
        ctx.make_current(surface)?;
        ctx.set_viewport(self.size);
        self.sink
            .draw(ctx, frame.texture, &frame.transform, &self.matrix)?;
        self.reader.read_into(ctx, out)
    }

    pub fn update_rotation(&mut self, rotation: Rotation) {
        self.matrix = analysis_matrix(rotation, self.sensor);
    }

    pub fn release(&mut self, ctx: &mut dyn GraphicsContext) {
        self.sink.release(ctx);
        self.reader.release(ctx);
        if let Some(surface) = self.surface.take() {
            ctx.destroy_surface(surface);
        }
    }
}
