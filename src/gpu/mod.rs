// SPDX-License-Identifier: GPL-3.0-only

//! Graphics abstraction and the render worker
//!
//! All graphics state lives behind [`GraphicsContext`] and is only touched
//! from the single thread owned by a [`worker::GpuWorker`]:
//!
//! ```text
//!  camera frame ──► GpuWorker thread ──► preview sink  ──► window surface
//!                    (one context)   ├─► video sink    ──► encoder surface
//!                                    └─► analysis sink ──► offscreen ──► readback
//! ```
//!
//! A context does not know about sinks. It compiles programs, owns
//! surfaces and pixel buffers, and draws one textured quad at a time.

pub mod readback;
pub mod sink;
pub mod transform;
pub mod worker;

pub use crate::config::Size;
use crate::errors::GpuResult;
use std::sync::Arc;
use transform::{Mat4, Quad};

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

handle_type!(
    /// External texture the camera writes into
    TextureId
);
handle_type!(
    /// Compiled draw program
    ProgramId
);
handle_type!(
    /// Window, encoder or offscreen render target
    SurfaceId
);
handle_type!(
    /// Transfer buffer for asynchronous pixel readback
    PixelBufferId
);

/// Draw programs every context must be able to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    /// Sample the texture as-is
    PassThrough,
    /// Grayscale gradient magnitude, thresholded and blurred
    EdgeDetect,
}

/// Result of the context's capability query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Pixel pack buffers are available, enabling double-buffered readback
    pub async_readback: bool,
    /// Screen-space derivatives are available, enabling the edge program
    pub edge_detect: bool,
}

/// Everything a single quad draw needs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawParams {
    pub program: ProgramId,
    pub texture: TextureId,
    /// Texture transform reported by the camera for this frame
    pub tex_matrix: Mat4,
    /// Model-view-projection applied to the full-target rectangle
    pub mvp: Mat4,
    pub tex_coords: Quad,
}

/// One camera frame as seen by the render worker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub texture: TextureId,
    pub transform: Mat4,
    pub timestamp_ns: i64,
}

/// Something frames can be presented to: a display or an encoder input
pub trait SurfaceTarget: Send + Sync {
    /// Current size in pixels
    fn size(&self) -> Size;

    /// Receive a finished frame, RGBA with the top row first
    fn present(&self, pixels: &[u8], size: Size) -> GpuResult<()>;
}

/// Graphics context capability surface
///
/// Implementations are driven from one thread only, so methods take
/// `&mut self`. Rows read back from a framebuffer come bottom row first,
/// the way GL reports them.
pub trait GraphicsContext: Send {
    fn capabilities(&self) -> Capabilities;

    fn create_texture(&mut self) -> GpuResult<TextureId>;
    fn delete_texture(&mut self, texture: TextureId);

    fn create_program(&mut self, kind: ProgramKind) -> GpuResult<ProgramId>;
    fn delete_program(&mut self, program: ProgramId);

    fn create_window_surface(&mut self, target: Arc<dyn SurfaceTarget>) -> GpuResult<SurfaceId>;
    fn create_offscreen_surface(&mut self, size: Size) -> GpuResult<SurfaceId>;
    fn surface_size(&self, surface: SurfaceId) -> GpuResult<Size>;
    fn destroy_surface(&mut self, surface: SurfaceId);

    fn make_current(&mut self, surface: SurfaceId) -> GpuResult<()>;
    fn set_viewport(&mut self, size: Size);
    fn draw(&mut self, params: &DrawParams) -> GpuResult<()>;
    /// Present the current surface if it is a window surface
    fn swap_buffers(&mut self) -> GpuResult<()>;

    /// Blocking read of the current framebuffer into `out`
    fn read_pixels(&mut self, size: Size, out: &mut Vec<u8>) -> GpuResult<()>;

    fn create_pixel_buffers(&mut self, count: usize, len: usize) -> GpuResult<Vec<PixelBufferId>>;
    /// Start an asynchronous copy of the current framebuffer into `buffer`
    fn read_pixels_to_buffer(&mut self, buffer: PixelBufferId, size: Size) -> GpuResult<()>;
    /// Map a previously filled buffer and copy its contents into `out`
    fn map_pixel_buffer(&mut self, buffer: PixelBufferId, out: &mut Vec<u8>) -> GpuResult<()>;
    fn delete_pixel_buffers(&mut self, buffers: &[PixelBufferId]);

    /// Tear down the context; nothing may be called afterwards
    fn release(&mut self);
}
