// SPDX-License-Identifier: GPL-3.0-only

//! CPU reference implementation of the graphics context
//!
//! Renders the same textured quads as [`super::wgpu_graphics`], one pixel
//! at a time, so pipeline tests can check exact pixel values without a GPU
//! adapter. Surfaces keep their rows bottom first like a GL framebuffer and
//! are flipped when a window surface is presented.
//!
//! Pixel buffers are plain vectors filled at queue time. They follow the
//! same one-call lag as the staging buffers of the GPU context but involve
//! no transfer.

use crate::errors::{GpuError, GpuResult};
use crate::gpu::transform::{Mat4, transform_point};
use crate::gpu::{
    Capabilities, DrawParams, GraphicsContext, PixelBufferId, ProgramId, ProgramKind, Size,
    SurfaceId, SurfaceTarget, TextureId,
};
use super::texture_store::{Rgba, TextureImage, TextureStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Edge program blur weights for offsets 0, 1 and 3 along the diagonal
const BLUR_TAPS: [(f32, f32); 3] = [(0.0, 0.2270), (1.0, 0.3162), (3.0, 0.0703)];

/// Gradient magnitudes below the first edge are black, above the second white
const EDGE_THRESHOLD: (f32, f32) = (0.05, 0.08);

fn luma(pixel: Rgba) -> f32 {
    (0.21 * pixel.r as f32 + 0.71 * pixel.g as f32 + 0.07 * pixel.b as f32) / 255.0
}

/// Nearest sample; `v` runs from the bottom row (0) to the top row (1)
fn sample(image: &TextureImage, u: f32, v: f32) -> Rgba {
    let (w, h) = (image.size.width as usize, image.size.height as usize);
    if w == 0 || h == 0 {
        return Rgba::BLACK;
    }
    let col = ((u * w as f32).floor().max(0.0) as usize).min(w - 1);
    let row = ((v * h as f32).floor().max(0.0) as usize).min(h - 1);
    image.pixels[(h - 1 - row) * w + col]
}

fn edge(image: &TextureImage, u: f32, v: f32) -> f32 {
    let du = 1.0 / image.size.width.max(1) as f32;
    let dv = 1.0 / image.size.height.max(1) as f32;
    let center = luma(sample(image, u, v));
    let dx = luma(sample(image, u + du, v)) - center;
    let dy = luma(sample(image, u, v + dv)) - center;
    smoothstep(EDGE_THRESHOLD.0, EDGE_THRESHOLD.1, dx.abs() + dy.abs())
}

fn edge_blurred(image: &TextureImage, u: f32, v: f32) -> Rgba {
    let du = 1.0 / image.size.width.max(1) as f32;
    let dv = 1.0 / image.size.height.max(1) as f32;
    let mut value = 0.0;
    for (offset, weight) in BLUR_TAPS {
        if offset == 0.0 {
            value += weight * edge(image, u, v);
        } else {
            value += weight * edge(image, u + offset * du, v + offset * dv);
            value += weight * edge(image, u - offset * du, v - offset * dv);
        }
    }
    let level = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgba::new(level, level, level, 255)
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

struct Surface {
    size: Size,
    /// Bottom row first
    pixels: Vec<Rgba>,
    target: Option<Arc<dyn SurfaceTarget>>,
}

impl Surface {
    fn new(size: Size, target: Option<Arc<dyn SurfaceTarget>>) -> Self {
        Self {
            size,
            pixels: vec![Rgba::default(); size.width as usize * size.height as usize],
            target,
        }
    }

    /// Follow the window's size
    fn sync_size(&mut self) {
        if let Some(target) = &self.target {
            let size = target.size();
            if size != self.size {
                trace!(from = %self.size, to = %size, "Window surface resized");
                self.size = size;
                self.pixels =
                    vec![Rgba::default(); size.width as usize * size.height as usize];
            }
        }
    }

    /// Copy the region `size` at the origin, bottom row first
    fn read(&self, size: Size, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(size.rgba_len());
        let surface_width = self.size.width as usize;
        for y in 0..size.height as usize {
            for x in 0..size.width as usize {
                let pixel = if x < surface_width && y < self.size.height as usize {
                    self.pixels[y * surface_width + x]
                } else {
                    Rgba::default()
                };
                out.extend_from_slice(bytemuck::bytes_of(&pixel));
            }
        }
    }
}

/// Inverse of the 2D affine part of `m`
fn invert_affine(m: &Mat4) -> Option<[f32; 6]> {
    let (a, b, c, d) = (m[0], m[4], m[1], m[5]);
    let (tx, ty) = (m[12], m[13]);
    let det = a * d - b * c;
    if det.abs() < f32::EPSILON {
        return None;
    }
    let inv = 1.0 / det;
    let (ia, ib, ic, id) = (d * inv, -b * inv, -c * inv, a * inv);
    Some([ia, ib, ic, id, -(ia * tx + ib * ty), -(ic * tx + id * ty)])
}

/// Software [`GraphicsContext`]
pub struct SoftwareGraphics {
    store: TextureStore,
    capabilities: Capabilities,
    programs: HashMap<ProgramId, ProgramKind>,
    surfaces: HashMap<SurfaceId, Surface>,
    pixel_buffers: HashMap<PixelBufferId, Vec<u8>>,
    current: Option<SurfaceId>,
    viewport: Size,
    next_id: u32,
}

impl SoftwareGraphics {
    /// Context with every capability enabled
    pub fn new(store: TextureStore) -> Self {
        Self::with_capabilities(
            store,
            Capabilities {
                async_readback: true,
                edge_detect: true,
            },
        )
    }

    pub fn with_capabilities(store: TextureStore, capabilities: Capabilities) -> Self {
        debug!(?capabilities, "Software graphics context created");
        Self {
            store,
            capabilities,
            programs: HashMap::new(),
            surfaces: HashMap::new(),
            pixel_buffers: HashMap::new(),
            current: None,
            viewport: Size::default(),
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn current_surface(&mut self) -> GpuResult<&mut Surface> {
        let id = self
            .current
            .ok_or_else(|| GpuError::Draw("no current surface".into()))?;
        self.surfaces
            .get_mut(&id)
            .ok_or_else(|| GpuError::UnknownHandle(id.to_string()))
    }

    fn insert_surface(&mut self, surface: Surface) -> SurfaceId {
        let id = SurfaceId(self.next_id());
        self.surfaces.insert(id, surface);
        id
    }
}

impl GraphicsContext for SoftwareGraphics {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_texture(&mut self) -> GpuResult<TextureId> {
        Ok(self.store.allocate())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.store.remove(texture);
    }

    fn create_program(&mut self, kind: ProgramKind) -> GpuResult<ProgramId> {
        if kind == ProgramKind::EdgeDetect && !self.capabilities.edge_detect {
            return Err(GpuError::ProgramCompile(
                "edge program needs derivative support".into(),
            ));
        }
        let id = ProgramId(self.next_id());
        self.programs.insert(id, kind);
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn create_window_surface(&mut self, target: Arc<dyn SurfaceTarget>) -> GpuResult<SurfaceId> {
        let size = target.size();
        if size.is_empty() {
            return Err(GpuError::Surface(format!("window of size {}", size)));
        }
        Ok(self.insert_surface(Surface::new(size, Some(target))))
    }

    fn create_offscreen_surface(&mut self, size: Size) -> GpuResult<SurfaceId> {
        if size.is_empty() {
            return Err(GpuError::Surface(format!("offscreen surface of size {}", size)));
        }
        Ok(self.insert_surface(Surface::new(size, None)))
    }

    fn surface_size(&self, surface: SurfaceId) -> GpuResult<Size> {
        let surface = self
            .surfaces
            .get(&surface)
            .ok_or_else(|| GpuError::UnknownHandle(surface.to_string()))?;
        Ok(match &surface.target {
            Some(target) => target.size(),
            None => surface.size,
        })
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        self.surfaces.remove(&surface);
        if self.current == Some(surface) {
            self.current = None;
        }
    }

    fn make_current(&mut self, surface: SurfaceId) -> GpuResult<()> {
        let target = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| GpuError::UnknownHandle(surface.to_string()))?;
        target.sync_size();
        self.current = Some(surface);
        Ok(())
    }

    fn set_viewport(&mut self, size: Size) {
        self.viewport = size;
    }

    fn draw(&mut self, params: &DrawParams) -> GpuResult<()> {
        let kind = *self
            .programs
            .get(&params.program)
            .ok_or_else(|| GpuError::UnknownHandle(params.program.to_string()))?;
        let inverse = invert_affine(&params.mvp);
        let viewport = self.viewport;
        let store = self.store.clone();
        let surface = self.current_surface()?;

        let images = store.images();
        let image = images
            .get(&params.texture)
            .ok_or_else(|| GpuError::UnknownHandle(params.texture.to_string()))?;
        let Some([ia, ib, ic, id, itx, ity]) = inverse else {
            return Ok(());
        };

        let width = viewport.width.min(surface.size.width) as usize;
        let height = viewport.height.min(surface.size.height) as usize;
        let stride = surface.size.width as usize;
        let q = &params.tex_coords;

        for py in 0..height {
            let cy = (py as f32 + 0.5) / viewport.height as f32 * 2.0 - 1.0;
            for px in 0..width {
                let cx = (px as f32 + 0.5) / viewport.width as f32 * 2.0 - 1.0;
                let x = ia * cx + ib * cy + itx;
                let y = ic * cx + id * cy + ity;
                if !(-1.0..=1.0).contains(&x) || !(-1.0..=1.0).contains(&y) {
                    continue;
                }

                // Bilinear position inside the quad, corners in strip order
                let s = (x + 1.0) / 2.0;
                let t = (y + 1.0) / 2.0;
                let weights = [(1.0 - s) * (1.0 - t), s * (1.0 - t), (1.0 - s) * t, s * t];
                let (mut u, mut v) = (0.0, 0.0);
                for (corner, weight) in weights.iter().enumerate() {
                    u += weight * q[corner * 2];
                    v += weight * q[corner * 2 + 1];
                }
                let (u, v) = transform_point(&params.tex_matrix, u, v);

                surface.pixels[py * stride + px] = match kind {
                    ProgramKind::PassThrough => sample(image, u, v),
                    ProgramKind::EdgeDetect => edge_blurred(image, u, v),
                };
            }
        }
        Ok(())
    }

    fn swap_buffers(&mut self) -> GpuResult<()> {
        let surface = self.current_surface()?;
        let Some(target) = surface.target.clone() else {
            return Ok(());
        };

        let width = surface.size.width as usize;
        let mut frame = Vec::with_capacity(surface.size.rgba_len());
        for row in surface.pixels.chunks(width.max(1)).rev() {
            frame.extend_from_slice(bytemuck::cast_slice(row));
        }
        target.present(&frame, surface.size)
    }

    fn read_pixels(&mut self, size: Size, out: &mut Vec<u8>) -> GpuResult<()> {
        self.current_surface()?.read(size, out);
        Ok(())
    }

    fn create_pixel_buffers(&mut self, count: usize, len: usize) -> GpuResult<Vec<PixelBufferId>> {
        if !self.capabilities.async_readback {
            return Err(GpuError::Readback("pixel buffers not supported".into()));
        }
        let ids: Vec<PixelBufferId> = (0..count)
            .map(|_| PixelBufferId(self.next_id()))
            .collect();
        for id in &ids {
            self.pixel_buffers.insert(*id, vec![0; len]);
        }
        Ok(ids)
    }

    fn read_pixels_to_buffer(&mut self, buffer: PixelBufferId, size: Size) -> GpuResult<()> {
        let mut data = self
            .pixel_buffers
            .remove(&buffer)
            .ok_or_else(|| GpuError::UnknownHandle(buffer.to_string()))?;
        let read = self.current_surface().map(|surface| surface.read(size, &mut data));
        self.pixel_buffers.insert(buffer, data);
        read
    }

    fn map_pixel_buffer(&mut self, buffer: PixelBufferId, out: &mut Vec<u8>) -> GpuResult<()> {
        let data = self
            .pixel_buffers
            .get(&buffer)
            .ok_or_else(|| GpuError::UnknownHandle(buffer.to_string()))?;
        out.clear();
        out.extend_from_slice(data);
        Ok(())
    }

    fn delete_pixel_buffers(&mut self, buffers: &[PixelBufferId]) {
        for buffer in buffers {
            self.pixel_buffers.remove(buffer);
        }
    }

    fn release(&mut self) {
        debug!(
            surfaces = self.surfaces.len(),
            programs = self.programs.len(),
            "Releasing software graphics context"
        );
        self.programs.clear();
        self.surfaces.clear();
        self.pixel_buffers.clear();
        self.current = None;
    }
}
