// SPDX-License-Identifier: GPL-3.0-only

//! wgpu implementation of the graphics context
//!
//! Runs headless: every surface is an `Rgba8Unorm` render target. Window
//! and encoder surfaces are read back on swap and handed to their
//! [`SurfaceTarget`], offscreen surfaces stay on the GPU until read.
//!
//! Camera frames arrive through the shared [`TextureStore`] and are
//! uploaded with `write_texture` the first time a draw sees a new
//! generation.
//!
//! Pixel buffers are `MAP_READ` staging buffers. Queuing a read encodes a
//! texture-to-buffer copy and requests the map without waiting; mapping
//! waits only for whatever part of that transfer is still in flight, which
//! for the double-buffered reader is the copy queued one frame earlier.

use super::texture_store::{Rgba, TextureStore};
use crate::constants::BYTES_PER_PIXEL;
use crate::errors::{GpuError, GpuResult};
use crate::gpu::{
    Capabilities, DrawParams, GraphicsContext, PixelBufferId, ProgramId, ProgramKind, Size,
    SurfaceId, SurfaceTarget, TextureId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use tracing::{debug, info, trace, warn};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

type MapResult = Result<(), wgpu::BufferAsyncError>;

/// Uniform block shared by both fragment stages (176 bytes)
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct DrawUniforms {
    mvp: [f32; 16],
    tex_matrix: [f32; 16],
    tex_coords: [f32; 8],
    /// xy: size of one source texel, zw: padding
    texel: [f32; 4],
}

fn extent(size: Size) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

fn create_texture(
    device: &wgpu::Device,
    label: &str,
    size: Size,
    usage: wgpu::TextureUsages,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: extent(size),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn create_staging_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback_staging"),
        size: size.max(1),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Ask for `buffer` to be mapped without waiting for it
fn request_map(buffer: &wgpu::Buffer) -> Receiver<MapResult> {
    let (tx, rx) = mpsc::channel();
    buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    rx
}

/// Block until a requested map has completed
fn wait_mapped(device: &wgpu::Device, rx: &Receiver<MapResult>) -> GpuResult<()> {
    let result = match rx.try_recv() {
        Ok(result) => result,
        Err(TryRecvError::Empty) => {
            device
                .poll(wgpu::PollType::wait_indefinitely())
                .map_err(|e| GpuError::Readback(format!("device poll failed: {:?}", e)))?;
            rx.recv()
                .map_err(|_| GpuError::Readback("map callback dropped".into()))?
        }
        Err(TryRecvError::Disconnected) => {
            return Err(GpuError::Readback("map callback dropped".into()));
        }
    };
    result.map_err(|e| GpuError::Readback(format!("buffer map failed: {}", e)))
}

/// Placement of a framebuffer region inside a staging buffer
///
/// The region is anchored at the bottom-left corner of the surface, like a
/// GL read. Parts of the request outside the surface read back as zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CopyLayout {
    surface_height: u32,
    requested: Size,
    copied: Size,
    padded_row: u32,
}

impl CopyLayout {
    fn new(surface: Size, requested: Size) -> Self {
        let copied = Size::new(
            requested.width.min(surface.width),
            requested.height.min(surface.height),
        );
        let row = copied.width.max(1) * BYTES_PER_PIXEL as u32;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        Self {
            surface_height: surface.height,
            requested,
            copied,
            padded_row: row.div_ceil(align) * align,
        }
    }

    fn buffer_size(&self) -> u64 {
        self.padded_row as u64 * self.copied.height.max(1) as u64
    }

    fn encode(&self, encoder: &mut wgpu::CommandEncoder, source: &wgpu::Texture, dst: &wgpu::Buffer) {
        if self.copied.is_empty() {
            return;
        }
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: source,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: self.surface_height - self.copied.height,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: dst,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_row),
                    rows_per_image: Some(self.copied.height),
                },
            },
            extent(self.copied),
        );
    }

    /// Strip row padding from mapped `data`, in bottom-first or top-first order
    fn unpack(&self, data: &[u8], bottom_first: bool, out: &mut Vec<u8>) {
        out.clear();
        out.resize(self.requested.rgba_len(), 0);

        let row_bytes = self.requested.width as usize * BYTES_PER_PIXEL;
        let copy_bytes = self.copied.width as usize * BYTES_PER_PIXEL;
        let copied_rows = self.copied.height as usize;
        let requested_rows = self.requested.height as usize;

        // Mapped rows are top first and cover the bottom of the request
        for row in 0..copied_rows {
            let src = row * self.padded_row as usize;
            let from_bottom = copied_rows - 1 - row;
            let dst_row = if bottom_first {
                from_bottom
            } else {
                requested_rows - 1 - from_bottom
            };
            let dst = dst_row * row_bytes;
            out[dst..dst + copy_bytes].copy_from_slice(&data[src..src + copy_bytes]);
        }
    }
}

struct PendingCopy {
    layout: CopyLayout,
    mapped: Receiver<MapResult>,
}

struct StagingBuffer {
    buffer: wgpu::Buffer,
    capacity: u64,
    pending: Option<PendingCopy>,
}

struct CameraTexture {
    view: wgpu::TextureView,
    texture: wgpu::Texture,
    size: Size,
    generation: u64,
}

struct RenderSurface {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: Size,
    target: Option<Arc<dyn SurfaceTarget>>,
}

/// Headless wgpu [`GraphicsContext`]
pub struct WgpuGraphics {
    device: wgpu::Device,
    queue: wgpu::Queue,
    store: TextureStore,
    shader: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    sampler: wgpu::Sampler,
    uniforms: wgpu::Buffer,
    textures: HashMap<TextureId, CameraTexture>,
    programs: HashMap<ProgramId, wgpu::RenderPipeline>,
    surfaces: HashMap<SurfaceId, RenderSurface>,
    pixel_buffers: HashMap<PixelBufferId, StagingBuffer>,
    current: Option<SurfaceId>,
    viewport: Size,
    next_id: u32,
}

impl WgpuGraphics {
    /// Open a device on the first suitable adapter
    ///
    /// Blocks on adapter and device requests, so call it from the render
    /// worker thread rather than from async code.
    pub fn new(store: TextureStore) -> GpuResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| GpuError::ContextInit(format!("no GPU adapter: {}", e)))?;

        let adapter_info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("camera_fanout_render"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| GpuError::ContextInit(format!("failed to create GPU device: {}", e)))?;

        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "GPU render context created"
        );

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("sink_quad_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("sink_quad.wgsl").into()),
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(GpuError::ContextInit(format!("sink shader: {}", error)));
        }

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("sink_quad_bind_group_layout"),
            entries: &[
                // Camera texture
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                // Sampler
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                // Draw uniforms
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("sink_quad_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("camera_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sink_quad_uniforms"),
            size: std::mem::size_of::<DrawUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            store,
            shader,
            bind_group_layout,
            pipeline_layout,
            sampler,
            uniforms,
            textures: HashMap::new(),
            programs: HashMap::new(),
            surfaces: HashMap::new(),
            pixel_buffers: HashMap::new(),
            current: None,
            viewport: Size::default(),
            next_id: 0,
        })
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn current_surface(&self) -> GpuResult<&RenderSurface> {
        let id = self
            .current
            .ok_or_else(|| GpuError::Draw("no current surface".into()))?;
        self.surfaces
            .get(&id)
            .ok_or_else(|| GpuError::UnknownHandle(id.to_string()))
    }

    fn insert_surface(&mut self, size: Size, target: Option<Arc<dyn SurfaceTarget>>) -> SurfaceId {
        let (texture, view) = create_texture(
            &self.device,
            "render_surface",
            size,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let id = SurfaceId(self.next_id());
        self.surfaces.insert(
            id,
            RenderSurface {
                texture,
                view,
                size,
                target,
            },
        );
        id
    }

    /// Upload the producer's latest frame if the GPU copy is stale
    fn sync_texture(&mut self, id: TextureId) -> GpuResult<Size> {
        let images = self.store.images();
        let image = images
            .get(&id)
            .ok_or_else(|| GpuError::UnknownHandle(id.to_string()))?;

        if let Some(current) = self.textures.get(&id)
            && current.generation == image.generation
        {
            return Ok(current.size);
        }

        let black = [Rgba::BLACK];
        let (size, pixels) = if image.size.is_empty() {
            (Size::new(1, 1), &black[..])
        } else {
            (image.size, &image.pixels[..])
        };

        if self.textures.get(&id).is_none_or(|current| current.size != size) {
            trace!(texture = %id, %size, "Allocating camera texture");
            let (texture, view) = create_texture(
                &self.device,
                "camera_texture",
                size,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            );
            self.textures.insert(
                id,
                CameraTexture {
                    view,
                    texture,
                    size,
                    generation: 0,
                },
            );
        }

        let Some(camera) = self.textures.get_mut(&id) else {
            return Err(GpuError::UnknownHandle(id.to_string()));
        };
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &camera.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(pixels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.width * BYTES_PER_PIXEL as u32),
                rows_per_image: Some(size.height),
            },
            extent(size),
        );
        camera.generation = image.generation;
        Ok(size)
    }

    /// Copy a region of the current surface and wait for it
    fn read_blocking(&self, size: Size, bottom_first: bool, out: &mut Vec<u8>) -> GpuResult<()> {
        let surface = self.current_surface()?;
        let layout = CopyLayout::new(surface.size, size);
        let staging = create_staging_buffer(&self.device, layout.buffer_size());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });
        layout.encode(&mut encoder, &surface.texture, &staging);
        self.queue.submit(std::iter::once(encoder.finish()));

        let mapped = request_map(&staging);
        wait_mapped(&self.device, &mapped)?;
        {
            let data = staging.slice(..).get_mapped_range();
            layout.unpack(&data, bottom_first, out);
        }
        staging.unmap();
        Ok(())
    }
}

impl GraphicsContext for WgpuGraphics {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            async_readback: true,
            edge_detect: true,
        }
    }

    fn create_texture(&mut self) -> GpuResult<TextureId> {
        Ok(self.store.allocate())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
        self.store.remove(texture);
    }

    fn create_program(&mut self, kind: ProgramKind) -> GpuResult<ProgramId> {
        let (label, fragment) = match kind {
            ProgramKind::PassThrough => ("pass_through_pipeline", "fs_pass_through"),
            ProgramKind::EdgeDetect => ("edge_detect_pipeline", "fs_edge"),
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.shader,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleStrip,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &self.shader,
                    entry_point: Some(fragment),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: TARGET_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                multiview: None,
                cache: None,
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::ProgramCompile(format!("{}: {}", label, error)));
        }

        let id = ProgramId(self.next_id());
        self.programs.insert(id, pipeline);
        debug!(program = %id, ?kind, "Render pipeline created");
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
        Ok(self.insert_surface(size, Some(target)))
    }

    fn create_offscreen_surface(&mut self, size: Size) -> GpuResult<SurfaceId> {
        if size.is_empty() {
            return Err(GpuError::Surface(format!("offscreen surface of size {}", size)));
        }
        Ok(self.insert_surface(size, None))
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
        if let Some(removed) = self.surfaces.remove(&surface) {
            removed.texture.destroy();
        }
        if self.current == Some(surface) {
            self.current = None;
        }
    }

    fn make_current(&mut self, surface: SurfaceId) -> GpuResult<()> {
        let target = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| GpuError::UnknownHandle(surface.to_string()))?;

        // Window surfaces follow their target's size
        if let Some(window) = &target.target {
            let size = window.size();
            if size != target.size && !size.is_empty() {
                trace!(from = %target.size, to = %size, "Window surface resized");
                let (texture, view) = create_texture(
                    &self.device,
                    "render_surface",
                    size,
                    wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                );
                target.texture.destroy();
                target.texture = texture;
                target.view = view;
                target.size = size;
            }
        }
        self.current = Some(surface);
        Ok(())
    }

    fn set_viewport(&mut self, size: Size) {
        self.viewport = size;
    }

    fn draw(&mut self, params: &DrawParams) -> GpuResult<()> {
        let texture_size = self.sync_texture(params.texture)?;
        let pipeline = self
            .programs
            .get(&params.program)
            .ok_or_else(|| GpuError::UnknownHandle(params.program.to_string()))?;
        let camera = self
            .textures
            .get(&params.texture)
            .ok_or_else(|| GpuError::UnknownHandle(params.texture.to_string()))?;
        let surface = self.current_surface()?;

        let width = self.viewport.width.min(surface.size.width);
        let height = self.viewport.height.min(surface.size.height);
        if width == 0 || height == 0 {
            return Ok(());
        }

        let uniforms = DrawUniforms {
            mvp: params.mvp,
            tex_matrix: params.tex_matrix,
            tex_coords: params.tex_coords,
            texel: [
                1.0 / texture_size.width as f32,
                1.0 / texture_size.height as f32,
                0.0,
                0.0,
            ],
        };
        self.queue
            .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&uniforms));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("sink_quad_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&camera.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.uniforms.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("sink_draw_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("sink_draw_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &surface.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            // Viewport origin is the bottom-left corner, as in GL
            pass.set_viewport(
                0.0,
                (surface.size.height - height) as f32,
                width as f32,
                height as f32,
                0.0,
                1.0,
            );
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, Some(&bind_group), &[]);
            pass.draw(0..4, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn swap_buffers(&mut self) -> GpuResult<()> {
        let surface = self.current_surface()?;
        let Some(target) = surface.target.clone() else {
            return Ok(());
        };
        let size = surface.size;

        let mut frame = Vec::with_capacity(size.rgba_len());
        self.read_blocking(size, false, &mut frame)?;
        target.present(&frame, size)
    }

    fn read_pixels(&mut self, size: Size, out: &mut Vec<u8>) -> GpuResult<()> {
        self.read_blocking(size, true, out)
    }

    fn create_pixel_buffers(&mut self, count: usize, len: usize) -> GpuResult<Vec<PixelBufferId>> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = PixelBufferId(self.next_id());
            self.pixel_buffers.insert(
                id,
                StagingBuffer {
                    buffer: create_staging_buffer(&self.device, len as u64),
                    capacity: len as u64,
                    pending: None,
                },
            );
            ids.push(id);
        }
        debug!(count, len, "Readback staging buffers created");
        Ok(ids)
    }

    fn read_pixels_to_buffer(&mut self, buffer: PixelBufferId, size: Size) -> GpuResult<()> {
        let id = self
            .current
            .ok_or_else(|| GpuError::Draw("no current surface".into()))?;
        let surface = self
            .surfaces
            .get(&id)
            .ok_or_else(|| GpuError::UnknownHandle(id.to_string()))?;
        let staging = self
            .pixel_buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::UnknownHandle(buffer.to_string()))?;

        // A copy that was never mapped still owns the buffer
        if let Some(stale) = staging.pending.take() {
            match wait_mapped(&self.device, &stale.mapped) {
                Ok(()) => staging.buffer.unmap(),
                Err(e) => warn!(%buffer, error = %e, "Discarding unmapped readback"),
            }
        }

        let layout = CopyLayout::new(surface.size, size);
        if staging.capacity < layout.buffer_size() {
            staging.buffer = create_staging_buffer(&self.device, layout.buffer_size());
            staging.capacity = layout.buffer_size();
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("async_readback_encoder"),
            });
        layout.encode(&mut encoder, &surface.texture, &staging.buffer);
        self.queue.submit(std::iter::once(encoder.finish()));

        let mapped = request_map(&staging.buffer);
        let _ = self.device.poll(wgpu::PollType::Poll);
        staging.pending = Some(PendingCopy { layout, mapped });
        Ok(())
    }

    fn map_pixel_buffer(&mut self, buffer: PixelBufferId, out: &mut Vec<u8>) -> GpuResult<()> {
        let staging = self
            .pixel_buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::UnknownHandle(buffer.to_string()))?;
        let pending = staging
            .pending
            .take()
            .ok_or_else(|| GpuError::Readback(format!("{} has no queued copy", buffer)))?;

        wait_mapped(&self.device, &pending.mapped)?;
        {
            let data = staging.buffer.slice(..).get_mapped_range();
            pending.layout.unpack(&data, true, out);
        }
        staging.buffer.unmap();
        Ok(())
    }

    fn delete_pixel_buffers(&mut self, buffers: &[PixelBufferId]) {
        for id in buffers {
            if let Some(staging) = self.pixel_buffers.remove(id) {
                staging.buffer.destroy();
            }
        }
    }

    fn release(&mut self) {
        debug!(
            surfaces = self.surfaces.len(),
            programs = self.programs.len(),
            textures = self.textures.len(),
            "Releasing GPU render context"
        );
        self.current = None;
        self.programs.clear();
        for (_, surface) in self.surfaces.drain() {
            surface.texture.destroy();
        }
        for (_, camera) in self.textures.drain() {
            camera.texture.destroy();
        }
        for (_, staging) in self.pixel_buffers.drain() {
            staging.buffer.destroy();
        }
    }
}
