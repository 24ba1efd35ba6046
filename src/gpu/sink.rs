// SPDX-License-Identifier: GPL-3.0-only

//! A draw program bound to one sink's texture quad

use super::transform::{Mat4, Quad, sink_quad};
use super::{DrawParams, GraphicsContext, ProgramId, ProgramKind, TextureId};
use crate::config::{Rotation, SinkConfiguration};
use crate::errors::{GpuError, GpuResult};
use tracing::debug;

/// Draws the camera texture with a fixed crop and mirror
///
/// The quad is computed once from the rotation at construction; later
/// rotation changes only affect the MVP matrix passed to [`Sink::draw`].
pub struct Sink {
    label: &'static str,
    program: Option<ProgramId>,
    tex_coords: Quad,
}

impl Sink {
    /// Compile the sink's program
    ///
    /// Fails if the program cannot be built, including when edge detection
    /// is requested from a context without derivative support.
    pub fn new(
        ctx: &mut dyn GraphicsContext,
        label: &'static str,
        rotation: Rotation,
        config: &SinkConfiguration,
    ) -> GpuResult<Self> {
        let kind = if config.edge_detect {
            ProgramKind::EdgeDetect
        } else {
            ProgramKind::PassThrough
        };

        if kind == ProgramKind::EdgeDetect && !ctx.capabilities().edge_detect {
            return Err(GpuError::ProgramCompile(format!(
                "{} sink: edge detection needs screen-space derivatives",
                label
            )));
        }

        let program = ctx.create_program(kind)?;
        let tex_coords = sink_quad(rotation, config);
        debug!(sink = label, ?kind, ?rotation, "Sink program ready");

        Ok(Self {
            label,
            program: Some(program),
            tex_coords,
        })
    }

    pub fn tex_coords(&self) -> &Quad {
        &self.tex_coords
    }

    /// Draw into whatever surface and viewport are current
    pub fn draw(
        &self,
        ctx: &mut dyn GraphicsContext,
        texture: TextureId,
        tex_matrix: &Mat4,
        mvp: &Mat4,
    ) -> GpuResult<()> {
        let program = self.program.ok_or_else(|| {
            GpuError::Draw(format!("{} sink used after release", self.label))
        })?;
        ctx.draw(&DrawParams {
            program,
            texture,
            tex_matrix: *tex_matrix,
            mvp: *mvp,
            tex_coords: self.tex_coords,
        })
    }

    /// Delete the program; safe to call more than once
    pub fn release(&mut self, ctx: &mut dyn GraphicsContext) {
        if let Some(program) = self.program.take() {
            ctx.delete_program(program);
        }
    }
}
