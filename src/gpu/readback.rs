// SPDX-License-Identifier: GPL-3.0-only

//! Framebuffer to CPU pixel transfer
//!
//! The strategy is chosen once from the context's capability query:
//!
//! - [`PixelReader::Direct`] blocks on every read and always has data.
//! - [`PixelReader::DoubleBuffered`] queues an asynchronous copy into one
//!   of two transfer buffers and returns the copy queued on the previous
//!   call. The very first call therefore has nothing to return.

use super::{GraphicsContext, PixelBufferId, Size};
use crate::constants::READBACK_BUFFER_COUNT;
use crate::errors::{GpuError, GpuResult};
use tracing::debug;

pub enum PixelReader {
    Direct {
        size: Size,
    },
    DoubleBuffered {
        size: Size,
        buffers: Vec<PixelBufferId>,
        current: usize,
        primed: bool,
    },
}

impl PixelReader {
    /// Pick a strategy for reading images of `size` from `ctx`
    pub fn new(ctx: &mut dyn GraphicsContext, size: Size) -> GpuResult<Self> {
        if ctx.capabilities().async_readback {
            let buffers = ctx.create_pixel_buffers(READBACK_BUFFER_COUNT, size.rgba_len())?;
            debug!(%size, "Using double-buffered readback");
            Ok(PixelReader::DoubleBuffered {
                size,
                buffers,
                current: 0,
                primed: false,
            })
        } else {
            debug!(%size, "Using direct readback");
            Ok(PixelReader::Direct { size })
        }
    }

    pub fn is_double_buffered(&self) -> bool {
        matches!(self, PixelReader::DoubleBuffered { .. })
    }

    /// Read the current framebuffer
    ///
    /// Returns `true` when `out` now holds a complete image.
    pub fn read_into(&mut self, ctx: &mut dyn GraphicsContext, out: &mut Vec<u8>) -> GpuResult<bool> {
        match self {
            PixelReader::Direct { size } => {
                ctx.read_pixels(*size, out)?;
                Ok(true)
            }
            PixelReader::DoubleBuffered {
                size,
                buffers,
                current,
                primed,
            } => {
                if buffers.is_empty() {
                    return Err(GpuError::Readback("pixel buffers already released".into()));
                }
                ctx.read_pixels_to_buffer(buffers[*current], *size)?;
                *current = (*current + 1) % buffers.len();

                if *primed {
                    ctx.map_pixel_buffer(buffers[*current], out)?;
                    Ok(true)
                } else {
                    *primed = true;
                    Ok(false)
                }
            }
        }
    }

    pub fn release(&mut self, ctx: &mut dyn GraphicsContext) {
        if let PixelReader::DoubleBuffered { buffers, .. } = self {
            ctx.delete_pixel_buffers(buffers);
            buffers.clear();
        }
    }
}
