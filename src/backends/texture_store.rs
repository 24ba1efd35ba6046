// SPDX-License-Identifier: GPL-3.0-only

//! Camera textures shared between a frame producer and the render worker
//!
//! The producer writes RGBA frames, top row first. Each write bumps the
//! image's generation so a graphics context can tell whether its own copy
//! of the texture is stale.

use crate::errors::{GpuError, GpuResult};
use crate::gpu::{Size, TextureId};
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const BLACK: Rgba = Rgba::new(0, 0, 0, 255);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

impl From<[u8; 4]> for Rgba {
    fn from([r, g, b, a]: [u8; 4]) -> Self {
        Self { r, g, b, a }
    }
}

#[derive(Default)]
pub(crate) struct TextureImage {
    pub(crate) size: Size,
    /// Top row first
    pub(crate) pixels: Vec<Rgba>,
    /// Incremented on every write
    pub(crate) generation: u64,
}

#[derive(Default)]
struct StoreInner {
    images: Mutex<HashMap<TextureId, TextureImage>>,
    next_id: AtomicU32,
}

/// Textures shared between the render worker and the frame producer
#[derive(Clone, Default)]
pub struct TextureStore {
    inner: Arc<StoreInner>,
}

impl TextureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn images(&self) -> MutexGuard<'_, HashMap<TextureId, TextureImage>> {
        self.inner
            .images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn allocate(&self) -> TextureId {
        let id = TextureId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.images().insert(id, TextureImage::default());
        id
    }

    pub(crate) fn remove(&self, texture: TextureId) {
        self.images().remove(&texture);
    }

    fn write(
        &self,
        texture: TextureId,
        size: Size,
        fill: impl FnOnce(&mut Vec<Rgba>),
    ) -> GpuResult<()> {
        let mut images = self.images();
        let image = images
            .get_mut(&texture)
            .ok_or_else(|| GpuError::UnknownHandle(texture.to_string()))?;
        image.size = size;
        image.pixels.clear();
        fill(&mut image.pixels);
        image.generation += 1;
        Ok(())
    }

    /// Replace the contents of `texture` with RGBA `pixels`, top row first
    pub fn upload(&self, texture: TextureId, size: Size, pixels: &[u8]) -> GpuResult<()> {
        if pixels.len() != size.rgba_len() {
            return Err(GpuError::Draw(format!(
                "{} bytes uploaded for a {} texture",
                pixels.len(),
                size
            )));
        }
        self.write(texture, size, |dst| {
            dst.extend_from_slice(bytemuck::cast_slice::<u8, Rgba>(pixels))
        })
    }

    /// Fill `texture` with one colour
    pub fn fill(&self, texture: TextureId, size: Size, color: [u8; 4]) -> GpuResult<()> {
        self.write(texture, size, |dst| {
            dst.resize(size.width as usize * size.height as usize, color.into())
        })
    }

    /// Generation of the last write to `texture`, zero if never written
    pub fn generation(&self, texture: TextureId) -> GpuResult<u64> {
        self.images()
            .get(&texture)
            .map(|image| image.generation)
            .ok_or_else(|| GpuError::UnknownHandle(texture.to_string()))
    }
}
