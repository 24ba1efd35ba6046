// SPDX-License-Identifier: MPL-2.0

//! Concrete implementations of the graphics and media capability traits
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               FrameDistributor               │
//! └───────┬───────────────────────────┬──────────┘
//!         │ GraphicsContext           │ MediaBackend
//! ┌───────┴──────────┐      ┌─────────┴──────────┐
//! │   WgpuGraphics   │      │  GstMediaBackend   │
//! │ (SoftwareGraphics│      │ encoder/capture/mux│
//! │    in tests)     │      └────────────────────┘
//! └───────▲──────────┘
//!         │ TextureStore
//! ┌───────┴──────────┐
//! │ TestPatternCamera│
//! └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`wgpu_graphics`]: Headless wgpu render passes and staging-buffer readback
//! - [`software`]: CPU reference context for pixel-exact tests
//! - [`texture_store`]: Camera textures shared with the frame producer
//! - [`gstreamer`]: H.264/AAC encoders, microphone capture and MP4 muxing
//! - [`test_pattern`]: Synthetic camera driving the distributor

pub mod gstreamer;
pub mod software;
pub mod test_pattern;
pub mod texture_store;
pub mod wgpu_graphics;

pub use self::gstreamer::GstMediaBackend;
pub use software::SoftwareGraphics;
pub use texture_store::TextureStore;
pub use wgpu_graphics::WgpuGraphics;
pub use test_pattern::TestPatternCamera;
