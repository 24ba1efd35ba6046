// SPDX-License-Identifier: MPL-2.0

//! Frame fan-out pipelines
//!
//! Every camera frame is drawn by the render worker into up to three sinks,
//! in a fixed order within one job:
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────┐     ┌──────────────────┐
//! │ Camera Frame │ ──▶ │  Preview Sink     │ ──▶ │  Window Surface  │
//! │  (texture)   │     ├───────────────────┤     ├──────────────────┤
//! │              │ ──▶ │  Video Sink       │ ──▶ │  Encoder → MP4   │
//! │              │     ├───────────────────┤     ├──────────────────┤
//! │              │ ──▶ │  Analysis Sink    │ ──▶ │  RGBA callback   │
//! └──────────────┘     └───────────────────┘     └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`distributor`]: Owns the render worker and routes frames to the sinks
//! - [`analysis`]: Offscreen rendering and readback with single-image backpressure
//! - [`video`]: Encoders, muxing and the recording state machine

pub mod analysis;
pub mod distributor;
pub mod video;
