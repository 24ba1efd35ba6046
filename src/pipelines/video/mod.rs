// SPDX-License-Identifier: MPL-2.0

//! Video and audio recording pipeline
//!
//! This module provides the recording side of the fan-out:
//! - Encoder wrappers that poll hardware encoders without blocking
//! - A muxer front that starts the container once every track is known
//! - The per-session recorder running one drain task per track
//! - The recording state machine exposed to callers

pub mod controller;
pub mod encoder;
pub mod handler;
pub mod muxer;
pub mod recorder;

// Re-export commonly used types
pub use controller::{RecordingController, RecordingState, RecordingTarget, StopHandle};
pub use handler::VideoHandler;
pub use muxer::MuxSynchronizer;
pub use recorder::Recorder;
