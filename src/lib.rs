// SPDX-License-Identifier: MPL-2.0

//! Camera frame fan-out
//!
//! One camera texture is drawn, per frame, into up to three sinks on a
//! dedicated render worker: a preview window, the input surface of a video
//! encoder, and an offscreen target whose pixels are read back for analysis.
//!
//! # Architecture
//!
//! - [`gpu`]: Graphics capability trait, render worker, transform math, readback
//! - [`pipelines`]: Frame distributor, analysis sink and the recording pipeline
//! - [`media`]: Encoder, audio capture and container capability traits
//! - [`backends`]: Software graphics, GStreamer media and a test pattern camera
//! - [`config`]: Sink configuration and recording sessions
//!
//! # Example
//!
//! ```ignore
//! let distributor = FrameDistributor::new(make_context, backend, config)?;
//! let binding = distributor.attach_source(source, None).await?;
//! let controller = RecordingController::new(Handle::current());
//! distributor.connect_recorder(controller.clone());
//! controller.start(RecordingSession::new("out.mp4"));
//! // ... camera calls distributor.on_frame_available(transform, ts) ...
//! let output = controller.stop().await?;
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod gpu;
pub mod media;
pub mod pipelines;

// Re-export commonly used types
pub use config::{
    AudioSpec, Crop, Dimension, DistributorConfig, MirrorAxis, RecordingSession, Rotation,
    SinkConfiguration, Size, SourceInfo, VideoSpec,
};
pub use errors::{AppError, AppResult, GpuError, MediaError, RecordingError};
pub use pipelines::analysis::{AnalysisImage, Analyzer};
pub use pipelines::distributor::{CameraBinding, FrameDistributor};
pub use pipelines::video::{RecordingController, RecordingState};
