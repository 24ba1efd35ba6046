// SPDX-License-Identifier: MPL-2.0

//! Error types for the frame fan-out engine
//!
//! Each layer has its own error enum so callers can tell a graphics failure
//! (fatal for the render worker) apart from a media failure (fatal for one
//! recording session) without string matching.

use crate::media::TrackKind;
use std::fmt;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for graphics operations
pub type GpuResult<T> = Result<T, GpuError>;

/// Result type alias for codec, capture and container operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Result type alias for recording session operations
pub type RecordingResult<T> = Result<T, RecordingError>;

/// Top level error returned by the binary and the library entry points
#[derive(Debug, Clone)]
pub enum AppError {
    /// Graphics errors
    Gpu(GpuError),
    /// Encoder, capture and container errors
    Media(MediaError),
    /// Recording session errors
    Recording(RecordingError),
    /// Configuration errors
    Config(String),
    /// Generic error with message
    Other(String),
}

/// Graphics context and render worker errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Context bootstrap failed
    ContextInit(String),
    /// A draw program failed to compile or link
    ProgramCompile(String),
    /// A draw call failed
    Draw(String),
    /// Surface creation or presentation failed
    Surface(String),
    /// Reading pixels back from the framebuffer failed
    Readback(String),
    /// An operation referenced a handle the context does not know
    UnknownHandle(String),
    /// The worker was released or stopped after a fatal error
    Released,
}

/// Codec, audio capture and container errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// No element or codec available for the requested format
    Unavailable(String),
    /// Configuring a codec failed
    Configure(String),
    /// Runtime codec failure
    Codec(String),
    /// Container muxer failure
    Container(String),
    /// Audio capture failure
    Capture(String),
}

/// Recording session errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingError {
    /// The encoder reported a second output format change for a track
    DuplicateFormatChange(TrackKind),
    /// A track was registered twice or after the container started
    TrackRegistration(String),
    /// Media layer failure
    Media(MediaError),
    /// Graphics failure while preparing the video surface
    Gpu(GpuError),
    /// The render worker went away before the session finished
    WorkerUnavailable,
    /// A drain loop task panicked or was cancelled
    LoopAborted(String),
    /// Stop was requested while no session was active
    NotRecording,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Gpu(e) => write!(f, "Graphics error: {}", e),
            AppError::Media(e) => write!(f, "Media error: {}", e),
            AppError::Recording(e) => write!(f, "Recording error: {}", e),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::ContextInit(msg) => write!(f, "Context initialization failed: {}", msg),
            GpuError::ProgramCompile(msg) => write!(f, "Program compilation failed: {}", msg),
            GpuError::Draw(msg) => write!(f, "Draw failed: {}", msg),
            GpuError::Surface(msg) => write!(f, "Surface error: {}", msg),
            GpuError::Readback(msg) => write!(f, "Pixel readback failed: {}", msg),
            GpuError::UnknownHandle(msg) => write!(f, "Unknown handle: {}", msg),
            GpuError::Released => write!(f, "Render worker released"),
        }
    }
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::Unavailable(msg) => write!(f, "Not available: {}", msg),
            MediaError::Configure(msg) => write!(f, "Configuration failed: {}", msg),
            MediaError::Codec(msg) => write!(f, "Codec error: {}", msg),
            MediaError::Container(msg) => write!(f, "Container error: {}", msg),
            MediaError::Capture(msg) => write!(f, "Audio capture error: {}", msg),
        }
    }
}

impl fmt::Display for RecordingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordingError::DuplicateFormatChange(kind) => {
                write!(f, "{} encoder changed output format twice", kind)
            }
            RecordingError::TrackRegistration(msg) => {
                write!(f, "Track registration failed: {}", msg)
            }
            RecordingError::Media(e) => write!(f, "{}", e),
            RecordingError::Gpu(e) => write!(f, "{}", e),
            RecordingError::WorkerUnavailable => write!(f, "Render worker unavailable"),
            RecordingError::LoopAborted(msg) => write!(f, "Drain loop aborted: {}", msg),
            RecordingError::NotRecording => write!(f, "No recording in progress"),
        }
    }
}

impl std::error::Error for AppError {}
impl std::error::Error for GpuError {}
impl std::error::Error for MediaError {}
impl std::error::Error for RecordingError {}

// Conversions from sub-errors to AppError
impl From<GpuError> for AppError {
    fn from(err: GpuError) -> Self {
        AppError::Gpu(err)
    }
}

impl From<MediaError> for AppError {
    fn from(err: MediaError) -> Self {
        AppError::Media(err)
    }
}

impl From<RecordingError> for AppError {
    fn from(err: RecordingError) -> Self {
        AppError::Recording(err)
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Other(err.to_string())
    }
}

// Conversions into RecordingError
impl From<MediaError> for RecordingError {
    fn from(err: MediaError) -> Self {
        RecordingError::Media(err)
    }
}

impl From<GpuError> for RecordingError {
    fn from(err: GpuError) -> Self {
        match err {
            GpuError::Released => RecordingError::WorkerUnavailable,
            other => RecordingError::Gpu(other),
        }
    }
}

impl From<tokio::task::JoinError> for RecordingError {
    fn from(err: tokio::task::JoinError) -> Self {
        RecordingError::LoopAborted(err.to_string())
    }
}
