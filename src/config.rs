// SPDX-License-Identifier: GPL-3.0-only

//! Sink and recording configuration
//!
//! Everything here is plain data: sinks read their configuration once when
//! they are constructed, and recording sessions are resolved against the
//! active frame size when they enter a pipeline. Nothing is persisted; the
//! CLI can load a [`RecordingSession`] from JSON.

use crate::constants::{MATCH_SENTINEL, defaults};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Pixel dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Width and height exchanged
    pub const fn transposed(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    /// Number of bytes needed to hold an RGBA image of this size
    pub fn rgba_len(self) -> usize {
        self.width as usize * self.height as usize * crate::constants::BYTES_PER_PIXEL
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Normalized crop rectangle, origin top-left, all values in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Crop {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for Crop {
    fn default() -> Self {
        Self::FULL
    }
}

impl Crop {
    /// The whole frame
    pub const FULL: Crop = Crop {
        x: 0.0,
        y: 0.0,
        width: 1.0,
        height: 1.0,
    };

    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Pixel size of the cropped region of `base`, truncated toward zero
    pub fn crop_size(&self, base: Size) -> Size {
        Size::new(
            (base.width as f32 * self.width) as u32,
            (base.height as f32 * self.height) as u32,
        )
    }

    /// Check that the rectangle lies inside the unit square and is not empty
    pub fn validate(&self) -> Result<(), String> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !in_unit(self.x) || !in_unit(self.y) {
            return Err(format!("crop origin ({}, {}) outside [0, 1]", self.x, self.y));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(format!(
                "crop size {}x{} must be positive",
                self.width, self.height
            ));
        }
        if self.x + self.width > 1.0 + f32::EPSILON || self.y + self.height > 1.0 + f32::EPSILON {
            return Err("crop extends past the frame edge".to_string());
        }
        Ok(())
    }
}

/// Mirror applied after cropping, in target space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorAxis {
    #[default]
    None,
    Horizontal,
    Vertical,
    Both,
}

impl MirrorAxis {
    /// Horizontal and vertical exchanged; used when the source is transposed
    pub fn swapped(self) -> Self {
        match self {
            MirrorAxis::Horizontal => MirrorAxis::Vertical,
            MirrorAxis::Vertical => MirrorAxis::Horizontal,
            other => other,
        }
    }
}

impl std::str::FromStr for MirrorAxis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(MirrorAxis::None),
            "horizontal" | "h" => Ok(MirrorAxis::Horizontal),
            "vertical" | "v" => Ok(MirrorAxis::Vertical),
            "both" => Ok(MirrorAxis::Both),
            other => Err(format!("unknown mirror axis '{}'", other)),
        }
    }
}

/// Display rotation relative to the sensor, in quarter turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Convert a multiple of 90 degrees (any sign) into a rotation
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// True for 90 and 270, where the frame's width and height swap
    pub fn is_transposed(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

impl TryFrom<i32> for Rotation {
    type Error = String;

    fn try_from(degrees: i32) -> Result<Self, Self::Error> {
        Rotation::from_degrees(degrees)
            .ok_or_else(|| format!("rotation must be a multiple of 90, got {}", degrees))
    }
}

impl From<Rotation> for i32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// Per-sink transform; the source rotation is bound when the sink is built
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfiguration {
    pub crop: Crop,
    pub mirror: MirrorAxis,
    pub edge_detect: bool,
}

impl SinkConfiguration {
    pub fn with_crop(mut self, crop: Crop) -> Self {
        self.crop = crop;
        self
    }

    pub fn with_mirror(mut self, mirror: MirrorAxis) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn with_edge_detect(mut self, edge_detect: bool) -> Self {
        self.edge_detect = edge_detect;
        self
    }
}

/// Configuration for the whole fan-out
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    pub preview: SinkConfiguration,
    pub video: SinkConfiguration,
    pub analysis: SinkConfiguration,
    /// Rotate the preview to compensate for sensor orientation
    pub normalize_preview: bool,
}

/// Information about the camera feeding the distributor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Frame size as delivered by the sensor
    pub resolution: Size,
    /// Current display rotation
    pub rotation: Rotation,
    /// Fixed mounting orientation of the sensor
    pub sensor_orientation: Rotation,
}

impl SourceInfo {
    /// Sensor resolution in display orientation
    pub fn adjusted_base(&self) -> Size {
        if self.rotation.is_transposed() {
            self.resolution.transposed()
        } else {
            self.resolution
        }
    }
}

/// One side of a recorded video, either fixed or resolved from the frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Dimension {
    /// Use the active frame size
    Match,
    Pixels(u32),
}

impl Dimension {
    pub fn resolve(self, active: u32) -> u32 {
        match self {
            Dimension::Match => active,
            Dimension::Pixels(px) => px,
        }
    }
}

impl From<i32> for Dimension {
    fn from(value: i32) -> Self {
        if value < 0 {
            Dimension::Match
        } else {
            Dimension::Pixels(value as u32)
        }
    }
}

impl From<Dimension> for i32 {
    fn from(value: Dimension) -> Self {
        match value {
            Dimension::Match => MATCH_SENTINEL,
            Dimension::Pixels(px) => px as i32,
        }
    }
}

/// Video track parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSpec {
    pub width: Dimension,
    pub height: Dimension,
    /// Bits per second
    pub bitrate: u32,
}

impl Default for VideoSpec {
    fn default() -> Self {
        Self {
            width: Dimension::Pixels(defaults::VIDEO_WIDTH),
            height: Dimension::Pixels(defaults::VIDEO_HEIGHT),
            bitrate: defaults::VIDEO_BITRATE,
        }
    }
}

impl VideoSpec {
    /// Video that follows the size of the video sink's output
    pub fn matching(bitrate: u32) -> Self {
        Self {
            width: Dimension::Match,
            height: Dimension::Match,
            bitrate,
        }
    }

    /// Replace `Match` dimensions with the corresponding side of `active`
    pub fn resolve(&self, active: Size) -> Size {
        Size::new(
            self.width.resolve(active.width),
            self.height.resolve(active.height),
        )
    }
}

/// Audio channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioChannels {
    Mono,
    #[default]
    Stereo,
}

impl AudioChannels {
    pub fn count(self) -> u32 {
        match self {
            AudioChannels::Mono => 1,
            AudioChannels::Stereo => 2,
        }
    }
}

/// Audio track parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: AudioChannels,
    /// Bits per second
    pub bitrate: u32,
}

impl Default for AudioSpec {
    fn default() -> Self {
        Self {
            sample_rate: defaults::AUDIO_SAMPLE_RATE,
            channels: AudioChannels::Stereo,
            bitrate: defaults::AUDIO_BITRATE,
        }
    }
}

/// A requested recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub output: PathBuf,
    #[serde(default)]
    pub video: VideoSpec,
    #[serde(default)]
    pub audio: Option<AudioSpec>,
}

impl RecordingSession {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            video: VideoSpec::default(),
            audio: None,
        }
    }

    pub fn with_video(mut self, video: VideoSpec) -> Self {
        self.video = video;
        self
    }

    pub fn with_audio(mut self, audio: AudioSpec) -> Self {
        self.audio = Some(audio);
        self
    }

    /// Load a session description from a JSON file
    pub fn load(path: &std::path::Path) -> Result<Self, crate::errors::AppError> {
        let text = std::fs::read_to_string(path)?;
        let session = serde_json::from_str(&text)?;
        Ok(session)
    }
}
