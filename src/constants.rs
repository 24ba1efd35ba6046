// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Encoder frame rate hint in frames per second
pub const FRAME_RATE: u32 = 30;

/// Seconds between forced key frames
pub const IFRAME_INTERVAL_SECS: u32 = 5;

/// Sentinel value in serialized sessions meaning "match the active frame size"
pub const MATCH_SENTINEL: i32 = -1;

/// RGBA, one byte per channel
pub const BYTES_PER_PIXEL: usize = 4;

/// Number of transfer buffers used by the double-buffered readback
pub const READBACK_BUFFER_COUNT: usize = 2;

/// Video track MIME type
pub const VIDEO_MIME_AVC: &str = "video/avc";

/// Audio track MIME type
pub const AUDIO_MIME_AAC: &str = "audio/mp4a-latm";

/// Default recording parameters
pub mod defaults {
    /// SD width used when a session does not specify one
    pub const VIDEO_WIDTH: u32 = 480;
    /// SD height used when a session does not specify one
    pub const VIDEO_HEIGHT: u32 = 360;
    /// 500 kbps
    pub const VIDEO_BITRATE: u32 = 500_000;
    /// CD sample rate
    pub const AUDIO_SAMPLE_RATE: u32 = 44_100;
    /// 128 kbps
    pub const AUDIO_BITRATE: u32 = 128_000;
}

/// Timing constants for the drain loops and pipeline teardown
pub mod timing {
    use super::Duration;

    /// Back-off for the video drain loop when the encoder has nothing ready
    pub const VIDEO_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Back-off for the audio drain loop when no audio or output is ready
    pub const AUDIO_POLL_INTERVAL: Duration = Duration::from_millis(5);

    /// Upper bound for waiting on end-of-stream when finalizing a container
    pub const EOS_TIMEOUT: Duration = Duration::from_secs(5);

    /// Timeout for pulling a sample from an encoder output sink
    pub const PULL_TIMEOUT: Duration = Duration::from_millis(0);

    /// Delay between test pattern frames (~30 fps)
    pub const TEST_PATTERN_FRAME_INTERVAL: Duration = Duration::from_millis(33);
}
