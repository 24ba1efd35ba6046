// SPDX-License-Identifier: MPL-2.0

//! GStreamer implementation of the media capability traits
//!
//! Each encoder is a small pipeline of its own (`appsrc ! ... ! appsink`)
//! so it can be polled the way a hardware codec queue is. The container is
//! a separate `mp4mux` pipeline fed from one `appsrc` per track.

mod capture;
mod encoder;
mod muxer;

pub use capture::GstAudioCapture;
pub use encoder::{GstEncoder, GstInputSurface};
pub use muxer::GstMuxer;

use crate::config::AudioSpec;
use crate::constants::{AUDIO_MIME_AAC, VIDEO_MIME_AVC};
use crate::errors::{MediaError, MediaResult};
use crate::media::{AudioCapture, ContainerMuxer, HardwareEncoder, MediaBackend, TrackKind};
use gstreamer as gst;
use gstreamer::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// H.264 encoders in order of preference, hardware first
pub const VIDEO_ENCODERS: &[&str] = &[
    "vah264enc",
    "vaapih264enc",
    "nvh264enc",
    "v4l2h264enc",
    "x264enc",
    "openh264enc",
];

/// AAC encoders in order of preference
pub const AUDIO_ENCODERS: &[&str] = &["avenc_aac", "fdkaacenc", "voaacenc", "faac"];

/// Audio sources in order of preference
pub const AUDIO_SOURCES: &[&str] = &["pipewiresrc", "pulsesrc", "autoaudiosrc"];

/// Check if a specific GStreamer element is available
pub fn is_element_available(element_name: &str) -> bool {
    if gst::init().is_err() {
        return false;
    }
    gst::ElementFactory::find(element_name).is_some()
}

fn detect(kind: &str, candidates: &[&str]) -> Vec<String> {
    let available: Vec<String> = candidates
        .iter()
        .filter(|name| {
            let found = is_element_available(name);
            if found {
                debug!("{} element available: {}", kind, name);
            }
            found
        })
        .map(|name| name.to_string())
        .collect();

    info!("Detected {} {} elements", available.len(), kind);
    available
}

/// Available H.264 encoders, best first
pub fn detect_video_encoders() -> Vec<String> {
    detect("video encoder", VIDEO_ENCODERS)
}

/// Available AAC encoders, best first
pub fn detect_audio_encoders() -> Vec<String> {
    detect("audio encoder", AUDIO_ENCODERS)
}

/// First available element out of `candidates`
pub(crate) fn first_available(candidates: &[&'static str]) -> Option<&'static str> {
    candidates
        .iter()
        .copied()
        .find(|name| is_element_available(name))
}

pub(crate) fn make_element(factory: &str, name: &str) -> MediaResult<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| MediaError::Unavailable(format!("{}: {}", factory, e)))
}

/// Set a property from its string form if the element has it
///
/// Encoder plugins disagree on property names and units, so missing
/// properties are skipped instead of treated as errors.
pub(crate) fn set_if_present(element: &gst::Element, property: &str, value: &str) {
    if element.find_property(property).is_some() {
        element.set_property_from_str(property, value);
        debug!(property, value, "Configured element property");
    }
}

/// Drain the bus for the first error message, if any
pub(crate) fn pending_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
        if let gst::MessageView::Error(err) = msg.view() {
            return Some(format!(
                "{} ({})",
                err.error(),
                err.debug().map(|d| d.to_string()).unwrap_or_default()
            ));
        }
    }
    None
}

/// Media backend built on GStreamer elements
#[derive(Debug, Clone)]
pub struct GstMediaBackend {
    _private: (),
}

impl GstMediaBackend {
    pub fn new() -> MediaResult<Self> {
        gst::init().map_err(|e| MediaError::Unavailable(format!("GStreamer: {}", e)))?;
        info!(version = %gst::version_string(), "GStreamer initialized");
        Ok(Self { _private: () })
    }
}

impl MediaBackend for GstMediaBackend {
    fn create_encoder(&self, mime: &str) -> MediaResult<Box<dyn HardwareEncoder>> {
        let kind = match mime {
            VIDEO_MIME_AVC => TrackKind::Video,
            AUDIO_MIME_AAC => TrackKind::Audio,
            other => {
                return Err(MediaError::Unavailable(format!(
                    "no encoder for {}",
                    other
                )));
            }
        };
        Ok(Box::new(GstEncoder::new(kind)))
    }

    fn create_audio_capture(&self, spec: &AudioSpec) -> MediaResult<Box<dyn AudioCapture>> {
        Ok(Box::new(GstAudioCapture::new(spec)?))
    }

    fn create_muxer(&self, output: &Path) -> MediaResult<Box<dyn ContainerMuxer>> {
        Ok(Box::new(GstMuxer::new(output)?))
    }
}
