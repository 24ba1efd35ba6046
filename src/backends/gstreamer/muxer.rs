// SPDX-License-Identifier: MPL-2.0

//! MP4 container writer fed with already-encoded samples

use super::{make_element, pending_error, set_if_present};
use crate::constants::timing::EOS_TIMEOUT;
use crate::constants::{AUDIO_MIME_AAC, VIDEO_MIME_AVC};
use crate::errors::{MediaError, MediaResult};
use crate::media::{BufferInfo, ContainerMuxer, MediaFormat};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::AppSrc;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Caps for a track: the encoder's own description when it has one
fn track_caps(format: &MediaFormat) -> MediaResult<gst::Caps> {
    if let Some(caps) = &format.caps {
        return caps
            .parse::<gst::Caps>()
            .map_err(|e| MediaError::Container(format!("Invalid track caps {}: {}", caps, e)));
    }
    match format.mime.as_str() {
        VIDEO_MIME_AVC => Ok(gst::Caps::builder("video/x-h264")
            .field("stream-format", "avc")
            .field("alignment", "au")
            .field("width", format.width as i32)
            .field("height", format.height as i32)
            .field("framerate", gst::Fraction::new(format.frame_rate as i32, 1))
            .build()),
        AUDIO_MIME_AAC => Ok(gst::Caps::builder("audio/mpeg")
            .field("mpegversion", 4i32)
            .field("stream-format", "raw")
            .field("rate", format.sample_rate as i32)
            .field("channels", format.channel_count as i32)
            .build()),
        other => Err(MediaError::Container(format!(
            "unsupported track type {}",
            other
        ))),
    }
}

/// Shared timeline for every track in the file
///
/// The first sample written on any track becomes zero. Later samples keep
/// their distance from it, so tracks that start at different times stay
/// in sync.
#[derive(Debug, Default, Clone, Copy)]
struct SessionClock {
    base_us: Option<i64>,
}

impl SessionClock {
    fn rebase(&mut self, presentation_time_us: i64) -> gst::ClockTime {
        let base = *self.base_us.get_or_insert(presentation_time_us);
        gst::ClockTime::from_useconds((presentation_time_us - base).max(0) as u64)
    }
}

/// [`ContainerMuxer`] writing an MP4 file through `mp4mux`
pub struct GstMuxer {
    output: PathBuf,
    pipeline: Option<gst::Pipeline>,
    mux: gst::Element,
    tracks: Vec<AppSrc>,
    clock: SessionClock,
    started: bool,
}

impl GstMuxer {
    pub fn new(output: &Path) -> MediaResult<Self> {
        let pipeline = gst::Pipeline::with_name("muxer");
        let mux = make_element("mp4mux", "mux")?;
        set_if_present(&mux, "faststart", "true");

        let location = output.to_string_lossy().into_owned();
        let sink = gst::ElementFactory::make("filesink")
            .name("file")
            .property("location", location.as_str())
            .build()
            .map_err(|e| MediaError::Container(format!("Failed to create filesink: {}", e)))?;

        pipeline
            .add_many([&mux, &sink])
            .map_err(|e| MediaError::Container(format!("Failed to add elements: {}", e)))?;
        mux.link(&sink)
            .map_err(|e| MediaError::Container(format!("Failed to link muxer: {}", e)))?;

        info!(output = %output.display(), "Created MP4 muxer");
        Ok(Self {
            output: output.to_path_buf(),
            pipeline: Some(pipeline),
            mux,
            tracks: Vec::new(),
            clock: SessionClock::default(),
            started: false,
        })
    }

    fn pipeline(&self) -> MediaResult<&gst::Pipeline> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| MediaError::Container("muxer released".into()))
    }

    /// Wait for the file to be finalized after end-of-stream
    fn wait_for_eos(&self, pipeline: &gst::Pipeline) -> MediaResult<()> {
        let Some(bus) = pipeline.bus() else {
            return Ok(());
        };
        let timeout = gst::ClockTime::from_mseconds(EOS_TIMEOUT.as_millis() as u64);
        match bus.timed_pop_filtered(
            timeout,
            &[gst::MessageType::Eos, gst::MessageType::Error],
        ) {
            Some(msg) => match msg.view() {
                gst::MessageView::Error(err) => Err(MediaError::Container(format!(
                    "{} ({})",
                    err.error(),
                    err.debug().map(|d| d.to_string()).unwrap_or_default()
                ))),
                _ => Ok(()),
            },
            None => {
                warn!(?EOS_TIMEOUT, "Timed out waiting for the container to finalize");
                Ok(())
            }
        }
    }
}

impl ContainerMuxer for GstMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> MediaResult<usize> {
        if self.started {
            return Err(MediaError::Container(
                "tracks must be added before start".into(),
            ));
        }
        let index = self.tracks.len();
        let caps = track_caps(format)?;
        let appsrc = AppSrc::builder()
            .name(format!("track-{}", index))
            .caps(&caps)
            .format(gst::Format::Time)
            .build();

        let pipeline = self.pipeline()?;
        pipeline
            .add(&appsrc)
            .map_err(|e| MediaError::Container(format!("Failed to add track source: {}", e)))?;
        appsrc
            .link(&self.mux)
            .map_err(|e| MediaError::Container(format!("Failed to link track {}: {}", index, e)))?;

        debug!(index, caps = %caps, "Added container track");
        self.tracks.push(appsrc);
        Ok(index)
    }

    fn start(&mut self) -> MediaResult<()> {
        let pipeline = self.pipeline()?;
        pipeline.set_state(gst::State::Playing).map_err(|e| {
            let detail = pending_error(pipeline).unwrap_or_default();
            MediaError::Container(format!("Failed to start muxer: {} {}", e, detail))
        })?;
        self.started = true;
        info!(tracks = self.tracks.len(), "Muxer started");
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> MediaResult<()> {
        if !self.started {
            return Err(MediaError::Container("muxer not started".into()));
        }
        let payload = info
            .payload(data)
            .ok_or_else(|| MediaError::Container("sample outside buffer".into()))?;
        let appsrc = self
            .tracks
            .get(track)
            .ok_or_else(|| MediaError::Container(format!("unknown track {}", track)))?;
        let pts = self.clock.rebase(info.presentation_time_us);

        let mut buffer = gst::Buffer::from_slice(payload.to_vec());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(pts);
            if !info.key_frame {
                buffer.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }
        appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| MediaError::Container(format!("Muxer rejected sample: {:?}", e)))
    }

    fn stop(&mut self) -> MediaResult<()> {
        let pipeline = self.pipeline()?.clone();
        if !self.started {
            let _ = pipeline.set_state(gst::State::Null);
            return Ok(());
        }
        self.started = false;

        for appsrc in &self.tracks {
            let _ = appsrc.end_of_stream();
        }
        let result = self.wait_for_eos(&pipeline);
        let _ = pipeline.set_state(gst::State::Null);
        if result.is_ok() {
            info!(output = %self.output.display(), "Container finalized");
        }
        result
    }

    fn release(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
        self.tracks.clear();
    }
}

impl Drop for GstMuxer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Size;

    #[test]
    fn test_caps_derived_without_encoder_description() {
        if gst::init().is_err() {
            return;
        }
        let format = MediaFormat::video(VIDEO_MIME_AVC, Size::new(320, 240), 500_000);
        let caps = track_caps(&format).unwrap();
        let s = caps.structure(0).unwrap();
        assert_eq!(s.name().as_str(), "video/x-h264");
        assert_eq!(s.get::<i32>("width").unwrap(), 320);

        let described = format.with_caps("video/x-h264, stream-format=(string)avc");
        let caps = track_caps(&described).unwrap();
        assert_eq!(caps.structure(0).unwrap().name().as_str(), "video/x-h264");
    }

    #[test]
    fn test_tracks_share_one_timeline() {
        let mut clock = SessionClock::default();
        // Video opens the file, audio follows 200 ms later
        assert_eq!(clock.rebase(1_000_000), gst::ClockTime::ZERO);
        assert_eq!(clock.rebase(1_200_000), gst::ClockTime::from_mseconds(200));
        assert_eq!(clock.rebase(1_033_333), gst::ClockTime::from_useconds(33_333));
        // Samples older than the first write clamp to zero
        assert_eq!(clock.rebase(900_000), gst::ClockTime::ZERO);
    }

    #[test]
    fn test_unknown_mime_rejected() {
        if gst::init().is_err() {
            return;
        }
        let format = MediaFormat {
            mime: "video/unknown".into(),
            ..Default::default()
        };
        assert!(matches!(
            track_caps(&format),
            Err(MediaError::Container(_))
        ));
    }
}
