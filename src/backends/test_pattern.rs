// SPDX-License-Identifier: GPL-3.0-only
//! Synthetic camera producing moving colour bars
//!
//! The producer runs on its own thread. Each frame is written into the
//! distributor's camera texture and then announced with
//! `on_frame_available`, the way a real camera callback would.

use super::texture_store::TextureStore;
use crate::gpu::transform::IDENTITY;
use crate::gpu::{Size, TextureId};
use crate::pipelines::distributor::FrameDistributor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// SMPTE-style bars: white, yellow, cyan, green, magenta, red, blue, black
const BARS: [[u8; 4]; 8] = [
    [235, 235, 235, 255],
    [235, 235, 16, 255],
    [16, 235, 235, 255],
    [16, 235, 16, 255],
    [235, 16, 235, 255],
    [235, 16, 16, 255],
    [16, 16, 235, 255],
    [16, 16, 16, 255],
];

/// Pixels the bars move per frame
const SCROLL_PER_FRAME: u64 = 2;

/// Render one frame of vertical colour bars, scrolled by `frame`
pub fn color_bars(size: Size, frame: u64) -> Vec<u8> {
    let width = size.width.max(1) as u64;
    let shift = frame * SCROLL_PER_FRAME;
    let row: Vec<u8> = (0..size.width as u64)
        .flat_map(|x| BARS[(((x + shift) % width) * BARS.len() as u64 / width) as usize])
        .collect();

    let mut pixels = Vec::with_capacity(size.rgba_len());
    for _ in 0..size.height {
        pixels.extend_from_slice(&row);
    }
    pixels
}

/// Camera stand-in feeding a [`FrameDistributor`]
pub struct TestPatternCamera {
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
}

impl TestPatternCamera {
    /// Start producing frames into `texture`, one every `interval`
    ///
    /// Stops by itself after `limit` frames, when the distributor goes
    /// away, or when [`TestPatternCamera::stop`] is called.
    pub fn start(
        store: TextureStore,
        texture: TextureId,
        size: Size,
        distributor: FrameDistributor,
        interval: Duration,
        limit: Option<u64>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));

        info!(%size, ?interval, ?limit, "Starting test pattern camera");

        let thread = {
            let stop = Arc::clone(&stop);
            let frames = Arc::clone(&frames);
            thread::spawn(move || {
                let epoch = Instant::now();
                let mut index = 0u64;

                while !stop.load(Ordering::SeqCst) && limit.is_none_or(|limit| index < limit) {
                    if let Err(e) = store.upload(texture, size, &color_bars(size, index)) {
                        warn!(error = %e, "Failed to upload test pattern");
                        break;
                    }
                    let timestamp = epoch.elapsed().as_nanos() as i64;
                    if let Err(e) = distributor.on_frame_available(IDENTITY, timestamp) {
                        debug!(error = %e, "Distributor gone, stopping test pattern");
                        break;
                    }
                    index += 1;
                    frames.store(index, Ordering::SeqCst);

                    // Pace against the start time so slow frames do not drift
                    let due = epoch + interval.saturating_mul(index.min(u32::MAX as u64) as u32);
                    if let Some(wait) = due.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    }
                }
                debug!(frames = index, "Test pattern camera finished");
            })
        };

        Self {
            thread: Some(thread),
            stop,
            frames,
        }
    }

    /// Frames handed to the distributor so far
    pub fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop producing frames and wait for the thread
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.join();
    }

    /// Wait until the producer finishes on its own
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            warn!("Test pattern thread panicked");
        }
    }
}

impl Drop for TestPatternCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_bars_scroll() {
        let size = Size::new(16, 2);
        let first = color_bars(size, 0);
        assert_eq!(first.len(), size.rgba_len());
        assert_eq!(&first[..4], &BARS[0]);
        // Second row repeats the first
        assert_eq!(&first[..64], &first[64..]);

        // 16 px wide, 8 bars: each bar is 2 px, one frame scrolls one bar
        let second = color_bars(size, 1);
        assert_eq!(&second[..4], &BARS[1]);
    }
}
