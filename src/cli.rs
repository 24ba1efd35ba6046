// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Recording the test pattern camera through the video sink
//! - Running frames through the analysis sink
//! - Listing available encoders

use camera_fanout::backends::gstreamer::{self as gst_backend, GstMediaBackend};
use camera_fanout::backends::{TestPatternCamera, TextureStore, WgpuGraphics};
use camera_fanout::config::{AudioSpec, Crop, Dimension, MirrorAxis, Rotation, VideoSpec};
use camera_fanout::constants::{defaults, timing};
use camera_fanout::errors::{AppError, GpuResult, MediaError, MediaResult};
use camera_fanout::gpu::{GraphicsContext, Size, SurfaceTarget};
use camera_fanout::media::{AudioCapture, ContainerMuxer, HardwareEncoder, MediaBackend};
use camera_fanout::{
    AnalysisImage, Analyzer, DistributorConfig, FrameDistributor, RecordingController,
    RecordingSession, SinkConfiguration, SourceInfo,
};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

/// Size of the counting preview target
const PREVIEW_SIZE: Size = Size::new(320, 240);

/// Camera and sink transform options
#[derive(clap::Args, Debug, Clone)]
pub struct SinkArgs {
    /// Width of the synthetic camera buffer
    #[arg(long, default_value = "640")]
    source_width: u32,

    /// Height of the synthetic camera buffer
    #[arg(long, default_value = "480")]
    source_height: u32,

    /// Display rotation in degrees (0, 90, 180, 270)
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    rotation: i32,

    /// Sensor mounting orientation in degrees
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    sensor_orientation: i32,

    /// Crop rectangle as normalized x,y,width,height
    #[arg(long, value_parser = parse_crop)]
    crop: Option<Crop>,

    /// Mirror axis: none, horizontal, vertical or both
    #[arg(long, default_value = "none")]
    mirror: MirrorAxis,

    /// Draw the edge detection filter instead of the plain image
    #[arg(long)]
    edge_detect: bool,
}

impl SinkArgs {
    fn source(&self) -> Result<SourceInfo, AppError> {
        let rotation = |degrees: i32| {
            Rotation::from_degrees(degrees)
                .ok_or_else(|| AppError::Config(format!("unsupported rotation {}", degrees)))
        };
        Ok(SourceInfo {
            resolution: Size::new(self.source_width, self.source_height),
            rotation: rotation(self.rotation)?,
            sensor_orientation: rotation(self.sensor_orientation)?,
        })
    }

    fn configuration(&self) -> SinkConfiguration {
        SinkConfiguration::default()
            .with_crop(self.crop.unwrap_or_default())
            .with_mirror(self.mirror)
            .with_edge_detect(self.edge_detect)
    }
}

/// Recorded video size and bitrate
#[derive(clap::Args, Debug, Clone)]
pub struct VideoArgs {
    /// Video width in pixels
    #[arg(long, default_value_t = defaults::VIDEO_WIDTH, conflicts_with = "match_source")]
    width: u32,

    /// Video height in pixels
    #[arg(long, default_value_t = defaults::VIDEO_HEIGHT, conflicts_with = "match_source")]
    height: u32,

    /// Record at the size of the cropped camera image
    #[arg(long = "match")]
    match_source: bool,

    /// Video bitrate in bits per second
    #[arg(long, default_value_t = defaults::VIDEO_BITRATE)]
    bitrate: u32,
}

impl VideoArgs {
    fn spec(&self) -> VideoSpec {
        if self.match_source {
            VideoSpec::matching(self.bitrate)
        } else {
            VideoSpec {
                width: Dimension::Pixels(self.width),
                height: Dimension::Pixels(self.height),
                bitrate: self.bitrate,
            }
        }
    }
}

fn parse_crop(value: &str) -> Result<Crop, String> {
    let parts: Vec<f32> = value
        .split(',')
        .map(|part| part.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid crop '{}': {}", value, e))?;
    let &[x, y, width, height] = parts.as_slice() else {
        return Err(format!("crop needs four values, got {}", parts.len()));
    };
    let crop = Crop::new(x, y, width, height);
    crop.validate()?;
    Ok(crop)
}

/// Preview target that only counts what it is shown
struct CountingSurface {
    size: Size,
    frames: AtomicU64,
}

impl SurfaceTarget for CountingSurface {
    fn size(&self) -> Size {
        self.size
    }

    fn present(&self, _pixels: &[u8], _size: Size) -> GpuResult<()> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn start_distributor(
    store: &TextureStore,
    backend: Arc<dyn MediaBackend>,
    config: DistributorConfig,
) -> GpuResult<FrameDistributor> {
    let store = store.clone();
    FrameDistributor::new(
        move || {
            let ctx: Box<dyn GraphicsContext> = Box::new(WgpuGraphics::new(store)?);
            Ok(ctx)
        },
        backend,
        config,
    )
}

/// Record the test pattern for `duration` seconds
pub fn record(
    duration: u64,
    output: Option<PathBuf>,
    audio: bool,
    video: VideoArgs,
    sink: SinkArgs,
    session: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = match session {
        Some(path) => RecordingSession::load(&path)?,
        None => {
            let output = output.unwrap_or_else(default_output_path);
            let session = RecordingSession::new(output).with_video(video.spec());
            if audio {
                session.with_audio(AudioSpec::default())
            } else {
                session
            }
        }
    };
    if let Some(parent) = session.output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let source = sink.source()?;
    let config = DistributorConfig {
        video: sink.configuration(),
        ..Default::default()
    };

    println!("Output: {}", session.output.display());
    println!("Duration: {} seconds", duration);
    if session.audio.is_some() {
        println!("Audio: enabled");
    }

    let runtime = Runtime::new()?;
    let _guard = runtime.enter();

    let backend: Arc<dyn MediaBackend> = Arc::new(GstMediaBackend::new()?);
    let store = TextureStore::new();
    let distributor = start_distributor(&store, backend, config)?;
    let binding = runtime.block_on(distributor.attach_source(source, None))?;

    let preview = Arc::new(CountingSurface {
        size: PREVIEW_SIZE,
        frames: AtomicU64::new(0),
    });
    distributor.bind_surface(preview.clone())?;

    let controller = RecordingController::new(runtime.handle().clone());
    distributor.connect_recorder(controller.clone());
    controller.start(session);

    let mut camera = TestPatternCamera::start(
        store,
        binding.texture,
        binding.buffer_size,
        distributor.clone(),
        timing::TEST_PATTERN_FRAME_INTERVAL,
        None,
    );

    // Set up Ctrl+C handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    println!();
    println!("Recording... (press Ctrl+C to stop early)");
    let start = Instant::now();
    let target_duration = Duration::from_secs(duration);
    while start.elapsed() < target_duration && camera.is_running() {
        if stop_flag.load(Ordering::SeqCst) {
            println!();
            println!("Stopping early...");
            break;
        }

        let elapsed = start.elapsed().as_secs();
        print!("\rRecording: {:02}:{:02}", elapsed / 60, elapsed % 60);
        std::io::Write::flush(&mut std::io::stdout())?;

        std::thread::sleep(Duration::from_millis(100));
    }
    println!();

    let result = runtime.block_on(controller.stop());
    camera.stop();
    runtime.block_on(distributor.release());

    println!(
        "Frames: {} produced, {} previewed",
        camera.frames_delivered(),
        preview.frames.load(Ordering::Relaxed)
    );
    match result? {
        Some(path) => println!("Video saved: {}", path.display()),
        None => println!("Nothing was recorded"),
    }
    Ok(())
}

#[derive(Default)]
struct AnalysisStats {
    images: u64,
    luma_sum: f64,
}

/// Mean Rec. 601 luma of an image, in `[0, 255]`
fn mean_luma(image: &AnalysisImage) -> f64 {
    let pixels = image.data().chunks_exact(4);
    let count = pixels.len().max(1) as f64;
    let total: f64 = pixels
        .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
        .sum();
    total / count
}

/// Feed `frames` test pattern frames through the analysis sink
pub fn analyze(frames: u64, sink: SinkArgs) -> Result<(), Box<dyn std::error::Error>> {
    let source = sink.source()?;
    let config = DistributorConfig {
        analysis: sink.configuration(),
        ..Default::default()
    };

    let runtime = Runtime::new()?;
    let _guard = runtime.enter();

    let stats: Arc<Mutex<AnalysisStats>> = Arc::default();
    let collector = stats.clone();
    let analyzer: Analyzer = Arc::new(move |image: AnalysisImage| {
        let luma = mean_luma(&image);
        image.close();
        if let Ok(mut stats) = collector.lock() {
            stats.images += 1;
            stats.luma_sum += luma;
        }
    });

    // Recording is never started, so no media backend is needed
    let backend: Arc<dyn MediaBackend> = Arc::new(NoMedia);
    let store = TextureStore::new();
    let distributor = start_distributor(&store, backend, config)?;
    let binding = runtime.block_on(distributor.attach_source(source, Some(analyzer)))?;

    let mut camera = TestPatternCamera::start(
        store,
        binding.texture,
        binding.buffer_size,
        distributor.clone(),
        Duration::ZERO,
        Some(frames),
    );
    camera.join();
    runtime.block_on(distributor.flush())?;
    runtime.block_on(distributor.release());

    let stats = stats
        .lock()
        .map_err(|_| AppError::Other("analysis statistics poisoned".into()))?;
    println!("Frames produced: {}", camera.frames_delivered());
    println!("Images analyzed: {}", stats.images);
    if let Some(gate) = &binding.analysis {
        println!("Frames skipped (image outstanding): {}", gate.dropped());
    }
    if stats.images > 0 {
        println!("Mean luma: {:.1}", stats.luma_sum / stats.images as f64);
    }
    Ok(())
}

/// Media backend for runs that never record
struct NoMedia;

impl MediaBackend for NoMedia {
    fn create_encoder(&self, mime: &str) -> MediaResult<Box<dyn HardwareEncoder>> {
        Err(MediaError::Unavailable(mime.to_string()))
    }

    fn create_audio_capture(&self, _spec: &AudioSpec) -> MediaResult<Box<dyn AudioCapture>> {
        Err(MediaError::Unavailable("audio capture".into()))
    }

    fn create_muxer(&self, output: &Path) -> MediaResult<Box<dyn ContainerMuxer>> {
        Err(MediaError::Unavailable(output.display().to_string()))
    }
}

/// List available encoders, best first
pub fn list_encoders() -> Result<(), Box<dyn std::error::Error>> {
    GstMediaBackend::new()?;

    let video = gst_backend::detect_video_encoders();
    let audio = gst_backend::detect_audio_encoders();

    println!("Video encoders (H.264):");
    print_encoders(&video);
    println!();
    println!("Audio encoders (AAC):");
    print_encoders(&audio);
    Ok(())
}

fn print_encoders(names: &[String]) {
    if names.is_empty() {
        println!("  none found");
        return;
    }
    for (index, name) in names.iter().enumerate() {
        let marker = if index == 0 { " (selected)" } else { "" };
        println!("  [{}] {}{}", index, name, marker);
    }
}

fn default_output_path() -> PathBuf {
    let dir = dirs::video_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("camera-fanout");
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("video_{}.mp4", timestamp))
}
