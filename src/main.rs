// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camera-fanout")]
#[command(about = "Draw one camera into preview, recording and analysis sinks")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the test pattern camera to an MP4 file
    Record {
        /// Recording duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Output file path (default: ~/Videos/camera-fanout/video_TIMESTAMP.mp4)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Record microphone audio alongside the video
        #[arg(short, long)]
        audio: bool,

        #[command(flatten)]
        video: cli::VideoArgs,

        #[command(flatten)]
        sink: cli::SinkArgs,

        /// Recording session as JSON; overrides output, audio and video options
        #[arg(long)]
        session: Option<PathBuf>,
    },

    /// Run frames through the analysis sink and report what arrives
    Analyze {
        /// Number of camera frames to produce
        #[arg(short, long, default_value = "60")]
        frames: u64,

        #[command(flatten)]
        sink: cli::SinkArgs,
    },

    /// List the encoders this system can record with
    Encoders,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=camera_fanout=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Record {
            duration,
            output,
            audio,
            video,
            sink,
            session,
        } => cli::record(duration, output, audio, video, sink, session),
        Commands::Analyze { frames, sink } => cli::analyze(frames, sink),
        Commands::Encoders => cli::list_encoders(),
    }
}
