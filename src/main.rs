//! v4l2-capture-probe: open a camera, list what it offers, grab a few frames.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use v4l2_capture::{Camera, Result};

#[derive(Debug, Parser)]
#[command(name = "v4l2-capture-probe", version, about = "Probe a V4L2 capture device")]
struct Args {
    /// Device node to open.
    #[arg(short, long, default_value = "/dev/video0")]
    device: PathBuf,

    /// Requested frame width.
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Requested frame height.
    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Number of frames to capture.
    #[arg(short, long, default_value_t = 6)]
    frames: u32,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let mut camera = Camera::open(&args.device)?;

    let caps = camera.capabilities()?;
    println!("Device: {}", camera.path().display());
    println!("  Card: {}", caps.card);
    println!("  Driver: {}", caps.driver);
    println!("  Bus: {}", caps.bus_info);

    println!("Formats:");
    for entry in camera.formats()? {
        let entry = entry?;
        match entry.interval {
            Some(interval) => println!(
                "  {} {}x{} @ {interval}",
                entry.fourcc, entry.width, entry.height
            ),
            None => println!("  {} {}x{}", entry.fourcc, entry.width, entry.height),
        }
    }

    if let (Some(width), Some(height)) = (args.width, args.height) {
        camera.set_format(width, height)?;
    }

    let format = camera.negotiated_format().clone();
    println!(
        "Format: {}x{} {} (stride {}, {} bytes)",
        format.width, format.height, format.fourcc, format.bytes_per_line, format.image_size
    );

    camera.start()?;
    for _ in 0..args.frames {
        let frame = camera.capture_frame()?;
        let metadata = frame.metadata.clone();
        let size = frame.data.len();

        let rgb = camera.to_rgb()?;
        let center = ((format.height / 2) * format.width + format.width / 2) as usize * 3;
        let pixel = rgb.get(center..center + 3).unwrap_or_default();

        println!(
            "Frame {}: {} bytes, timestamp: {:?}, centre RGB{:?}",
            metadata.sequence, size, metadata.timestamp, pixel
        );
    }
    camera.stop()?;
    camera.close();

    Ok(())
}
