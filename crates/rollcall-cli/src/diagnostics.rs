//! Direct camera diagnostics, bypassing the daemon.

use anyhow::{Context, Result};
use rollcall_core::{DetectedFace, Detector, FaceBox, Frame, ScrfdDetector};
use rollcall_hw::frame::{is_dark_frame, mean_brightness};
use rollcall_hw::Camera;
use std::path::{Path, PathBuf};

pub struct DiagnosticOptions {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub frames: usize,
    pub warmup: usize,
    /// SCRFD model to run on the last frame, if any.
    pub model: Option<PathBuf>,
    pub min_confidence: f32,
    pub output: Option<PathBuf>,
}

pub fn run(opts: &DiagnosticOptions) -> Result<()> {
    println!("Devices:");
    for dev in Camera::list_devices() {
        println!("  {}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }

    let mut camera = Camera::open(&opts.device, opts.width, opts.height)
        .with_context(|| format!("failed to open {}", opts.device))?;
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.device_path, camera.width, camera.height, camera.pixel_format
    );
    camera.warmup(opts.warmup)?;

    let mut last: Option<Frame> = None;
    for _ in 0..opts.frames.max(1) {
        let frame = camera.capture_frame()?;
        println!(
            "  frame {:>5}  brightness {:>6.1}{}",
            frame.sequence,
            mean_brightness(&frame.data),
            if is_dark_frame(&frame.data, 0.95) { "  (dark)" } else { "" }
        );
        last = Some(frame);
    }
    let Some(frame) = last else {
        anyhow::bail!("no frames captured");
    };

    let faces = match &opts.model {
        Some(model) => {
            let model = model.to_string_lossy();
            let mut detector = ScrfdDetector::load(&model, opts.min_confidence)?;
            let faces = detector.detect(&frame)?;
            println!("Detected {} face(s)", faces.len());
            for face in &faces {
                let b = face.bbox;
                println!(
                    "  box {:.0},{:.0} {:.0}x{:.0}  score {:.3}",
                    b.x_min, b.y_min, b.width, b.height, face.score
                );
            }
            faces
        }
        None => Vec::new(),
    };

    if let Some(path) = &opts.output {
        write_snapshot(&frame, &faces, path)?;
        println!("Snapshot written to {}", path.display());
    }
    Ok(())
}

/// Save the frame as a grayscale PNG with detected boxes outlined in white.
fn write_snapshot(frame: &Frame, faces: &[DetectedFace], path: &Path) -> Result<()> {
    let mut pixels = frame.data.clone();
    for face in faces {
        outline(&mut pixels, frame.width, frame.height, &face.bbox);
    }
    let image = image::GrayImage::from_raw(frame.width, frame.height, pixels)
        .context("frame buffer does not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn outline(pixels: &mut [u8], width: u32, height: u32, b: &FaceBox) {
    if width == 0 || height == 0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(width - 1) as usize;
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(height - 1) as usize;
    let (x0, x1) = (clamp_x(b.x_min), clamp_x(b.x_min + b.width));
    let (y0, y1) = (clamp_y(b.y_min), clamp_y(b.y_min + b.height));
    let w = width as usize;

    for x in x0..=x1 {
        pixels[y0 * w + x] = 255;
        pixels[y1 * w + x] = 255;
    }
    for y in y0..=y1 {
        pixels[y * w + x0] = 255;
        pixels[y * w + x1] = 255;
    }
}
