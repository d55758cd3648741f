use crate::config::Config;
use rollcall_core::{CaptureResources, Detector, FrameSource, InitError, ScrfdDetector};
use rollcall_hw::Camera;

/// Opens the configured camera and SCRFD model for a recognition session.
pub struct DaemonResources {
    camera_device: String,
    width: u32,
    height: u32,
    warmup_frames: usize,
    model_path: String,
    min_confidence: f32,
}

impl DaemonResources {
    pub fn new(config: &Config) -> Self {
        Self {
            camera_device: config.camera_device.clone(),
            width: config.camera_width,
            height: config.camera_height,
            warmup_frames: config.warmup_frames,
            model_path: config.scrfd_model_path(),
            min_confidence: config.min_confidence,
        }
    }
}

impl CaptureResources for DaemonResources {
    fn open_source(&mut self) -> Result<Box<dyn FrameSource>, InitError> {
        let mut camera = Camera::open(&self.camera_device, self.width, self.height)
            .map_err(|e| InitError::FrameSource(e.to_string()))?;
        if let Err(e) = camera.warmup(self.warmup_frames) {
            camera.release();
            return Err(InitError::FrameSource(e.to_string()));
        }
        Ok(Box::new(camera))
    }

    fn load_detector(&mut self) -> Result<Box<dyn Detector>, InitError> {
        let detector = ScrfdDetector::load(&self.model_path, self.min_confidence)
            .map_err(|e| InitError::Detector(e.to_string()))?;
        Ok(Box::new(detector))
    }
}
