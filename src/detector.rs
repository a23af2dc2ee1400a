use std::collections::VecDeque;

use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::contrast::threshold;
use imageproc::filter::gaussian_blur_f32;
use imageproc::region_labelling::{connected_components, Connectivity};
use tracing::{debug, info};

use crate::config::DetectorConfig;
use crate::error::CameraError;

/// A camera the detector can own, release, and reacquire.
///
/// Exactly one owner holds the camera at a time; ownership moves by
/// explicit `open`/`close`, never by sharing.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), CameraError>;
    fn read_frame(&mut self) -> Result<RgbImage, CameraError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

/// Motion-based trigger detector built on frame differencing.
///
/// Owns the camera while polling. Holds one normalized reference frame;
/// each `detect` call compares a fresh frame against it. A confirmed
/// trigger releases the camera as a side effect so the classification
/// capture can open it fresh.
pub struct TriggerDetector {
    source: Box<dyn FrameSource>,
    config: DetectorConfig,
    reference: Option<GrayImage>,
}

impl TriggerDetector {
    pub fn new(source: Box<dyn FrameSource>, config: DetectorConfig) -> Self {
        Self {
            source,
            config,
            reference: None,
        }
    }

    pub fn holds_camera(&self) -> bool {
        self.source.is_open()
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Capture and store a normalized reference frame, acquiring the camera
    /// first if it is not currently held.
    pub fn capture_reference(&mut self) -> Result<(), CameraError> {
        self.acquire()?;
        let frame = self.source.read_frame()?;
        self.reference = Some(self.normalize(&frame));
        info!("reference frame captured");
        Ok(())
    }

    /// Check one fresh frame against the reference.
    ///
    /// Returns true only when the change ratio exceeds `change_threshold`
    /// AND at least one contiguous changed region is larger than the
    /// configured minimum area; diffuse flicker fails the second check. On a
    /// confirmed trigger the camera is released before returning.
    pub fn detect(&mut self, change_threshold: f64) -> Result<bool, CameraError> {
        if self.reference.is_none() {
            return Err(CameraError::NoReference);
        }

        self.acquire()?;
        let frame = self.source.read_frame()?;
        let current = self.normalize(&frame);

        let Some(reference) = self.reference.as_ref() else {
            return Err(CameraError::NoReference);
        };
        if reference.dimensions() != current.dimensions() {
            return Err(CameraError::Frame {
                details: format!(
                    "frame dimensions {:?} do not match reference {:?}",
                    current.dimensions(),
                    reference.dimensions()
                ),
            });
        }

        let delta = frame_delta(reference, &current);
        let mask = threshold(&delta, self.config.delta_threshold);
        let ratio = change_ratio(&mask);
        debug!(change_ratio = ratio, "frame compared against reference");

        if ratio <= change_threshold {
            return Ok(false);
        }

        let components = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
        let max_area = largest_component_area(&components);
        if max_area <= self.config.min_region_area {
            debug!(
                max_area,
                minimum = self.config.min_region_area,
                "change ratio exceeded but no region large enough, treating as noise"
            );
            return Ok(false);
        }

        info!(change_ratio = ratio, max_area, "trigger confirmed, releasing camera");
        self.release();
        Ok(true)
    }

    /// Capture one still frame as JPEG for the classification gateway,
    /// opening the camera fresh if the trigger released it.
    pub fn capture_still(&mut self) -> Result<Vec<u8>, CameraError> {
        self.acquire()?;
        let frame = self.source.read_frame()?;

        let mut jpeg = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut jpeg);
        DynamicImage::ImageRgb8(frame)
            .write_to(&mut cursor, image::ImageOutputFormat::Jpeg(85))
            .map_err(|e| CameraError::Frame {
                details: format!("JPEG encode failed: {e}"),
            })?;
        Ok(jpeg)
    }

    /// Release the camera so another owner can open it.
    pub fn release(&mut self) {
        if self.source.is_open() {
            self.source.close();
            debug!("camera released");
        }
    }

    fn acquire(&mut self) -> Result<(), CameraError> {
        if !self.source.is_open() {
            self.source.open()?;
            debug!("camera acquired");
        }
        Ok(())
    }

    /// Grayscale + Gaussian blur, the shared normalization for reference
    /// and candidate frames.
    fn normalize(&self, frame: &RgbImage) -> GrayImage {
        let gray = DynamicImage::ImageRgb8(frame.clone()).to_luma8();
        gaussian_blur_f32(&gray, self.config.blur_sigma)
    }
}

/// Absolute per-pixel difference of two equally sized grayscale frames.
fn frame_delta(reference: &GrayImage, current: &GrayImage) -> GrayImage {
    let (width, height) = reference.dimensions();
    let mut delta = GrayImage::new(width, height);

    for (x, y, ref_pixel) in reference.enumerate_pixels() {
        let curr_pixel = current.get_pixel(x, y);
        let diff = (ref_pixel[0] as i16 - curr_pixel[0] as i16).unsigned_abs() as u8;
        delta.put_pixel(x, y, Luma([diff]));
    }

    delta
}

/// Fraction of pixels marked changed in a binarized difference mask.
fn change_ratio(mask: &GrayImage) -> f64 {
    let total = (mask.width() * mask.height()) as f64;
    if total == 0.0 {
        return 0.0;
    }
    let changed = mask.pixels().filter(|p| p[0] != 0).count() as f64;
    changed / total
}

/// Area of the largest connected component in a labelled image.
fn largest_component_area(components: &image::ImageBuffer<Luma<u32>, Vec<u32>>) -> f64 {
    let mut counts = std::collections::HashMap::new();
    for pixel in components.pixels() {
        if pixel[0] > 0 {
            *counts.entry(pixel[0]).or_insert(0u32) += 1;
        }
    }
    counts.values().max().copied().unwrap_or(0) as f64
}

/// Frame source backed by a scripted frame queue.
///
/// Used by tests and as the no-camera runtime fallback: once the queue is
/// exhausted the last frame repeats, and an empty queue synthesizes a flat
/// gray frame so polling idles without ever triggering.
pub struct StubFrameSource {
    frames: VecDeque<RgbImage>,
    last: Option<RgbImage>,
    open: bool,
    fail_open: bool,
}

impl StubFrameSource {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        Self {
            frames: frames.into(),
            last: None,
            open: false,
            fail_open: false,
        }
    }

    /// Make every subsequent `open` fail, simulating a camera that
    /// disappeared.
    pub fn fail_open(&mut self) {
        self.fail_open = true;
    }
}

impl FrameSource for StubFrameSource {
    fn open(&mut self) -> Result<(), CameraError> {
        if self.fail_open {
            return Err(CameraError::Open {
                details: "stub camera configured to fail".to_string(),
            });
        }
        self.open = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        if !self.open {
            return Err(CameraError::Frame {
                details: "camera is not open".to_string(),
            });
        }
        let frame = match self.frames.pop_front() {
            Some(frame) => frame,
            None => match &self.last {
                Some(last) => last.clone(),
                None => RgbImage::from_pixel(640, 480, image::Rgb([128, 128, 128])),
            },
        };
        self.last = Some(frame.clone());
        Ok(frame)
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// V4L2-backed camera source (Linux).
#[cfg(feature = "camera-v4l2")]
pub struct V4l2Source {
    index: usize,
    device: Option<v4l::Device>,
}

#[cfg(feature = "camera-v4l2")]
impl V4l2Source {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            device: None,
        }
    }
}

#[cfg(feature = "camera-v4l2")]
impl FrameSource for V4l2Source {
    fn open(&mut self) -> Result<(), CameraError> {
        use v4l::video::Capture;

        let device = v4l::Device::new(self.index).map_err(|e| CameraError::Open {
            details: format!("/dev/video{}: {e}", self.index),
        })?;

        let mut format = device.format().map_err(|e| CameraError::Open {
            details: format!("failed to query format: {e}"),
        })?;
        format.fourcc = v4l::FourCC::new(b"MJPG");
        device.set_format(&format).map_err(|e| CameraError::Open {
            details: format!("failed to set MJPG format: {e}"),
        })?;

        self.device = Some(device);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        use v4l::buffer::Type;
        use v4l::io::traits::CaptureStream;

        let device = self.device.as_ref().ok_or_else(|| CameraError::Frame {
            details: "camera is not open".to_string(),
        })?;

        let mut stream = v4l::io::mmap::Stream::with_buffers(device, Type::VideoCapture, 4)
            .map_err(|e| CameraError::Frame {
                details: format!("failed to start capture stream: {e}"),
            })?;
        let (buffer, _meta) = stream.next().map_err(|e| CameraError::Frame {
            details: format!("failed to capture frame: {e}"),
        })?;

        let decoded = image::load_from_memory(buffer).map_err(|e| CameraError::Frame {
            details: format!("failed to decode frame: {e}"),
        })?;
        Ok(decoded.to_rgb8())
    }

    fn close(&mut self) {
        self.device = None;
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }
}
