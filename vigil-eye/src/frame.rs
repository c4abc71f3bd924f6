//! Frames and pixel regions

use crate::error::VisionError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::{ImageBuffer, ImageFormat, Rgb};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;

/// A decoded video frame in packed 8-bit RGB.
///
/// Frames are cheap to clone: pixel data is reference counted and never
/// mutated once the frame is built.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    timestamp: DateTime<Utc>,
    data: Bytes,
}

impl Frame {
    /// Create a frame from packed RGB data
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Result<Self, VisionError> {
        let data = data.into();
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|p| p.checked_mul(3))
            .ok_or_else(|| VisionError::Processing("Frame dimensions overflow".to_string()))?;

        if width == 0 || height == 0 {
            return Err(VisionError::Processing("Frame dimensions must be non-zero".to_string()));
        }
        if data.len() != expected {
            return Err(VisionError::Processing(format!(
                "Frame buffer is {} bytes, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            )));
        }

        Ok(Self {
            width,
            height,
            timestamp: Utc::now(),
            data,
        })
    }

    /// Create a frame filled with a single color
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self, VisionError> {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self::new(width, height, data)
    }

    /// Decode a JPEG (or any format `image` recognizes) into a frame
    pub fn from_jpeg(bytes: &[u8]) -> Result<Self, VisionError> {
        let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?.to_rgb8();
        let (width, height) = decoded.dimensions();
        Self::new(width, height, decoded.into_raw())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mean luma on a 0-255 scale (Rec. 601 weights)
    pub fn mean_luminance(&self) -> f64 {
        let pixels = self.data.chunks_exact(3);
        let count = pixels.len();
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = pixels
            .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
            .sum();
        sum / count as f64
    }

    /// Copy out the pixels under `region`, clamped to the frame
    pub fn crop(&self, region: &BoundingBox) -> Result<Frame, VisionError> {
        let clamped = region.clamp_to(self.width, self.height);
        let x0 = clamped.x.floor() as u32;
        let y0 = clamped.y.floor() as u32;
        let w = clamped.width.floor() as u32;
        let h = clamped.height.floor() as u32;
        if w == 0 || h == 0 {
            return Err(VisionError::Processing("Crop region is empty".to_string()));
        }

        let stride = self.width as usize * 3;
        let mut data = Vec::with_capacity(w as usize * h as usize * 3);
        for row in y0..y0 + h {
            let start = row as usize * stride + x0 as usize * 3;
            data.extend_from_slice(&self.data[start..start + w as usize * 3]);
        }

        Ok(Frame {
            width: w,
            height: h,
            timestamp: self.timestamp,
            data: Bytes::from(data),
        })
    }

    fn to_image(&self) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>, VisionError> {
        ImageBuffer::from_raw(self.width, self.height, self.data.to_vec())
            .ok_or_else(|| VisionError::Processing("Frame buffer does not match dimensions".to_string()))
    }

    /// Encode the frame as JPEG
    pub fn to_jpeg(&self) -> Result<Vec<u8>, VisionError> {
        let mut out = Cursor::new(Vec::new());
        self.to_image()?.write_to(&mut out, ImageFormat::Jpeg)?;
        Ok(out.into_inner())
    }

    /// Write the frame to disk; format follows the file extension
    pub fn save(&self, path: &Path) -> Result<(), VisionError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.to_image()?.save(path)?;
        Ok(())
    }
}

/// Axis-aligned region in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        if self.width.is_finite() && self.height.is_finite() {
            self.width.max(0.0) * self.height.max(0.0)
        } else {
            0.0
        }
    }

    /// Intersection over union, 0.0 for disjoint or degenerate boxes
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Restrict the box to a `width` x `height` frame
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let (fw, fh) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, fw);
        let y1 = self.y.clamp(0.0, fh);
        let x2 = (self.x + self.width).clamp(0.0, fw);
        let y2 = (self.y + self.height).clamp(0.0, fh);
        BoundingBox::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
    }
}
