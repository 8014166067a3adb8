//! Test-image provisioning.
//!
//! The processor reads images from a directory shared with this client, so
//! every request carries a path rather than pixels. A provisioner writes one
//! image in the negotiated format into that directory before streaming.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{ClientError, Result};
use crate::messages::{ImageFormat, ImageRef};

pub const DEFAULT_WIDTH: u32 = 2048;
pub const DEFAULT_HEIGHT: u32 = 2048;

/// An image materialized in the shared directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestImage {
    pub path: PathBuf,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl TestImage {
    pub fn image_ref(&self) -> ImageRef {
        ImageRef {
            path: self.path.clone(),
            format: self.format,
        }
    }
}

/// Produces a test image in a given format.
pub trait ImageProvisioner {
    fn provision(&self, format: ImageFormat, shared_dir: &Path) -> Result<TestImage>;
}

/// Generates raw gradients itself; encoded formats come from a supplied file.
#[derive(Debug, Clone)]
pub struct SyntheticImage {
    width: u32,
    height: u32,
    encoded_source: Option<PathBuf>,
}

impl Default for SyntheticImage {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            encoded_source: None,
        }
    }
}

impl SyntheticImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Pre-encoded PNG or TIFF file to hand out for those formats.
    ///
    /// The file is not decoded. Its pixel size must match the configured
    /// width and height, which are what requests report.
    pub fn with_encoded_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.encoded_source = Some(path.into());
        self
    }
}

impl ImageProvisioner for SyntheticImage {
    fn provision(&self, format: ImageFormat, shared_dir: &Path) -> Result<TestImage> {
        if !shared_dir.is_dir() {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("shared images directory {} does not exist", shared_dir.display()),
            )));
        }

        let path = shared_dir.join(format!(
            "inferprobe-test-{}.{}",
            std::process::id(),
            format.extension()
        ));

        match format {
            ImageFormat::RawBgr => fs::write(&path, bgr_gradient(self.width, self.height))?,
            ImageFormat::RawRgb => {
                let mut pixels = bgr_gradient(self.width, self.height);
                swap_red_blue(&mut pixels);
                fs::write(&path, pixels)?;
            }
            ImageFormat::Png | ImageFormat::Tiff => {
                let source = self.encoded_source.as_ref().ok_or_else(|| {
                    ClientError::UnsupportedFormat(format!(
                        "{format} test images need a pre-encoded source file"
                    ))
                })?;
                fs::copy(source, &path)?;
            }
        }

        let path = path.canonicalize()?;
        info!(
            path = %path.display(),
            %format,
            width = self.width,
            height = self.height,
            "test image written"
        );
        Ok(TestImage {
            path,
            format,
            width: self.width,
            height: self.height,
        })
    }
}

/// Packed 3-byte BGR pixels, row-major, with a diagonal colour gradient.
pub fn bgr_gradient(width: u32, height: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            pixels.push((x % 256) as u8);
            pixels.push((y % 256) as u8);
            pixels.push(((x + y) / 2 % 256) as u8);
        }
    }
    pixels
}

/// Swap the first and third component of every 3-byte pixel in place.
pub fn swap_red_blue(pixels: &mut [u8]) {
    for pixel in pixels.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
}
