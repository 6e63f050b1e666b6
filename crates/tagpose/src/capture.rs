//! Frame sources shipped with the workspace.

use crate::{CaptureBackend, PipelineConfig};
use image::imageops::FilterType;
use std::path::{Path, PathBuf};
use tagpose_core::{CaptureError, ColorFrame, FrameSource};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "pgm", "ppm", "tif", "tiff"];

/// Replays the images of a directory in lexical order, resized to the
/// configured resolution.
#[derive(Debug)]
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
    looping: bool,
    width: usize,
    height: usize,
}

impl ImageSequenceSource {
    pub fn open(
        dir: impl AsRef<Path>,
        resolution: (usize, usize),
        looping: bool,
    ) -> Result<Self, CaptureError> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(CaptureError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no images in {}", dir.display()),
            )));
        }
        log::info!("replaying {} images from {}", paths.len(), dir.display());
        Ok(Self {
            paths,
            next: 0,
            looping,
            width: resolution.0,
            height: resolution.1,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn decode(&self, path: &Path) -> Result<ColorFrame, CaptureError> {
        let decode_err = |message: String| CaptureError::Decode {
            path: path.display().to_string(),
            message,
        };
        let rgb = image::open(path)
            .map_err(|e| decode_err(e.to_string()))?
            .to_rgb8();
        let (w, h) = (self.width as u32, self.height as u32);
        let rgb = if rgb.dimensions() == (w, h) {
            rgb
        } else {
            image::imageops::resize(&rgb, w, h, FilterType::Triangle)
        };
        ColorFrame::from_rgb(self.width, self.height, rgb.into_raw())
            .ok_or_else(|| decode_err("unexpected buffer size".to_string()))
    }
}

impl FrameSource for ImageSequenceSource {
    fn read(&mut self) -> Result<ColorFrame, CaptureError> {
        if self.next >= self.paths.len() {
            if !self.looping {
                return Err(CaptureError::Exhausted);
            }
            self.next = 0;
        }
        let idx = self.next;
        self.next += 1;
        self.decode(&self.paths[idx])
    }

    fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

/// Open the frame source named by the configuration. Only the image
/// sequence backend ships with the workspace; camera drivers plug in
/// through [`FrameSource`].
pub fn open_capture(config: &PipelineConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    match &config.capture {
        CaptureBackend::ImageSequence { dir, looping } => Ok(Box::new(
            ImageSequenceSource::open(dir, config.resolution(), *looping)?,
        )),
        CaptureBackend::Usb { index } => Err(CaptureError::Unavailable(format!("usb:{index}"))),
        CaptureBackend::Ribbon => Err(CaptureError::Unavailable("ribbon".to_string())),
    }
}
