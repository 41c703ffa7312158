//! Frame sources for the command-line shell.

use std::path::{Path, PathBuf};

use image::RgbaImage;
use tagstream::tracing::prefix;
use tagstream::{Error, Result};
use tagstream_detect::FrameSource;
use tracing::{debug, warn};

/// Steps through a list of image files, one per captured frame.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
    looping: bool,
    current: Option<RgbaImage>,
    released: bool,
}

impl ImageSequenceSource {
    /// Build a sequence from files and directories. Directory entries are
    /// expanded (non-recursively) and sorted by name.
    pub fn new(inputs: &[PathBuf], looping: bool) -> Result<Self> {
        let mut paths = Vec::new();
        for input in inputs {
            if input.is_dir() {
                let mut entries: Vec<PathBuf> = std::fs::read_dir(input)?
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| is_image(p))
                    .collect();
                entries.sort();
                paths.extend(entries);
            } else {
                paths.push(input.clone());
            }
        }
        if paths.is_empty() {
            return Err(Error::Source("no input frames".to_string()));
        }

        let mut source = Self {
            paths,
            next: 0,
            looping,
            current: None,
            released: false,
        };
        source.advance();
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// True once the last frame has been captured and looping is off
    pub fn is_exhausted(&self) -> bool {
        self.released || self.current.is_none()
    }

    /// Decode the next readable file into `current`.
    fn advance(&mut self) {
        self.current = None;
        for _ in 0..self.paths.len() {
            if self.next >= self.paths.len() {
                if !self.looping {
                    return;
                }
                self.next = 0;
            }
            let path = &self.paths[self.next];
            self.next += 1;
            match image::open(path) {
                Ok(img) => {
                    debug!("{} loaded {}", prefix::CAPTURE, path.display());
                    self.current = Some(img.to_rgba8());
                    return;
                }
                Err(e) => warn!("{} skipping {}: {}", prefix::CAPTURE, path.display(), e),
            }
        }
    }
}

impl FrameSource for ImageSequenceSource {
    fn dimensions(&self) -> Option<(u32, u32)> {
        self.current.as_ref().map(|img| img.dimensions())
    }

    fn capture_rgba(&mut self, rgba: &mut Vec<u8>) -> bool {
        if self.released {
            return false;
        }
        let Some(img) = self.current.as_ref() else {
            return false;
        };
        rgba.clear();
        rgba.extend_from_slice(img.as_raw());
        self.advance();
        true
    }

    fn release(&mut self) {
        self.released = true;
        self.current = None;
    }
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("png" | "jpg" | "jpeg" | "bmp" | "pgm" | "tif" | "tiff")
    )
}

/// A flat gray frame of fixed size, for runs without input files.
pub struct BlankSource {
    width: u32,
    height: u32,
    released: bool,
}

impl BlankSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            released: false,
        }
    }
}

impl FrameSource for BlankSource {
    fn dimensions(&self) -> Option<(u32, u32)> {
        (!self.released).then_some((self.width, self.height))
    }

    fn capture_rgba(&mut self, rgba: &mut Vec<u8>) -> bool {
        if self.released {
            return false;
        }
        rgba.clear();
        rgba.resize(self.width as usize * self.height as usize * 4, 0x80);
        true
    }

    fn release(&mut self) {
        self.released = true;
    }
}
