//! Overlay consumer that writes each detection batch as one JSON line.

use std::io::Write;

use serde::Serialize;
use tagstream::tracing::prefix;
use tagstream_detect::{Detection, OverlayConsumer};
use tracing::warn;

#[derive(Serialize)]
struct Batch<'a> {
    batch: u64,
    width: u32,
    height: u32,
    detections: &'a [Detection],
}

pub struct JsonLinesOverlay<W: Write> {
    out: W,
    batches: u64,
    detections: u64,
}

impl<W: Write> JsonLinesOverlay<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            batches: 0,
            detections: 0,
        }
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn detections(&self) -> u64 {
        self.detections
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> OverlayConsumer for JsonLinesOverlay<W> {
    fn render(&mut self, detections: &[Detection], width: u32, height: u32) {
        self.batches += 1;
        self.detections += detections.len() as u64;
        let line = Batch {
            batch: self.batches,
            width,
            height,
            detections,
        };
        let written = serde_json::to_writer(&mut self.out, &line)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));
        if let Err(e) = written {
            warn!("{} failed to write batch {}: {}", prefix::CAPTURE, self.batches, e);
        }
    }

    fn clear(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!("{} failed to flush output: {}", prefix::CAPTURE, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagstream_detect::Point;

    #[test]
    fn test_one_line_per_batch() {
        let mut overlay = JsonLinesOverlay::new(Vec::new());
        let tag = Detection::from_corners(
            3,
            [
                Point::new(0.0, 0.0),
                Point::new(2.0, 0.0),
                Point::new(2.0, 2.0),
                Point::new(0.0, 2.0),
            ],
        );
        overlay.render(&[tag], 640, 480);
        overlay.render(&[], 640, 480);
        assert_eq!(overlay.batches(), 2);
        assert_eq!(overlay.detections(), 1);

        let text = String::from_utf8(overlay.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["batch"], 1);
        assert_eq!(first["width"], 640);
        assert_eq!(first["detections"][0]["id"], 3);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["detections"].as_array().unwrap().len(), 0);
    }
}
