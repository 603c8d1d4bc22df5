// src/output/virt.rs

//! Virtual/software display surface.
//!
//! Backed by an in-process RGB24 buffer instead of a device mapping, with
//! an arbitrary per-pixel mapping from logical pixels to channel offsets
//! and color roles. Pixels not covered by the mapping keep showing the
//! optional background image. This variant exercises the same render
//! contract as the framebuffer surface without hardware, which is what the
//! tests lean on.

use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::color::ColorOrder;
use crate::output::{OutputError, OutputSurface};

/// One logical pixel of the virtual display: where it sits, which channels
/// feed it, and how those channels are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualPixel {
    pub x: usize,
    pub y: usize,
    /// Offset of the pixel's first channel, relative to the surface start.
    pub ch: usize,
    pub order: ColorOrder,
}

/// A parsed pixel layout: text lines of `x,y,channel[,order]`, `#` for
/// comments. The order defaults to RGB.
#[derive(Debug, Clone, Default)]
pub struct PixelLayout {
    pub pixels: Vec<VirtualPixel>,
}

impl PixelLayout {
    pub fn parse(text: &str) -> Result<Self, OutputError> {
        let mut pixels = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split(',').map(str::trim);
            let bad = |what: &str| {
                OutputError::Config(format!("pixel layout line {}: {what}", lineno + 1))
            };
            let x = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| bad("bad x"))?;
            let y = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| bad("bad y"))?;
            let ch = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| bad("bad channel"))?;
            let order = match fields.next() {
                None => ColorOrder::Rgb,
                Some(name) => ColorOrder::from_name(name)
                    .ok_or_else(|| bad(&format!("unknown color role '{name}'")))?,
            };
            pixels.push(VirtualPixel { x, y, ch, order });
        }
        Ok(PixelLayout { pixels })
    }

    pub fn load(path: &Path) -> Result<Self, OutputError> {
        let text = fs::read_to_string(path).map_err(|e| {
            OutputError::Config(format!("pixel layout {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }
}

/// Software display surface with a per-pixel channel mapping.
pub struct VirtualDisplaySurface {
    width: usize,
    height: usize,
    /// Each logical pixel is drawn as a square block of this many display
    /// pixels, for visibility at preview scale.
    pixel_size: usize,
    start_channel: usize,
    channel_count: usize,
    pixels: Vec<VirtualPixel>,
    background: Vec<u8>,
    buffer: Vec<u8>,
}

impl VirtualDisplaySurface {
    pub fn new(
        width: usize,
        height: usize,
        pixel_size: usize,
        start_channel: usize,
        channel_count: usize,
        layout: PixelLayout,
    ) -> Result<Self, OutputError> {
        if width == 0 || height == 0 {
            return Err(OutputError::Config(format!(
                "degenerate virtual display {width}x{height}"
            )));
        }
        let pixel_size = pixel_size.max(1);
        for p in &layout.pixels {
            if p.x >= width || p.y >= height {
                return Err(OutputError::Config(format!(
                    "pixel at ({},{}) outside {width}x{height} display",
                    p.x, p.y
                )));
            }
            if p.ch + p.order.channels_per_pixel() > channel_count {
                return Err(OutputError::Config(format!(
                    "pixel at ({},{}) needs channels past {channel_count}",
                    p.x, p.y
                )));
            }
        }
        let background = vec![0u8; width * height * 3];
        info!(
            "Virtual display ready ({}x{}, {} mapped pixels, {} channels)",
            width,
            height,
            layout.pixels.len(),
            channel_count
        );
        Ok(VirtualDisplaySurface {
            width,
            height,
            pixel_size,
            start_channel,
            channel_count,
            pixels: layout.pixels,
            buffer: background.clone(),
            background,
        })
    }

    /// Loads a raw RGB24 background image matching the display dimensions,
    /// dimmed by `brightness` (0.0..=1.0). The current frame restarts from
    /// the new background.
    pub fn load_background(&mut self, path: &Path, brightness: f32) -> Result<(), OutputError> {
        let raw = fs::read(path).map_err(|e| {
            OutputError::Config(format!("background {}: {e}", path.display()))
        })?;
        if raw.len() != self.background.len() {
            return Err(OutputError::Config(format!(
                "background {} is {} bytes, display needs {}",
                path.display(),
                raw.len(),
                self.background.len()
            )));
        }
        let scale = brightness.clamp(0.0, 1.0);
        for (dst, src) in self.background.iter_mut().zip(raw) {
            *dst = (src as f32 * scale) as u8;
        }
        self.buffer.copy_from_slice(&self.background);
        Ok(())
    }

    /// Composites one logical pixel's color into its block of the display
    /// buffer.
    fn draw_pixel(&mut self, x: usize, y: usize, r: u8, g: u8, b: u8) {
        let x_end = (x + self.pixel_size).min(self.width);
        let y_end = (y + self.pixel_size).min(self.height);
        for dy in y..y_end {
            for dx in x..x_end {
                let off = (dy * self.width + dx) * 3;
                self.buffer[off] = r;
                self.buffer[off + 1] = g;
                self.buffer[off + 2] = b;
            }
        }
    }

    /// Resolves a mapped pixel's channels into an RGB color.
    fn resolve(p: VirtualPixel, data: &[u8]) -> (u8, u8, u8) {
        match p.order {
            ColorOrder::Rgbw => {
                // White channel lifts all three components.
                let w = data[p.ch + 3];
                (
                    data[p.ch].saturating_add(w),
                    data[p.ch + 1].saturating_add(w),
                    data[p.ch + 2].saturating_add(w),
                )
            }
            ColorOrder::Red => (data[p.ch], 0, 0),
            ColorOrder::Green => (0, data[p.ch], 0),
            ColorOrder::Blue => (0, 0, data[p.ch]),
            ColorOrder::White => {
                let v = data[p.ch];
                (v, v, v)
            }
            order => {
                let [ri, gi, bi] = order
                    .rgb_indices()
                    .unwrap_or([0, 1, 2]);
                (data[p.ch + ri], data[p.ch + gi], data[p.ch + bi])
            }
        }
    }

    /// Read access to the composed frame, for previews and tests.
    pub fn frame(&self) -> &[u8] {
        &self.buffer
    }
}

impl OutputSurface for VirtualDisplaySurface {
    fn render(&mut self, channel_data: &[u8]) -> Result<usize, OutputError> {
        if channel_data.len() < self.channel_count {
            return Err(OutputError::Config(format!(
                "render called with {} channels, surface needs {}",
                channel_data.len(),
                self.channel_count
            )));
        }
        for i in 0..self.pixels.len() {
            let p = self.pixels[i];
            let (r, g, b) = Self::resolve(p, channel_data);
            self.draw_pixel(p.x, p.y, r, g, b);
        }
        Ok(self.channel_count)
    }

    fn channel_range(&self) -> (usize, usize) {
        (
            self.start_channel,
            self.start_channel + self.channel_count.max(1) - 1,
        )
    }

    fn dump_config(&self) {
        debug!("VirtualDisplaySurface::dump_config()");
        debug!("    width      : {}", self.width);
        debug!("    height     : {}", self.height);
        debug!("    pixel size : {}", self.pixel_size);
        debug!("    pixels     : {}", self.pixels.len());
    }

    fn close(&mut self) -> Result<(), OutputError> {
        // Nothing to release; the buffer drops with the surface.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(text: &str) -> PixelLayout {
        PixelLayout::parse(text).unwrap()
    }

    #[test]
    fn parses_layout_lines_with_defaults_and_comments() {
        let l = layout("# preview map\n0,0,0\n3,1,6,BGR\n\n2,2,12,White\n");
        assert_eq!(l.pixels.len(), 3);
        assert_eq!(l.pixels[0].order, ColorOrder::Rgb);
        assert_eq!(l.pixels[1], VirtualPixel { x: 3, y: 1, ch: 6, order: ColorOrder::Bgr });
        assert_eq!(l.pixels[2].order, ColorOrder::White);
    }

    #[test]
    fn rejects_malformed_layout_lines() {
        assert!(PixelLayout::parse("0,0").is_err());
        assert!(PixelLayout::parse("a,0,0").is_err());
        assert!(PixelLayout::parse("0,0,0,Purple").is_err());
    }

    #[test]
    fn mapped_pixels_composite_and_background_survives() {
        let mut surface =
            VirtualDisplaySurface::new(4, 4, 1, 0, 6, layout("0,0,0\n2,3,3,BGR")).unwrap();
        surface.background.fill(9);
        surface.buffer.copy_from_slice(&surface.background.clone());

        let data = [10, 20, 30, 40, 50, 60];
        assert_eq!(surface.render(&data).unwrap(), 6);

        let frame = surface.frame();
        // RGB pixel at (0,0).
        assert_eq!(&frame[0..3], &[10, 20, 30]);
        // BGR pixel at (2,3): channels 3..6 are (B,G,R).
        let off = (3 * 4 + 2) * 3;
        assert_eq!(&frame[off..off + 3], &[60, 50, 40]);
        // An unmapped position keeps the background.
        let off = (1 * 4 + 1) * 3;
        assert_eq!(&frame[off..off + 3], &[9, 9, 9]);
    }

    #[test]
    fn pixel_size_fills_a_block() {
        let mut surface = VirtualDisplaySurface::new(4, 4, 2, 0, 3, layout("1,1,0")).unwrap();
        surface.render(&[255, 0, 0]).unwrap();
        for (x, y) in [(1, 1), (2, 1), (1, 2), (2, 2)] {
            let off = (y * 4 + x) * 3;
            assert_eq!(&surface.frame()[off..off + 3], &[255, 0, 0], "({x},{y})");
        }
        assert_eq!(&surface.frame()[0..3], &[0, 0, 0]);
    }

    #[test]
    fn single_color_and_rgbw_roles() {
        let mut surface = VirtualDisplaySurface::new(4, 1, 1, 0, 6, layout("0,0,0,Blue\n1,0,1,RGBW"))
            .unwrap();
        surface.render(&[200, 10, 20, 30, 100, 0]).unwrap();
        assert_eq!(&surface.frame()[0..3], &[0, 0, 200]);
        // RGBW at channels 1..5: (10,20,30) lifted by w=100.
        assert_eq!(&surface.frame()[3..6], &[110, 120, 130]);
    }

    #[test]
    fn out_of_range_pixels_fail_construction() {
        assert!(VirtualDisplaySurface::new(2, 2, 1, 0, 3, layout("2,0,0")).is_err());
        assert!(VirtualDisplaySurface::new(2, 2, 1, 0, 3, layout("0,0,1")).is_err());
    }

    #[test]
    fn channel_range_reports_occupancy() {
        let surface = VirtualDisplaySurface::new(2, 2, 1, 100, 12, PixelLayout::default()).unwrap();
        assert_eq!(surface.channel_range(), (100, 111));
    }
}
