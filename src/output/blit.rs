// src/output/blit.rs

//! Color-format conversion and frame-diff engine.
//!
//! A `FrameBlitter` turns a flat buffer of RGB channel triplets into the
//! native layout of a destination byte slice, keeping a snapshot of the
//! previous frame so unchanged pixels can be skipped. The destination is
//! any `&mut [u8]`: the framebuffer surface hands in its mapped device
//! region, tests hand in plain vectors.

use crate::color::{Bitfield, ColorOrder, Rgb565Map};
use crate::output::OutputError;

/// Native pixel encoding of the destination.
pub enum PixelDepth {
    /// 16-bit words encoded through a lookup cube built from the device's
    /// reported bitfields.
    Bpp16 {
        red: Bitfield,
        green: Bitfield,
        blue: Bitfield,
    },
    /// 24-bit, fixed `(B,G,R)` byte layout.
    Bpp24,
}

enum Encoding {
    Cube(Rgb565Map),
    Bytes,
}

impl Encoding {
    fn bytes_per_pixel(&self) -> usize {
        match self {
            Encoding::Cube(_) => 2,
            Encoding::Bytes => 3,
        }
    }
}

/// Renders channel data into a destination slice, diffing against the
/// previous frame. Owned by exactly one surface; the snapshot buffer is
/// overwritten on every render.
pub struct FrameBlitter {
    width: usize,
    height: usize,
    inverted: bool,
    /// Positions of R, G, B within each source triplet.
    idx: [usize; 3],
    /// True when the source byte order already matches the destination's
    /// native `(B,G,R)` layout, enabling the bulk-copy path at 24 bpp.
    native_order: bool,
    encoding: Encoding,
    last_frame: Vec<u8>,
}

impl FrameBlitter {
    pub fn new(
        width: usize,
        height: usize,
        order: ColorOrder,
        inverted: bool,
        depth: PixelDepth,
    ) -> Result<Self, OutputError> {
        let idx = order.rgb_indices().ok_or_else(|| {
            OutputError::Config(format!(
                "color order {order:?} is not a three-channel order"
            ))
        })?;
        if width == 0 || height == 0 {
            return Err(OutputError::Config(format!(
                "degenerate geometry {width}x{height}"
            )));
        }
        let encoding = match depth {
            PixelDepth::Bpp16 { red, green, blue } => {
                Encoding::Cube(Rgb565Map::build(red, green, blue))
            }
            PixelDepth::Bpp24 => Encoding::Bytes,
        };
        Ok(FrameBlitter {
            width,
            height,
            inverted,
            idx,
            native_order: order == ColorOrder::Bgr,
            encoding,
            last_frame: vec![0u8; width * height * 3],
        })
    }

    pub fn channel_count(&self) -> usize {
        self.width * self.height * 3
    }

    pub fn screen_size(&self) -> usize {
        self.width * self.height * self.encoding.bytes_per_pixel()
    }

    /// Renders one frame. `src` holds `channel_count()` bytes of channel
    /// triplets; `dst` is the destination surface, at least `screen_size()`
    /// bytes. Returns the number of channels consumed (the full buffer).
    ///
    /// The snapshot is unconditionally overwritten afterwards, bulk-copy
    /// path included, so the next diff is always against the true prior
    /// frame.
    pub fn blit(&mut self, src: &[u8], dst: &mut [u8]) -> usize {
        debug_assert_eq!(src.len(), self.channel_count());
        debug_assert!(dst.len() >= self.screen_size());

        if matches!(self.encoding, Encoding::Cube(_)) {
            self.blit16(src, dst);
        } else if self.native_order {
            self.blit24_native(src, dst);
        } else {
            self.blit24_remap(src, dst);
        }

        self.last_frame.copy_from_slice(src);
        self.channel_count()
    }

    /// Destination row for source row `y`: counts up from 0, or down from
    /// the last row when inverted. The single inversion rule shared by all
    /// render paths.
    #[inline]
    fn dest_row(&self, y: usize) -> usize {
        if self.inverted {
            self.height - 1 - y
        } else {
            y
        }
    }

    fn blit16(&mut self, src: &[u8], dst: &mut [u8]) {
        let Encoding::Cube(cube) = &self.encoding else {
            unreachable!("blit16 only runs with a cube encoding");
        };
        let [ri, gi, bi] = self.idx;
        let ostride = self.width * 2;
        for y in 0..self.height {
            let sbase = y * self.width * 3;
            let dbase = self.dest_row(y) * ostride;
            for x in 0..self.width {
                let s = sbase + x * 3;
                let px = &src[s..s + 3];
                if px == &self.last_frame[s..s + 3] {
                    continue;
                }
                let word = cube.lookup(px[ri] >> 3, px[gi] >> 2, px[bi] >> 3);
                let d = dbase + x * 2;
                dst[d..d + 2].copy_from_slice(&word.to_le_bytes());
            }
        }
    }

    fn blit24_remap(&mut self, src: &[u8], dst: &mut [u8]) {
        let [ri, gi, bi] = self.idx;
        let ostride = self.width * 3;
        for y in 0..self.height {
            let sbase = y * self.width * 3;
            let dbase = self.dest_row(y) * ostride;
            for x in 0..self.width {
                let s = sbase + x * 3;
                let px = &src[s..s + 3];
                if px == &self.last_frame[s..s + 3] {
                    continue;
                }
                let d = dbase + x * 3;
                dst[d] = px[bi];
                dst[d + 1] = px[gi];
                dst[d + 2] = px[ri];
            }
        }
    }

    fn blit24_native(&mut self, src: &[u8], dst: &mut [u8]) {
        let stride = self.width * 3;
        if !self.inverted {
            // Fastest path: no reordering, no inversion, one copy.
            dst[..src.len()].copy_from_slice(src);
            return;
        }
        for y in 0..self.height {
            let sbase = y * stride;
            let dbase = self.dest_row(y) * stride;
            dst[dbase..dbase + stride].copy_from_slice(&src[sbase..sbase + stride]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RGB565_RED: Bitfield = Bitfield {
        offset: 11,
        length: 5,
    };
    const RGB565_GREEN: Bitfield = Bitfield {
        offset: 5,
        length: 6,
    };
    const RGB565_BLUE: Bitfield = Bitfield {
        offset: 0,
        length: 5,
    };

    fn bpp16() -> PixelDepth {
        PixelDepth::Bpp16 {
            red: RGB565_RED,
            green: RGB565_GREEN,
            blue: RGB565_BLUE,
        }
    }

    /// Deterministic non-uniform frame so row comparisons are meaningful.
    fn patterned_frame(width: usize, height: usize) -> Vec<u8> {
        let mut frame = vec![0u8; width * height * 3];
        for (i, byte) in frame.iter_mut().enumerate() {
            *byte = ((i * 7 + 13) % 251) as u8;
        }
        frame
    }

    #[test]
    fn bulk_copy_leaves_native_order_untouched() {
        // 16x16, 24 bpp, BGR source, not inverted: one bulk copy. Logical
        // red stored as BGR is (0,0,255) and must land verbatim.
        let mut blitter = FrameBlitter::new(16, 16, ColorOrder::Bgr, false, PixelDepth::Bpp24)
            .unwrap();
        let src: Vec<u8> = [0u8, 0, 255].repeat(16 * 16);
        let mut dst = vec![0u8; blitter.screen_size()];
        assert_eq!(blitter.blit(&src, &mut dst), 16 * 16 * 3);
        assert_eq!(dst, src);
    }

    #[test]
    fn rgb_source_is_remapped_per_pixel() {
        // Same display, RGB source: logical red stored as (255,0,0) must be
        // reordered into the destination's (B,G,R) layout.
        let mut blitter = FrameBlitter::new(16, 16, ColorOrder::Rgb, false, PixelDepth::Bpp24)
            .unwrap();
        let src: Vec<u8> = [255u8, 0, 0].repeat(16 * 16);
        let mut dst = vec![0u8; blitter.screen_size()];
        blitter.blit(&src, &mut dst);
        for px in dst.chunks_exact(3) {
            assert_eq!(px, &[0, 0, 255]);
        }
    }

    #[test]
    fn rendering_twice_writes_nothing_the_second_time() {
        // Diff paths: a second render of an identical frame must not touch
        // the destination at all, and the snapshot must equal the input.
        for order in [ColorOrder::Rgb, ColorOrder::Grb] {
            for depth in [bpp16(), PixelDepth::Bpp24] {
                let mut blitter = FrameBlitter::new(8, 4, order, false, depth).unwrap();
                let src = patterned_frame(8, 4);
                let mut first = vec![0u8; blitter.screen_size()];
                blitter.blit(&src, &mut first);
                assert_eq!(blitter.last_frame, src);

                let mut second = vec![0u8; blitter.screen_size()];
                blitter.blit(&src, &mut second);
                assert!(second.iter().all(|&b| b == 0), "{order:?}");
                assert_eq!(blitter.last_frame, src);
            }
        }
    }

    #[test]
    fn inversion_law_holds_on_every_path() {
        // Row y rendered normally must equal row height-1-y rendered
        // inverted, on the bulk, remap and 16-bit paths alike.
        let (w, h) = (6, 5);
        let src = patterned_frame(w, h);
        let cases: [(ColorOrder, fn() -> PixelDepth); 4] = [
            (ColorOrder::Bgr, || PixelDepth::Bpp24),
            (ColorOrder::Rgb, || PixelDepth::Bpp24),
            (ColorOrder::Bgr, bpp16),
            (ColorOrder::Rgb, bpp16),
        ];
        for (order, depth) in cases {
            let mut normal = FrameBlitter::new(w, h, order, false, depth()).unwrap();
            let mut flipped = FrameBlitter::new(w, h, order, true, depth()).unwrap();
            let mut dst_n = vec![0u8; normal.screen_size()];
            let mut dst_f = vec![0u8; flipped.screen_size()];
            normal.blit(&src, &mut dst_n);
            flipped.blit(&src, &mut dst_f);

            let stride = normal.screen_size() / h;
            for y in 0..h {
                assert_eq!(
                    &dst_n[y * stride..(y + 1) * stride],
                    &dst_f[(h - 1 - y) * stride..(h - y) * stride],
                    "row {y}, order {order:?}"
                );
            }
        }
    }

    #[test]
    fn sixteen_bit_words_use_the_cube() {
        let mut blitter = FrameBlitter::new(2, 1, ColorOrder::Rgb, false, bpp16()).unwrap();
        // Pixel 0 pure red, pixel 1 pure blue.
        let src = vec![255u8, 0, 0, 0, 0, 255];
        let mut dst = vec![0u8; blitter.screen_size()];
        blitter.blit(&src, &mut dst);
        assert_eq!(u16::from_le_bytes([dst[0], dst[1]]), 0xF800);
        assert_eq!(u16::from_le_bytes([dst[2], dst[3]]), 0x001F);
    }

    #[test]
    fn sixteen_bit_diff_hits_only_the_changed_pixel() {
        // Change exactly the last pixel of the first row; the skip run up
        // to the row end must still land the write at the right offset.
        let (w, h) = (4, 2);
        let mut blitter = FrameBlitter::new(w, h, ColorOrder::Rgb, false, bpp16()).unwrap();
        let frame_a = patterned_frame(w, h);
        let mut frame_b = frame_a.clone();
        let last_px = (w - 1) * 3;
        frame_b[last_px] = frame_b[last_px].wrapping_add(128);

        let mut dst = vec![0u8; blitter.screen_size()];
        blitter.blit(&frame_a, &mut dst);
        let mut delta = vec![0u8; blitter.screen_size()];
        blitter.blit(&frame_b, &mut delta);

        for (i, chunk) in delta.chunks_exact(2).enumerate() {
            if i == w - 1 {
                let px = &frame_b[last_px..last_px + 3];
                let expected = Rgb565Map::build(RGB565_RED, RGB565_GREEN, RGB565_BLUE)
                    .lookup(px[0] >> 3, px[1] >> 2, px[2] >> 3);
                assert_eq!(u16::from_le_bytes([chunk[0], chunk[1]]), expected);
            } else {
                assert_eq!(chunk, &[0, 0], "pixel {i} should have been skipped");
            }
        }
    }

    #[test]
    fn non_rgb_orders_are_rejected() {
        for order in [ColorOrder::Rgbw, ColorOrder::White] {
            assert!(FrameBlitter::new(4, 4, order, false, PixelDepth::Bpp24).is_err());
        }
    }
}
