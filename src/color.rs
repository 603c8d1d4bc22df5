// src/color.rs

//! Color-order definitions shared by all output surfaces, plus the
//! reduced-precision lookup cube used to encode pixels for 16-bit
//! framebuffer targets.

/// Channel ordering of a logical pixel within the flat channel buffer.
///
/// The six three-channel permutations are used by both surface variants;
/// `Rgbw` and the single-color roles only appear in virtual-display pixel
/// maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorOrder {
    Rgb,
    Rbg,
    Grb,
    Gbr,
    Brg,
    #[default]
    Bgr,
    Rgbw,
    Red,
    Green,
    Blue,
    White,
}

impl ColorOrder {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "RGB" => Some(ColorOrder::Rgb),
            "RBG" => Some(ColorOrder::Rbg),
            "GRB" => Some(ColorOrder::Grb),
            "GBR" => Some(ColorOrder::Gbr),
            "BRG" => Some(ColorOrder::Brg),
            "BGR" => Some(ColorOrder::Bgr),
            "RGBW" => Some(ColorOrder::Rgbw),
            "Red" => Some(ColorOrder::Red),
            "Green" => Some(ColorOrder::Green),
            "Blue" => Some(ColorOrder::Blue),
            "White" => Some(ColorOrder::White),
            _ => None,
        }
    }

    /// Channels one logical pixel consumes from the channel buffer.
    pub fn channels_per_pixel(self) -> usize {
        match self {
            ColorOrder::Rgbw => 4,
            ColorOrder::Red | ColorOrder::Green | ColorOrder::Blue | ColorOrder::White => 1,
            _ => 3,
        }
    }

    /// Byte positions of the R, G and B components within a pixel's
    /// channels, for the three-channel permutations. `None` for the
    /// single-color and RGBW roles.
    pub fn rgb_indices(self) -> Option<[usize; 3]> {
        match self {
            ColorOrder::Rgb => Some([0, 1, 2]),
            ColorOrder::Rbg => Some([0, 2, 1]),
            ColorOrder::Grb => Some([1, 0, 2]),
            ColorOrder::Gbr => Some([2, 0, 1]),
            ColorOrder::Brg => Some([1, 2, 0]),
            ColorOrder::Bgr => Some([2, 1, 0]),
            _ => None,
        }
    }
}

/// One color component's position within a native pixel word, as reported
/// by the display device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bitfield {
    pub offset: u32,
    pub length: u32,
}

const R_DIM: usize = 32;
const G_DIM: usize = 64;
const B_DIM: usize = 32;

/// Precomputed map from reduced-precision `(R5, G6, B5)` triples to native
/// 16-bit pixel words.
///
/// Built once per surface from the device's reported bitfield layout, then
/// immutable: the one-time `32*64*32` build buys O(1) per-pixel conversion
/// with no bit-shifting on the render path. A single flat array indexed by
/// the bounded components; there is no partial-construction state.
pub struct Rgb565Map {
    words: Box<[u16]>,
}

impl Rgb565Map {
    pub fn build(red: Bitfield, green: Bitfield, blue: Bitfield) -> Self {
        log::debug!(
            "Building RGB565 map for bitfields R: {}({} bits) G: {}({} bits) B: {}({} bits)",
            red.offset,
            red.length,
            green.offset,
            green.length,
            blue.offset,
            blue.length
        );

        let mut words = vec![0u16; R_DIM * G_DIM * B_DIM].into_boxed_slice();
        for r in 0..R_DIM as u16 {
            for g in 0..G_DIM as u16 {
                for b in 0..B_DIM as u16 {
                    words[index(r as u8, g as u8, b as u8)] =
                        place(r, 5, red) | place(g, 6, green) | place(b, 5, blue);
                }
            }
        }
        Rgb565Map { words }
    }

    /// Looks up the native word for a reduced triple. Components wider than
    /// their reduced precision are masked down rather than panicking.
    #[inline]
    pub fn lookup(&self, r5: u8, g6: u8, b5: u8) -> u16 {
        self.words[index(r5 & 0x1f, g6 & 0x3f, b5 & 0x1f)]
    }
}

#[inline]
fn index(r5: u8, g6: u8, b5: u8) -> usize {
    ((r5 as usize) << 11) | ((g6 as usize) << 5) | (b5 as usize)
}

/// Aligns a reduced component of `width` bits with its device bitfield.
/// A zero-length field masks the component out entirely.
fn place(value: u16, width: u32, field: Bitfield) -> u16 {
    if field.length == 0 || field.offset >= 16 {
        return 0;
    }
    let mask = (((1u32 << field.length.min(16)) - 1) << field.offset) as u16;
    let shift = field.offset as i32 + field.length as i32 - width as i32;
    let shifted = if shift >= 0 {
        (value as u32) << shift
    } else {
        (value as u32) >> -shift
    };
    shifted as u16 & mask
}
