//! Decoded frames and the per-frame compositing metadata.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Error, Result, ToUsize as _};

/// One RGBA color, eight bits per channel, laid out `R, G, B, A`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Pixel {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Pixel {
    /// All channels zero.
    pub const TRANSPARENT: Self = Self::new(0, 0, 0, 0);

    pub const fn new(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self { red, green, blue, alpha }
    }

    pub const fn opaque(red: u8, green: u8, blue: u8) -> Self {
        Self::new(red, green, blue, 0xff)
    }

    pub const fn to_array(self) -> [u8; 4] {
        [self.red, self.green, self.blue, self.alpha]
    }
}

/// How a frame's pixels combine with the canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlendOp {
    /// Replace the covered canvas region, alpha included.
    #[default]
    Source,
    /// Alpha-composite the frame over the canvas.
    Over,
}

/// What happens to the frame's region before the next frame is drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisposeOp {
    /// Leave the canvas as it is.
    None,
    /// Clear the region to fully transparent black.
    #[default]
    Background,
    /// Restore the region to what it held before this frame.
    Previous,
}

/// A single decoded animation frame.
///
/// `pixels` holds `width * height` entries in row-major order covering
/// the frame rectangle at (`x`, `y`) on the canvas. Compositing onto the
/// canvas is left to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub blend_op: BlendOp,
    pub dispose_op: DisposeOp,
    /// Display duration in seconds.
    pub delay: f64,
    pub pixels: Vec<Pixel>,
}

impl Frame {
    /// Pixel data flattened to `R, G, B, A` bytes.
    pub fn rgba_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|p| p.to_array()).collect()
    }

    /// The pixel at frame-relative coordinates, if inside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Pixel> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = y.to_usize().checked_mul(self.width.to_usize())?.checked_add(x.to_usize())?;
        self.pixels.get(index).copied()
    }

    /// Resize `pixels` to cover the current rectangle, reusing the
    /// existing allocation and failing cleanly when memory runs out.
    pub(crate) fn allocate_pixels(&mut self) -> Result<()> {
        let count = self
            .width
            .to_usize()
            .checked_mul(self.height.to_usize())
            .ok_or(Error::InvalidData("frame dimensions overflow"))?;
        self.pixels.clear();
        self.pixels.try_reserve_exact(count)?;
        self.pixels.resize(count, Pixel::TRANSPARENT);
        Ok(())
    }
}

#[test]
fn pixel_lookup_is_row_major() {
    let mut frame = Frame {
        width: 2,
        height: 2,
        ..Frame::default()
    };
    frame.allocate_pixels().unwrap();
    frame.pixels[3] = Pixel::opaque(1, 2, 3);
    assert_eq!(frame.pixel(1, 1), Some(Pixel::opaque(1, 2, 3)));
    assert_eq!(frame.pixel(2, 0), None);
    assert_eq!(&frame.rgba_bytes()[12..], &[1, 2, 3, 255]);
}

#[test]
fn compositing_defaults() {
    assert_eq!(BlendOp::default(), BlendOp::Source);
    assert_eq!(DisposeOp::default(), DisposeOp::Background);
}
