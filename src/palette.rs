// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Error, Pixel, Result};
use arrayvec::ArrayVec;
use std::io::Read;

/// An indexed color table of up to 256 entries, shared by the PNG `PLTE`
/// chunk and GIF global/local color tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Palette {
    colors: ArrayVec<Pixel, 256>,
}

impl Palette {
    /// Build from packed `R, G, B` triples; every entry starts opaque.
    pub(crate) fn from_rgb(rgb: &[u8]) -> Result<Self> {
        if rgb.len() % 3 != 0 {
            return Err(Error::InvalidData("palette length is not a multiple of 3"));
        }
        let mut colors = ArrayVec::new();
        for entry in rgb.chunks_exact(3) {
            colors
                .try_push(Pixel::opaque(entry[0], entry[1], entry[2]))
                .map_err(|_| Error::InvalidData("palette has more than 256 entries"))?;
        }
        Ok(Self { colors })
    }

    /// Read `entries` packed RGB triples straight from `src`.
    pub(crate) fn read_from<T: Read>(src: &mut T, entries: usize) -> Result<Self> {
        let mut rgb = [0u8; 256 * 3];
        let rgb = rgb
            .get_mut(..entries * 3)
            .ok_or(Error::InvalidData("color table has more than 256 entries"))?;
        src.read_exact(rgb)?;
        Self::from_rgb(rgb)
    }

    /// Apply per-entry alpha from a PNG `tRNS` chunk. Entries past the end
    /// of `alpha` stay opaque.
    pub(crate) fn apply_alpha(&mut self, alpha: &[u8]) -> Result<()> {
        if alpha.len() > self.colors.len() {
            return Err(Error::InvalidData("tRNS has more entries than the palette"));
        }
        for (color, &a) in self.colors.iter_mut().zip(alpha) {
            color.alpha = a;
        }
        Ok(())
    }

    pub(crate) fn get(&self, index: u8) -> Option<Pixel> {
        self.colors.get(usize::from(index)).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.colors.len()
    }
}

#[test]
fn palette_from_rgb() {
    let mut palette = Palette::from_rgb(&[1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(palette.len(), 2);
    assert_eq!(palette.get(1), Some(Pixel::opaque(4, 5, 6)));
    assert_eq!(palette.get(2), None);
    palette.apply_alpha(&[7]).unwrap();
    assert_eq!(palette.get(0), Some(Pixel::new(1, 2, 3, 7)));
    assert!(palette.apply_alpha(&[0, 0, 0]).is_err());
    assert!(Palette::from_rgb(&[0; 4]).is_err());
    assert!(Palette::from_rgb(&[0; 257 * 3]).is_err());
}

#[test]
fn palette_read_from_stream() {
    let mut src = &[9u8, 8, 7, 6, 5, 4, 3][..];
    let palette = Palette::read_from(&mut src, 2).unwrap();
    assert_eq!(palette.get(0), Some(Pixel::opaque(9, 8, 7)));
    assert_eq!(src, &[3]);
    assert!(Palette::read_from(&mut src, 1).is_err());
}
