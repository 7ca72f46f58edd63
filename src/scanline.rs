//! PNG scanline reconstruction: filter reversal, Adam7 pass layout and
//! sample conversion to RGBA.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::palette::Palette;
use crate::{Error, Pixel, Result, ToUsize as _};
use bitreader::BitReader;
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColorType {
    Grayscale,
    Rgb,
    Indexed,
    GrayscaleAlpha,
    Rgba,
}

impl ColorType {
    fn from_u8(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::Grayscale,
            2 => Self::Rgb,
            3 => Self::Indexed,
            4 => Self::GrayscaleAlpha,
            6 => Self::Rgba,
            _ => return Err(Error::InvalidData("invalid PNG color type")),
        })
    }

    fn channels(self) -> u8 {
        match self {
            Self::Grayscale | Self::Indexed => 1,
            Self::GrayscaleAlpha => 2,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }

    fn allows_bit_depth(self, depth: u8) -> bool {
        match self {
            Self::Grayscale => matches!(depth, 1 | 2 | 4 | 8 | 16),
            Self::Indexed => matches!(depth, 1 | 2 | 4 | 8),
            Self::Rgb | Self::GrayscaleAlpha | Self::Rgba => matches!(depth, 8 | 16),
        }
    }
}

/// The contents of an `IHDR` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub color_type: ColorType,
    pub interlaced: bool,
}

impl ImageHeader {
    pub(crate) const SIZE: usize = 13;

    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let data: &[u8; Self::SIZE] = data
            .try_into()
            .map_err(|_| Error::InvalidData("IHDR has the wrong length"))?;
        let width = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let height = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let bit_depth = data[8];
        let color_type = ColorType::from_u8(data[9])?;
        if width == 0 || height == 0 {
            return Err(Error::InvalidData("image has a zero dimension"));
        }
        if !color_type.allows_bit_depth(bit_depth) {
            return Err(Error::InvalidData("invalid bit depth for color type"));
        }
        if data[10] != 0 {
            return Err(Error::Unsupported("unknown compression method"));
        }
        if data[11] != 0 {
            return Err(Error::Unsupported("unknown filter method"));
        }
        let interlaced = match data[12] {
            0 => false,
            1 => true,
            _ => return Err(Error::Unsupported("unknown interlace method")),
        };
        Ok(Self {
            width,
            height,
            bit_depth,
            color_type,
            interlaced,
        })
    }

    fn bits_per_pixel(&self) -> usize {
        usize::from(self.color_type.channels()) * usize::from(self.bit_depth)
    }

    /// Distance in bytes to the corresponding byte of the pixel on the left.
    fn filter_stride(&self) -> usize {
        self.bits_per_pixel().div_ceil(8)
    }

    /// Bytes of sample data in one row `width` pixels wide, filter byte excluded.
    fn row_bytes(&self, width: u32) -> Result<usize> {
        width
            .to_usize()
            .checked_mul(self.bits_per_pixel())
            .map(|bits| bits.div_ceil(8))
            .ok_or(Error::InvalidData("row size overflow"))
    }

    /// Parse a `tRNS` chunk for a grayscale image into the gray level that
    /// marks a pixel as transparent. Truecolor rows are always opaque, so
    /// their key is ignored.
    pub(crate) fn color_key(&self, trns: &[u8]) -> Result<Option<ColorKey>> {
        match self.color_type {
            ColorType::Grayscale => match *trns {
                [hi, lo, ..] => Ok(Some(u16::from_be_bytes([hi, lo]))),
                _ => Err(Error::InvalidData("tRNS chunk too short")),
            },
            ColorType::Rgb => {
                debug!("ignoring tRNS color key for a truecolor image");
                Ok(None)
            },
            ColorType::Indexed => Ok(None),
            ColorType::GrayscaleAlpha | ColorType::Rgba => {
                warn!("ignoring tRNS for a color type with an alpha channel");
                Ok(None)
            },
        }
    }
}

/// Gray sample value drawn fully transparent.
pub(crate) type ColorKey = u16;

/// Adam7 passes as (x start, y start, x step, y step).
const ADAM7: [(u32, u32, u32, u32); 7] = [
    (0, 0, 8, 8),
    (4, 0, 8, 8),
    (0, 4, 4, 8),
    (2, 0, 4, 4),
    (0, 2, 2, 4),
    (1, 0, 2, 2),
    (0, 1, 1, 2),
];

const NO_INTERLACE: [(u32, u32, u32, u32); 1] = [(0, 0, 1, 1)];

fn passes(interlaced: bool) -> &'static [(u32, u32, u32, u32)] {
    if interlaced { &ADAM7[..] } else { &NO_INTERLACE[..] }
}

fn pass_extent(size: u32, start: u32, step: u32) -> u32 {
    if size > start { (size - start).div_ceil(step) } else { 0 }
}

/// Number of inflated bytes a `width`×`height` frame occupies, filter bytes included.
pub(crate) fn image_data_len(header: &ImageHeader, width: u32, height: u32) -> Result<usize> {
    let mut total = 0usize;
    for &(x0, y0, dx, dy) in passes(header.interlaced) {
        let (pw, ph) = (pass_extent(width, x0, dx), pass_extent(height, y0, dy));
        if pw == 0 || ph == 0 {
            continue;
        }
        total = header
            .row_bytes(pw)?
            .checked_add(1)
            .and_then(|row| row.checked_mul(ph.to_usize()))
            .and_then(|pass| pass.checked_add(total))
            .ok_or(Error::InvalidData("image data size overflow"))?;
    }
    Ok(total)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let (ia, ib, ic) = (i16::from(a), i16::from(b), i16::from(c));
    let p = ia + ib - ic;
    let (pa, pb, pc) = ((p - ia).abs(), (p - ib).abs(), (p - ic).abs());
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

/// Reverse one row's filter in place. `prev` is the already reconstructed
/// row above, absent for the first row of a pass.
fn unfilter(filter: u8, stride: usize, prev: Option<&[u8]>, row: &mut [u8]) -> Result<()> {
    let up = |i: usize| prev.map_or(0, |p| p[i]);
    match filter {
        0 => {},
        1 => {
            for i in stride..row.len() {
                row[i] = row[i].wrapping_add(row[i - stride]);
            }
        },
        2 => {
            if let Some(prev) = prev {
                for (cur, &above) in row.iter_mut().zip(prev) {
                    *cur = cur.wrapping_add(above);
                }
            }
        },
        3 => {
            for i in 0..row.len() {
                let left = if i >= stride { row[i - stride] } else { 0 };
                let avg = (u16::from(left) + u16::from(up(i))) / 2;
                row[i] = row[i].wrapping_add(avg as u8);
            }
        },
        4 => {
            for i in 0..row.len() {
                let (left, upper_left) = if i >= stride {
                    (row[i - stride], up(i - stride))
                } else {
                    (0, 0)
                };
                row[i] = row[i].wrapping_add(paeth(left, up(i), upper_left));
            }
        },
        _ => return Err(Error::InvalidData("unknown scanline filter type")),
    }
    Ok(())
}

/// Turns reconstructed sample rows into RGBA pixels.
pub(crate) struct RowConverter<'a> {
    pub header: &'a ImageHeader,
    pub palette: Option<&'a Palette>,
    pub color_key: Option<ColorKey>,
}

impl RowConverter<'_> {
    fn scale(&self, sample: u16) -> u8 {
        match self.header.bit_depth {
            16 => (sample >> 8) as u8,
            8 => sample as u8,
            4 => (sample * 17) as u8,
            2 => (sample * 85) as u8,
            _ => (sample * 255) as u8,
        }
    }

    /// Convert the first `width` pixels of `row`, handing each to `put`
    /// along with its column.
    fn expand_row(&self, row: &[u8], width: u32, mut put: impl FnMut(u32, Pixel) -> Result<()>) -> Result<()> {
        let depth = self.header.bit_depth;
        let mut bits = BitReader::new(row);
        let mut samples = [0u16; 4];
        for col in 0..width {
            let channels = &mut samples[..usize::from(self.header.color_type.channels())];
            for sample in channels.iter_mut() {
                *sample = bits.read_u16(depth)?;
            }
            let pixel = match self.header.color_type {
                ColorType::Grayscale => {
                    let g = self.scale(samples[0]);
                    let alpha = if self.color_key == Some(samples[0]) { 0 } else { 0xff };
                    Pixel::new(g, g, g, alpha)
                },
                ColorType::Rgb => Pixel::opaque(self.scale(samples[0]), self.scale(samples[1]), self.scale(samples[2])),
                ColorType::Indexed => self
                    .palette
                    .and_then(|palette| palette.get(samples[0] as u8))
                    .ok_or(Error::InvalidData("palette index out of bounds"))?,
                ColorType::GrayscaleAlpha => {
                    let g = self.scale(samples[0]);
                    Pixel::new(g, g, g, self.scale(samples[1]))
                },
                ColorType::Rgba => Pixel::new(
                    self.scale(samples[0]),
                    self.scale(samples[1]),
                    self.scale(samples[2]),
                    self.scale(samples[3]),
                ),
            };
            put(col, pixel)?;
        }
        Ok(())
    }

    /// Unfilter `data` in place and write the `width`×`height` image it
    /// holds into `pixels`, placing Adam7 passes at their final positions.
    pub(crate) fn decode_image(&self, width: u32, height: u32, data: &mut [u8], pixels: &mut [Pixel]) -> Result<()> {
        let stride = self.header.filter_stride();
        let mut rest = data;
        for &(x0, y0, dx, dy) in passes(self.header.interlaced) {
            let (pw, ph) = (pass_extent(width, x0, dx), pass_extent(height, y0, dy));
            if pw == 0 || ph == 0 {
                continue;
            }
            let line = self.header.row_bytes(pw)? + 1;
            let pass_len = line * ph.to_usize();
            if rest.len() < pass_len {
                return Err(Error::InvalidData("image data too short"));
            }
            let (pass, tail) = std::mem::take(&mut rest).split_at_mut(pass_len);
            rest = tail;

            for r in 0..ph {
                let (above, current) = pass.split_at_mut(r.to_usize() * line);
                let prev = above.len().checked_sub(line - 1).map(|start| &above[start..]);
                let (filter, row) = current[..line].split_at_mut(1);
                unfilter(filter[0], stride, prev, row)?;

                let y = y0 + r * dy;
                self.expand_row(row, pw, |col, pixel| {
                    let x = x0 + col * dx;
                    let index = y.to_usize() * width.to_usize() + x.to_usize();
                    *pixels
                        .get_mut(index)
                        .ok_or(Error::InvalidData("pixel outside frame"))? = pixel;
                    Ok(())
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
fn rgb8() -> ImageHeader {
    ImageHeader {
        width: 2,
        height: 2,
        bit_depth: 8,
        color_type: ColorType::Rgb,
        interlaced: false,
    }
}

#[test]
fn header_validation() {
    let mut ihdr = [0, 0, 0, 4, 0, 0, 0, 3, 8, 6, 0, 0, 0];
    let header = ImageHeader::parse(&ihdr).unwrap();
    assert_eq!((header.width, header.height), (4, 3));
    assert_eq!(header.color_type, ColorType::Rgba);
    ihdr[8] = 4;
    assert!(ImageHeader::parse(&ihdr).is_err());
    ihdr[8] = 8;
    ihdr[12] = 2;
    assert!(ImageHeader::parse(&ihdr).is_err());
    assert!(ImageHeader::parse(&ihdr[..12]).is_err());
}

#[test]
fn transparency_keys() {
    let mut header = rgb8();
    assert_eq!(header.color_key(&[0, 10, 0, 20, 0, 30]).unwrap(), None);
    header.color_type = ColorType::Grayscale;
    assert_eq!(header.color_key(&[0x01, 0x02]).unwrap(), Some(0x0102));
    assert!(header.color_key(&[7]).is_err());
}

#[test]
fn paeth_predictor() {
    assert_eq!(paeth(10, 20, 10), 20);
    assert_eq!(paeth(20, 10, 10), 20);
    assert_eq!(paeth(10, 10, 20), 10);
    assert_eq!(paeth(0, 0, 0), 0);
}

#[test]
fn filters_reverse() {
    let prev = [10u8, 20, 30, 40];
    let mut row = [1u8, 2, 3, 4];
    unfilter(1, 2, Some(&prev), &mut row).unwrap();
    assert_eq!(row, [1, 2, 4, 6]);

    let mut row = [1u8, 2, 3, 4];
    unfilter(2, 2, Some(&prev), &mut row).unwrap();
    assert_eq!(row, [11, 22, 33, 44]);

    let mut row = [1u8, 2, 3, 4];
    unfilter(3, 2, Some(&prev), &mut row).unwrap();
    assert_eq!(row, [6, 12, 3 + 18, 4 + 26]);

    let mut row = [1u8, 2, 3, 4];
    unfilter(2, 2, None, &mut row).unwrap();
    assert_eq!(row, [1, 2, 3, 4]);

    assert!(unfilter(5, 1, None, &mut row).is_err());
}

#[test]
fn adam7_data_len() {
    let mut header = rgb8();
    assert_eq!(image_data_len(&header, 2, 2).unwrap(), 2 * (1 + 6));
    header.interlaced = true;
    // 2x2 uses passes 1 (1px), 6 (1px) and 7 (2px row).
    assert_eq!(image_data_len(&header, 2, 2).unwrap(), (1 + 3) + (1 + 3) + (1 + 6));
}

#[test]
fn decode_plain_rgb() {
    let header = rgb8();
    let converter = RowConverter {
        header: &header,
        palette: None,
        color_key: None,
    };
    let mut data = [0, 1, 2, 3, 4, 5, 6, 2, 1, 1, 1, 1, 1, 1];
    let mut pixels = [Pixel::TRANSPARENT; 4];
    converter.decode_image(2, 2, &mut data, &mut pixels).unwrap();
    assert_eq!(pixels[0], Pixel::opaque(1, 2, 3));
    assert_eq!(pixels[1], Pixel::opaque(4, 5, 6));
    assert_eq!(pixels[2], Pixel::opaque(2, 3, 4));
    assert_eq!(pixels[3], Pixel::opaque(5, 6, 7));
}

#[test]
fn decode_sub_byte_gray_and_palette() {
    let header = ImageHeader {
        width: 4,
        height: 1,
        bit_depth: 2,
        color_type: ColorType::Grayscale,
        interlaced: false,
    };
    let converter = RowConverter {
        header: &header,
        palette: None,
        color_key: Some(2),
    };
    let mut data = [0, 0b00_01_10_11];
    let mut pixels = [Pixel::TRANSPARENT; 4];
    converter.decode_image(4, 1, &mut data, &mut pixels).unwrap();
    let grays: Vec<u8> = pixels.iter().map(|p| p.red).collect();
    assert_eq!(grays, [0, 85, 170, 255]);
    let alphas: Vec<u8> = pixels.iter().map(|p| p.alpha).collect();
    assert_eq!(alphas, [255, 255, 0, 255]);

    let palette = Palette::from_rgb(&[9, 9, 9, 7, 7, 7]).unwrap();
    let header = ImageHeader {
        bit_depth: 1,
        color_type: ColorType::Indexed,
        ..header
    };
    let converter = RowConverter {
        header: &header,
        palette: Some(&palette),
        color_key: None,
    };
    let mut data = [0, 0b0100_0000];
    converter.decode_image(4, 1, &mut data, &mut pixels).unwrap();
    assert_eq!(pixels[1], Pixel::opaque(7, 7, 7));
    assert_eq!(pixels[0], Pixel::opaque(9, 9, 9));

    let mut data = [0, 0b0010_0000];
    let small = Palette::from_rgb(&[1, 1, 1]).unwrap();
    let converter = RowConverter {
        palette: Some(&small),
        ..converter
    };
    assert!(converter.decode_image(4, 1, &mut data, &mut pixels).is_err());
}

#[test]
fn decode_sixteen_bit_keeps_high_byte() {
    let header = ImageHeader {
        width: 1,
        height: 1,
        bit_depth: 16,
        color_type: ColorType::GrayscaleAlpha,
        interlaced: false,
    };
    let converter = RowConverter {
        header: &header,
        palette: None,
        color_key: None,
    };
    let mut data = [0, 0x12, 0x34, 0x80, 0x01];
    let mut pixels = [Pixel::TRANSPARENT; 1];
    converter.decode_image(1, 1, &mut data, &mut pixels).unwrap();
    assert_eq!(pixels[0], Pixel::new(0x12, 0x12, 0x12, 0x80));
}
