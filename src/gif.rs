//! GIF decoding.
//!
//! A GIF is a screen descriptor followed by a sequence of records:
//! extensions, image descriptors with their LZW-compressed pixels, and a
//! trailer. Every image descriptor becomes one [`Frame`].

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::palette::Palette;
use crate::{
    le_u16, read_u8, skip, BlendOp, ByteStream, DecodeConfig, DisposeOp, Error, Frame, ImageReader, Input, Offset,
    Pixel, ResourceTracker, Result, ToUsize as _,
};
use arrayvec::ArrayVec;
use log::{debug, warn};
use std::io::Read;
use weezl::{decode::Decoder as LzwDecoder, BitOrder, LzwStatus};

pub(crate) const GIF_SIGNATURE: &[u8] = b"GIF";

const EXTENSION_INTRODUCER: u8 = 0x21;
const IMAGE_DESCRIPTOR: u8 = 0x2c;
const TRAILER: u8 = 0x3b;

const GRAPHIC_CONTROL_LABEL: u8 = 0xf9;
const APPLICATION_LABEL: u8 = 0xff;

const NETSCAPE_APPLICATION: &[u8] = b"NETSCAPE2.0";

/// GIF allows codes of up to 12 bits; the initial size must leave room to grow.
const MAX_MIN_CODE_SIZE: u8 = 11;

/// Interlaced rows are stored in four passes of (first row, row step).
const INTERLACE_PASSES: [(u32, u32); 4] = [(0, 8), (4, 8), (2, 4), (1, 2)];
const SEQUENTIAL: [(u32, u32); 1] = [(0, 1)];

type SubBlock = ArrayVec<u8, 255>;

/// Read one data sub-block into `block`. Returns `false` at the block terminator.
fn read_sub_block<T: Read>(src: &mut T, block: &mut SubBlock) -> Result<bool> {
    block.clear();
    let len = usize::from(read_u8(src)?);
    if len == 0 {
        return Ok(false);
    }
    let mut bytes = [0u8; 255];
    src.read_exact(&mut bytes[..len])?;
    block
        .try_extend_from_slice(&bytes[..len])
        .map_err(|_| Error::InvalidData("sub-block too long"))?;
    Ok(true)
}

/// Skip sub-blocks up to and including the terminator.
fn skip_sub_blocks<T: Read>(src: &mut T) -> Result<()> {
    loop {
        let len = read_u8(src)?;
        if len == 0 {
            return Ok(());
        }
        skip(src, u64::from(len))?;
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ScreenDescriptor {
    width: u16,
    height: u16,
    global_palette: Option<Palette>,
}

impl ScreenDescriptor {
    fn read<T: Read>(src: &mut T) -> Result<Self> {
        let mut header = [0u8; 6];
        src.read_exact(&mut header)?;
        let (signature, version) = header.split_at(3);
        if signature != GIF_SIGNATURE {
            return Err(Error::InvalidData("not a GIF signature"));
        }
        if version != b"87a" && version != b"89a" {
            warn!("unknown GIF version {:?}", String::from_utf8_lossy(version));
        }
        let width = le_u16(src)?;
        let height = le_u16(src)?;
        let flags = read_u8(src)?;
        let _background_index = read_u8(src)?;
        let _aspect_ratio = read_u8(src)?;
        let global_palette = match flags & 0x80 {
            0 => None,
            _ => Some(Palette::read_from(src, 2 << (flags & 0x07))?),
        };
        Ok(Self {
            width,
            height,
            global_palette,
        })
    }
}

/// Contents of a graphic control extension.
#[derive(Debug, Clone, Copy, PartialEq)]
struct GraphicControl {
    dispose: DisposeOp,
    /// Seconds.
    delay: f64,
    transparent: Option<u8>,
}

impl GraphicControl {
    fn parse(block: &[u8]) -> Option<Self> {
        let &[packed, delay_lo, delay_hi, transparent_index] = block else {
            return None;
        };
        let dispose = match (packed >> 2) & 0x07 {
            2 => DisposeOp::Background,
            3 => DisposeOp::Previous,
            _ => DisposeOp::None,
        };
        let centiseconds = u16::from_le_bytes([delay_lo, delay_hi]);
        Some(Self {
            dispose,
            delay: f64::from(centiseconds) / 100.0,
            transparent: (packed & 0x01 != 0).then_some(transparent_index),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ImageDescriptor {
    left: u16,
    top: u16,
    width: u16,
    height: u16,
    interlaced: bool,
}

/// Pulls decoded color indices out of the LZW-compressed sub-blocks of
/// one image, a row at a time.
struct LzwRows<'a, T> {
    src: &'a mut T,
    decoder: LzwDecoder,
    block: SubBlock,
    pos: usize,
    blocks_ended: bool,
}

impl<'a, T: Read> LzwRows<'a, T> {
    fn new(src: &'a mut T, min_code_size: u8) -> Self {
        Self {
            src,
            decoder: LzwDecoder::new(BitOrder::Lsb, min_code_size),
            block: SubBlock::new(),
            pos: 0,
            blocks_ended: false,
        }
    }

    fn read_line(&mut self, row: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < row.len() {
            let result = self.decoder.decode_bytes(&self.block[self.pos..], &mut row[filled..]);
            self.pos += result.consumed_in;
            filled += result.consumed_out;
            match result.status {
                Ok(LzwStatus::Ok | LzwStatus::NoProgress) => {
                    if result.consumed_in == 0 && result.consumed_out == 0 {
                        self.next_block()?;
                    }
                },
                Ok(LzwStatus::Done) if filled < row.len() => {
                    return Err(Error::InvalidData("image data ended early"));
                },
                Ok(LzwStatus::Done) => {},
                Err(err) => {
                    debug!("LZW: {err}");
                    return Err(Error::InvalidData("corrupt LZW data"));
                },
            }
        }
        Ok(())
    }

    /// Load the next data sub-block once the decoder has used up the current one.
    fn next_block(&mut self) -> Result<()> {
        if self.pos < self.block.len() {
            return Err(Error::InvalidData("LZW decoding made no progress"));
        }
        if self.blocks_ended || !read_sub_block(self.src, &mut self.block)? {
            self.blocks_ended = true;
            return Err(Error::InvalidData("image data ended early"));
        }
        self.pos = 0;
        Ok(())
    }

    /// Discard whatever data sub-blocks remain after the last row.
    fn finish(self) -> Result<()> {
        if self.blocks_ended {
            return Ok(());
        }
        if self.pos < self.block.len() {
            debug!("dropping {} trailing LZW bytes", self.block.len() - self.pos);
        }
        skip_sub_blocks(self.src)
    }
}

/// Everything known about an open GIF stream.
struct Decoding {
    screen: ScreenDescriptor,
    loop_count: Option<u32>,
    /// The trailer has been read.
    terminated: bool,
    row: Vec<u8>,
}

impl Decoding {
    fn open<T: Read>(src: &mut T, config: &DecodeConfig) -> Result<Self> {
        let screen = ScreenDescriptor::read(src)?;
        ResourceTracker::new(config).validate_frame_pixels(screen.width.into(), screen.height.into())?;
        debug!("GIF screen {}x{}", screen.width, screen.height);
        Ok(Self {
            screen,
            loop_count: None,
            terminated: false,
            row: Vec::new(),
        })
    }

    /// Walk records until the next image. Returns `false` at the trailer.
    fn next_frame<T: Read + Offset>(
        &mut self,
        src: &mut T,
        config: &DecodeConfig,
        frames_read: u32,
        frame: &mut Frame,
    ) -> Result<bool> {
        let mut control = None;
        loop {
            let offset = src.offset();
            match read_u8(src)? {
                EXTENSION_INTRODUCER => {
                    if let Some(gce) = self.read_extension(src)? {
                        control = Some(gce);
                    }
                },
                IMAGE_DESCRIPTOR => {
                    let count = frames_read
                        .checked_add(1)
                        .ok_or(Error::ResourceLimitExceeded("too many frames"))?;
                    ResourceTracker::new(config).validate_animation_frames(count)?;
                    self.read_image(src, config, control, frame)?;
                    return Ok(true);
                },
                TRAILER => {
                    debug!("GIF trailer at offset {offset}");
                    self.terminated = true;
                    return Ok(false);
                },
                _ => return Err(Error::InvalidData("unknown GIF record type")),
            }
        }
    }

    /// Consume one extension. Returns its contents if it is a graphic control extension.
    fn read_extension<T: Read>(&mut self, src: &mut T) -> Result<Option<GraphicControl>> {
        let label = read_u8(src)?;
        let mut block = SubBlock::new();
        if !read_sub_block(src, &mut block)? {
            return Ok(None);
        }
        let mut control = None;
        match label {
            GRAPHIC_CONTROL_LABEL => {
                control = GraphicControl::parse(&block);
                if control.is_none() {
                    debug!("ignoring graphic control extension of {} bytes", block.len());
                }
            },
            APPLICATION_LABEL if &block[..] == NETSCAPE_APPLICATION => {
                if !read_sub_block(src, &mut block)? {
                    return Ok(None);
                }
                if let &[1, lo, hi] = &block[..] {
                    let loops = u16::from_le_bytes([lo, hi]);
                    debug!("loop count {loops}");
                    self.loop_count = Some(loops.into());
                }
            },
            _ => debug!("skipping extension 0x{label:02x}"),
        }
        skip_sub_blocks(src)?;
        Ok(control)
    }

    fn read_image<T: Read>(
        &mut self,
        src: &mut T,
        config: &DecodeConfig,
        control: Option<GraphicControl>,
        frame: &mut Frame,
    ) -> Result<()> {
        let desc = ImageDescriptor {
            left: le_u16(src)?,
            top: le_u16(src)?,
            width: le_u16(src)?,
            height: le_u16(src)?,
            interlaced: false,
        };
        let flags = read_u8(src)?;
        let desc = ImageDescriptor {
            interlaced: flags & 0x40 != 0,
            ..desc
        };
        let local_palette = match flags & 0x80 {
            0 => None,
            _ => Some(Palette::read_from(src, 2 << (flags & 0x07))?),
        };
        debug!("{desc:?}, local color table: {}", local_palette.is_some());

        let right = u32::from(desc.left) + u32::from(desc.width);
        let bottom = u32::from(desc.top) + u32::from(desc.height);
        if right > u32::from(self.screen.width) || bottom > u32::from(self.screen.height) {
            warn!("frame {desc:?} extends past the {}x{} screen", self.screen.width, self.screen.height);
        }
        ResourceTracker::new(config).validate_frame_pixels(desc.width.into(), desc.height.into())?;

        let palette = local_palette
            .as_ref()
            .or(self.screen.global_palette.as_ref())
            .ok_or(Error::InvalidData("image has no color table"))?;

        let min_code_size = read_u8(src)?;
        if min_code_size > MAX_MIN_CODE_SIZE {
            return Err(Error::InvalidData("LZW minimum code size too large"));
        }

        frame.x = desc.left.into();
        frame.y = desc.top.into();
        frame.width = desc.width.into();
        frame.height = desc.height.into();
        frame.blend_op = BlendOp::Over;
        frame.dispose_op = control.map_or(DisposeOp::None, |c| c.dispose);
        frame.delay = control.map_or(0.0, |c| c.delay);
        frame.allocate_pixels()?;

        let width = frame.width.to_usize();
        self.row.clear();
        self.row.try_reserve_exact(width)?;
        self.row.resize(width, 0);

        let transparent = control.and_then(|c| c.transparent);
        let mut rows = LzwRows::new(src, min_code_size);
        for y in row_order(frame.height, desc.interlaced) {
            rows.read_line(&mut self.row)?;
            let start = y.to_usize() * width;
            let dest = frame
                .pixels
                .get_mut(start..start + width)
                .ok_or(Error::InvalidData("row outside frame"))?;
            for (pixel, &index) in dest.iter_mut().zip(&self.row) {
                *pixel = if Some(index) == transparent {
                    Pixel::TRANSPARENT
                } else {
                    palette
                        .get(index)
                        .ok_or(Error::InvalidData("color index invalid or out of bounds"))?
                };
            }
        }
        rows.finish()
    }
}

/// Destination row indices in the order rows are stored.
fn row_order(height: u32, interlaced: bool) -> impl Iterator<Item = u32> {
    let passes = if interlaced { &INTERLACE_PASSES[..] } else { &SEQUENTIAL[..] };
    passes
        .iter()
        .flat_map(move |&(start, step)| (start..height).step_by(step.to_usize()))
}

/// Decoder for GIF87a and GIF89a streams.
///
/// GIF does not declare its frame count, so [`ImageReader::num_frames`]
/// is always 0; call [`ImageReader::read`] until it returns `false`.
pub struct GifReader<S: ByteStream> {
    input: Input<S>,
    config: DecodeConfig,
    state: Option<Decoding>,
    current_frame: u32,
}

impl<S: ByteStream> GifReader<S> {
    /// Open a GIF stream with the default [`DecodeConfig`].
    pub fn new(stream: S) -> Result<Self> {
        Self::with_config(stream, DecodeConfig::default())
    }

    pub fn with_config(stream: S, config: DecodeConfig) -> Result<Self> {
        let mut reader = Self {
            input: Input::new(stream),
            config,
            state: None,
            current_frame: 0,
        };
        reader.open()?;
        Ok(reader)
    }

    fn open(&mut self) -> Result<()> {
        self.release();
        self.input.rewind()?;
        let state = Decoding::open(&mut self.input, &self.config);
        self.state = Some(state.inspect_err(|err| warn!("GIF open failed: {err}"))?);
        Ok(())
    }

    fn release(&mut self) {
        self.state = None;
        self.current_frame = 0;
    }
}

impl<S: ByteStream> ImageReader for GifReader<S> {
    fn width(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.screen.width.into())
    }

    fn height(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.screen.height.into())
    }

    fn num_frames(&self) -> u32 {
        0
    }

    fn current_frame(&self) -> u32 {
        self.current_frame
    }

    fn loop_count(&self) -> Option<u32> {
        self.state.as_ref().and_then(|s| s.loop_count)
    }

    fn read(&mut self, frame: &mut Frame) -> Result<bool> {
        let state = self.state.as_mut().ok_or(Error::Released)?;
        if state.terminated {
            return Ok(false);
        }
        match state.next_frame(&mut self.input, &self.config, self.current_frame, frame) {
            Ok(decoded) => {
                if decoded {
                    self.current_frame += 1;
                }
                Ok(decoded)
            },
            Err(err) => {
                warn!("GIF frame {} failed at offset {}: {err}", self.current_frame, self.input.offset());
                self.release();
                Err(err)
            },
        }
    }

    fn restart(&mut self) -> Result<()> {
        self.open()
    }
}

#[test]
fn graphic_control_parse() {
    let gce = GraphicControl::parse(&[0b0000_1001, 10, 0, 7]).unwrap();
    assert_eq!(gce.dispose, DisposeOp::Background);
    assert_eq!(gce.delay, 0.1);
    assert_eq!(gce.transparent, Some(7));

    let gce = GraphicControl::parse(&[0b0000_1100, 0, 1, 7]).unwrap();
    assert_eq!(gce.dispose, DisposeOp::Previous);
    assert_eq!(gce.delay, 2.56);
    assert_eq!(gce.transparent, None);

    for method in [0u8, 1, 4, 7] {
        let gce = GraphicControl::parse(&[method << 2, 0, 0, 0]).unwrap();
        assert_eq!(gce.dispose, DisposeOp::None);
    }
    assert_eq!(GraphicControl::parse(&[0, 0, 0]), None);
}

#[test]
fn interlaced_row_order() {
    let rows: Vec<u32> = row_order(8, true).collect();
    assert_eq!(rows, [0, 4, 2, 6, 1, 3, 5, 7]);
    let rows: Vec<u32> = row_order(3, false).collect();
    assert_eq!(rows, [0, 1, 2]);
    let rows: Vec<u32> = row_order(3, true).collect();
    assert_eq!(rows, [0, 2, 1]);
}

#[test]
fn sub_blocks() {
    let mut src = &[2u8, 0xaa, 0xbb, 1, 0xcc, 0, 9][..];
    let mut block = SubBlock::new();
    assert!(read_sub_block(&mut src, &mut block).unwrap());
    assert_eq!(&block[..], &[0xaa, 0xbb]);
    skip_sub_blocks(&mut src).unwrap();
    assert_eq!(src, &[9]);

    let mut short = &[3u8, 1][..];
    assert!(read_sub_block(&mut short, &mut block).is_err());
}

#[test]
fn lzw_rows_span_sub_blocks() {
    let indices: Vec<u8> = (0..40u8).map(|i| i % 4).collect();
    let compressed = weezl::encode::Encoder::new(BitOrder::Lsb, 2).encode(&indices).unwrap();
    let mut data = Vec::new();
    for chunk in compressed.chunks(3) {
        data.push(chunk.len() as u8);
        data.extend_from_slice(chunk);
    }
    data.extend_from_slice(&[0, TRAILER]);

    let mut src = &data[..];
    let mut rows = LzwRows::new(&mut src, 2);
    let mut row = [0u8; 10];
    for y in 0..4 {
        rows.read_line(&mut row).unwrap();
        assert_eq!(&row[..], &indices[y * 10..y * 10 + 10]);
    }
    rows.finish().unwrap();
    assert_eq!(src, &[TRAILER]);
}
