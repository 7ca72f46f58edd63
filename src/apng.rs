//! Animated PNG decoding.
//!
//! The container is a regular PNG whose `acTL` chunk announces the frame
//! count. Each frame is introduced by an `fcTL` chunk carrying its
//! rectangle, timing and compositing codes; the first frame's pixels live
//! in the `IDAT` chunks, later frames in `fdAT` chunks. When no `fcTL`
//! precedes `IDAT`, the default image is not part of the animation.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::chunks::{ChunkType, FourCC};
use crate::palette::Palette;
use crate::scanline::{image_data_len, ColorKey, ColorType, ImageHeader, RowConverter};
use crate::{
    be_u16, be_u32, read_u8, skip, BlendOp, ByteStream, DecodeConfig, DisposeOp, Error, Frame, ImageReader, Input,
    Offset, ResourceTracker, Result, ToUsize as _,
};
use fallible_collections::TryVec;
use flate2::read::ZlibDecoder;
use log::{debug, warn};
use std::io::{Read, Take};

pub(crate) const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// PNG chunk lengths are limited to 2^31 - 1 bytes.
const MAX_CHUNK_LENGTH: u32 = 0x7fff_ffff;

/// Contents of the `acTL` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AnimationControl {
    num_frames: u32,
    /// 0 means loop forever.
    num_plays: u32,
}

impl AnimationControl {
    fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() != 8 {
            return Err(Error::InvalidData("acTL has the wrong length"));
        }
        let num_frames = be_u32(&mut data)?;
        let num_plays = be_u32(&mut data)?;
        if num_frames == 0 {
            return Err(Error::InvalidData("acTL declares no frames"));
        }
        Ok(Self { num_frames, num_plays })
    }
}

/// Contents of an `fcTL` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameControl {
    sequence: u32,
    width: u32,
    height: u32,
    x_offset: u32,
    y_offset: u32,
    delay_num: u16,
    delay_den: u16,
    dispose_op: u8,
    blend_op: u8,
}

impl FrameControl {
    fn parse(mut data: &[u8]) -> Result<Self> {
        if data.len() != 26 {
            return Err(Error::InvalidData("fcTL has the wrong length"));
        }
        let src = &mut data;
        Ok(Self {
            sequence: be_u32(src)?,
            width: be_u32(src)?,
            height: be_u32(src)?,
            x_offset: be_u32(src)?,
            y_offset: be_u32(src)?,
            delay_num: be_u16(src)?,
            delay_den: be_u16(src)?,
            dispose_op: read_u8(src)?,
            blend_op: read_u8(src)?,
        })
    }

    /// Geometry for a default image that is not part of the animation.
    fn full_canvas(header: &ImageHeader) -> Self {
        Self {
            sequence: 0,
            width: header.width,
            height: header.height,
            x_offset: 0,
            y_offset: 0,
            delay_num: 0,
            delay_den: 0,
            dispose_op: 0,
            blend_op: 0,
        }
    }

    fn covers(&self, header: &ImageHeader) -> bool {
        self.x_offset == 0 && self.y_offset == 0 && self.width == header.width && self.height == header.height
    }

    fn validate(&self, header: &ImageHeader) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidData("frame has a zero dimension"));
        }
        let right = self.x_offset.checked_add(self.width);
        let bottom = self.y_offset.checked_add(self.height);
        match (right, bottom) {
            (Some(right), Some(bottom)) if right <= header.width && bottom <= header.height => Ok(()),
            _ => Err(Error::InvalidData("frame rectangle outside the canvas")),
        }
    }

    /// Delay in seconds. A zero denominator means hundredths.
    fn delay(&self) -> f64 {
        let den = if self.delay_den == 0 { 100 } else { self.delay_den };
        if self.delay_num == 0 {
            return 0.0;
        }
        f64::from(self.delay_num) / f64::from(den)
    }

    fn dispose(&self) -> DisposeOp {
        match self.dispose_op {
            0 => DisposeOp::None,
            2 => DisposeOp::Previous,
            _ => DisposeOp::Background,
        }
    }

    fn blend(&self) -> BlendOp {
        match self.blend_op {
            1 => BlendOp::Over,
            _ => BlendOp::Source,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChunkHeader {
    name: ChunkType,
    /// Length of the chunk data, excluding name and CRC.
    length: u32,
    /// Offset of the chunk in the stream.
    offset: u64,
}

fn read_chunk_header<T: Read + Offset>(src: &mut T) -> Result<ChunkHeader> {
    let offset = src.offset();
    let length = be_u32(src)?;
    if length > MAX_CHUNK_LENGTH {
        return Err(Error::InvalidData("chunk length too large"));
    }
    let name = ChunkType::from(be_u32(src)?);
    debug!("{name:?} chunk, {length} bytes at offset {offset}");
    Ok(ChunkHeader { name, length, offset })
}

/// The data portion of one chunk. Everything read through it is added to
/// the running CRC, which [`Chunk::finish`] compares with the stored one.
struct Chunk<'a, T> {
    head: ChunkHeader,
    content: Take<&'a mut T>,
    crc: crc32fast::Hasher,
}

impl<'a, T: Read> Chunk<'a, T> {
    fn new(src: &'a mut T, head: ChunkHeader) -> Self {
        let mut crc = crc32fast::Hasher::new();
        crc.update(&u32::from(head.name).to_be_bytes());
        Self {
            head,
            content: src.take(u64::from(head.length)),
            crc,
        }
    }

    fn bytes_left(&self) -> u64 {
        self.content.limit()
    }

    fn read_into_try_vec(&mut self) -> Result<TryVec<u8>> {
        let mut data = TryVec::new();
        self.append_to(&mut data)?;
        Ok(data)
    }

    /// Append the rest of the chunk data to `dest`.
    fn append_to(&mut self, dest: &mut TryVec<u8>) -> Result<()> {
        let start = dest.len();
        let len = usize::try_from(self.bytes_left())?;
        dest.resize_with(start + len, || 0)?;
        self.read_exact(&mut dest[start..])?;
        Ok(())
    }

    /// Skip unread data, then read and verify the CRC.
    fn finish(mut self, lenient: bool) -> Result<()> {
        let left = self.bytes_left();
        if left > 0 {
            debug!("skipping {left} bytes of '{}'", FourCC::from(self.head.name));
            skip(&mut self, left)?;
        }
        let stored = be_u32(self.content.get_mut())?;
        if self.crc.finalize() != stored {
            // Unknown ancillary chunks were skipped, so their data is never used.
            let used = self.head.name.is_critical() || !matches!(self.head.name, ChunkType::UnknownChunk(_));
            if used && !lenient {
                return Err(Error::InvalidData("chunk CRC mismatch"));
            }
            warn!(
                "CRC mismatch in '{}' at offset {}",
                FourCC::from(self.head.name),
                self.head.offset
            );
        }
        Ok(())
    }
}

impl<T: Read> Read for Chunk<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let count = self.content.read(buf)?;
        self.crc.update(&buf[..count]);
        Ok(count)
    }
}

/// Check a `fcTL`/`fdAT` sequence number and advance the expected one.
fn check_sequence(expected: &mut u32, sequence: u32, lenient: bool) -> Result<()> {
    if sequence != *expected {
        if !lenient {
            return Err(Error::InvalidData("out-of-order APNG sequence number"));
        }
        warn!("expected sequence number {expected}, found {sequence}");
    }
    *expected = sequence
        .checked_add(1)
        .ok_or(Error::InvalidData("sequence number overflow"))?;
    Ok(())
}

/// Everything known about an open APNG stream.
struct Decoding {
    header: ImageHeader,
    palette: Option<Palette>,
    color_key: Option<ColorKey>,
    animation: AnimationControl,
    /// `fcTL` seen before `IDAT`, waiting to be used for the default image.
    default_control: Option<FrameControl>,
    default_image_done: bool,
    /// A chunk whose header has been read but whose data has not.
    pending: Option<ChunkHeader>,
    next_sequence: u32,
    compressed: TryVec<u8>,
    inflated: TryVec<u8>,
}

impl Decoding {
    /// Parse the signature and every chunk up to the first `IDAT`.
    fn open<T: Read + Offset>(src: &mut T, config: &DecodeConfig) -> Result<Self> {
        let mut signature = [0u8; 8];
        src.read_exact(&mut signature)?;
        if signature != PNG_SIGNATURE {
            return Err(Error::InvalidData("not a PNG signature"));
        }

        let head = read_chunk_header(src)?;
        if head.name != ChunkType::ImageHeader {
            return Err(Error::InvalidData("first chunk is not IHDR"));
        }
        let mut chunk = Chunk::new(src, head);
        let data = chunk.read_into_try_vec()?;
        chunk.finish(config.lenient)?;
        let header = ImageHeader::parse(&data)?;
        let tracker = ResourceTracker::new(config);
        tracker.validate_frame_pixels(header.width, header.height)?;
        debug!("{header:?}");

        let mut palette = None;
        let mut trns = None;
        let mut animation = None;
        let mut default_control = None;
        let mut next_sequence = 0;

        let pending = loop {
            let head = read_chunk_header(src)?;
            let mut chunk = Chunk::new(src, head);
            match head.name {
                ChunkType::ImageData => break head,
                ChunkType::Palette => {
                    if palette.is_some() {
                        return Err(Error::InvalidData("duplicate PLTE chunk"));
                    }
                    palette = Some(Palette::from_rgb(&chunk.read_into_try_vec()?)?);
                },
                ChunkType::Transparency => {
                    trns = Some(chunk.read_into_try_vec()?);
                },
                ChunkType::AnimationControl => {
                    if animation.is_some() {
                        return Err(Error::InvalidData("duplicate acTL chunk"));
                    }
                    let control = AnimationControl::parse(&chunk.read_into_try_vec()?)?;
                    tracker.validate_animation_frames(control.num_frames)?;
                    debug!("{control:?}");
                    animation = Some(control);
                },
                ChunkType::FrameControl => {
                    if default_control.is_some() {
                        return Err(Error::InvalidData("more than one fcTL before IDAT"));
                    }
                    let control = FrameControl::parse(&chunk.read_into_try_vec()?)?;
                    check_sequence(&mut next_sequence, control.sequence, config.lenient)?;
                    if !control.covers(&header) {
                        return Err(Error::InvalidData("default image frame must cover the canvas"));
                    }
                    default_control = Some(control);
                },
                ChunkType::ImageEnd => return Err(Error::InvalidData("no image data before IEND")),
                ChunkType::ImageHeader | ChunkType::FrameData => {
                    return Err(Error::InvalidData("misplaced chunk before IDAT"));
                },
                name if name.is_critical() => return Err(Error::Unsupported("unknown critical chunk")),
                _ => {},
            }
            chunk.finish(config.lenient)?;
        };

        let animation = animation.ok_or(Error::NotAnimated)?;
        if header.color_type == ColorType::Indexed && palette.is_none() {
            return Err(Error::InvalidData("indexed image without PLTE"));
        }
        let mut color_key = None;
        if let Some(trns) = trns {
            match palette.as_mut() {
                Some(palette) if header.color_type == ColorType::Indexed => palette.apply_alpha(&trns)?,
                _ => color_key = header.color_key(&trns)?,
            }
        }

        Ok(Self {
            header,
            palette,
            color_key,
            animation,
            default_control,
            default_image_done: false,
            pending: Some(pending),
            next_sequence,
            compressed: TryVec::new(),
            inflated: TryVec::new(),
        })
    }

    fn next_chunk_header<T: Read + Offset>(&mut self, src: &mut T) -> Result<ChunkHeader> {
        match self.pending.take() {
            Some(head) => Ok(head),
            None => read_chunk_header(src),
        }
    }

    /// Decode the next animation frame into `frame`.
    fn next_frame<T: Read + Offset>(&mut self, src: &mut T, config: &DecodeConfig, frame: &mut Frame) -> Result<()> {
        if !self.default_image_done {
            self.default_image_done = true;
            self.collect_image_data(src, config, ChunkType::ImageData)?;
            match self.default_control.take() {
                Some(control) => return self.decode_frame(&control, config, frame),
                None => {
                    debug!("default image is not part of the animation");
                    self.decode_frame(&FrameControl::full_canvas(&self.header), config, frame)?;
                },
            }
        }
        let control = self.next_frame_control(src, config)?;
        self.collect_image_data(src, config, ChunkType::FrameData)?;
        self.decode_frame(&control, config, frame)
    }

    /// Find the next `fcTL`, skipping ancillary chunks on the way.
    fn next_frame_control<T: Read + Offset>(&mut self, src: &mut T, config: &DecodeConfig) -> Result<FrameControl> {
        loop {
            let head = self.next_chunk_header(src)?;
            let mut chunk = Chunk::new(src, head);
            match head.name {
                ChunkType::FrameControl => {
                    let control = FrameControl::parse(&chunk.read_into_try_vec()?)?;
                    chunk.finish(config.lenient)?;
                    check_sequence(&mut self.next_sequence, control.sequence, config.lenient)?;
                    control.validate(&self.header)?;
                    return Ok(control);
                },
                ChunkType::ImageEnd => return Err(Error::InvalidData("IEND before all frames were read")),
                ChunkType::ImageData => return Err(Error::InvalidData("IDAT after the first frame")),
                ChunkType::FrameData => return Err(Error::InvalidData("fdAT without a preceding fcTL")),
                name if name.is_critical() => return Err(Error::InvalidData("unexpected critical chunk")),
                _ => chunk.finish(config.lenient)?,
            }
        }
    }

    /// Gather the compressed data of consecutive `kind` chunks.
    fn collect_image_data<T: Read + Offset>(&mut self, src: &mut T, config: &DecodeConfig, kind: ChunkType) -> Result<()> {
        self.compressed.clear();
        let mut chunks = 0u32;
        loop {
            let head = self.next_chunk_header(src)?;
            if head.name != kind {
                self.pending = Some(head);
                break;
            }
            let mut chunk = Chunk::new(src, head);
            if kind == ChunkType::FrameData {
                if head.length < 4 {
                    return Err(Error::InvalidData("fdAT chunk too short"));
                }
                let sequence = be_u32(&mut chunk)?;
                check_sequence(&mut self.next_sequence, sequence, config.lenient)?;
            }
            chunk.append_to(&mut self.compressed)?;
            chunk.finish(config.lenient)?;
            chunks += 1;
        }
        if chunks == 0 {
            return Err(Error::InvalidData("frame has no image data"));
        }
        Ok(())
    }

    /// Inflate the collected data and convert it into `frame`.
    fn decode_frame(&mut self, control: &FrameControl, config: &DecodeConfig, frame: &mut Frame) -> Result<()> {
        ResourceTracker::new(config).validate_frame_pixels(control.width, control.height)?;
        let len = image_data_len(&self.header, control.width, control.height)?;
        self.inflated.clear();
        self.inflated.resize_with(len, || 0)?;
        ZlibDecoder::new(&self.compressed[..])
            .read_exact(&mut self.inflated[..])
            .map_err(|err| {
                debug!("inflate failed: {err}");
                Error::InvalidData("corrupt compressed image data")
            })?;

        frame.x = control.x_offset;
        frame.y = control.y_offset;
        frame.width = control.width;
        frame.height = control.height;
        frame.delay = control.delay();
        frame.dispose_op = control.dispose();
        frame.blend_op = control.blend();
        frame.allocate_pixels()?;
        debug!(
            "frame {}x{} at ({}, {}), {} compressed bytes",
            frame.width,
            frame.height,
            frame.x,
            frame.y,
            self.compressed.len()
        );

        let converter = RowConverter {
            header: &self.header,
            palette: self.palette.as_ref(),
            color_key: self.color_key,
        };
        converter.decode_image(control.width, control.height, &mut self.inflated[..], &mut frame.pixels)
    }
}

/// Decoder for animated PNG streams.
///
/// Construction fails with [`Error::NotAnimated`] for a still PNG.
pub struct ApngReader<S: ByteStream> {
    input: Input<S>,
    config: DecodeConfig,
    state: Option<Decoding>,
    current_frame: u32,
}

impl<S: ByteStream> ApngReader<S> {
    /// Open an APNG stream with the default [`DecodeConfig`].
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
        self.state = Some(state.inspect_err(|err| warn!("APNG open failed: {err}"))?);
        Ok(())
    }

    fn release(&mut self) {
        self.state = None;
        self.current_frame = 0;
    }
}

impl<S: ByteStream> ImageReader for ApngReader<S> {
    fn width(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.header.width)
    }

    fn height(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.header.height)
    }

    fn num_frames(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.animation.num_frames)
    }

    fn current_frame(&self) -> u32 {
        self.current_frame
    }

    fn loop_count(&self) -> Option<u32> {
        self.state.as_ref().map(|s| s.animation.num_plays)
    }

    fn read(&mut self, frame: &mut Frame) -> Result<bool> {
        let state = self.state.as_mut().ok_or(Error::Released)?;
        if self.current_frame >= state.animation.num_frames {
            return Ok(false);
        }
        match state.next_frame(&mut self.input, &self.config, frame) {
            Ok(()) => {
                self.current_frame += 1;
                debug_assert_eq!(frame.pixels.len(), frame.width.to_usize() * frame.height.to_usize());
                Ok(true)
            },
            Err(err) => {
                warn!("APNG frame {} failed at offset {}: {err}", self.current_frame, self.input.offset());
                self.release();
                Err(err)
            },
        }
    }

    fn restart(&mut self) -> Result<()> {
        self.open()
    }
}

#[cfg(test)]
fn control(dispose_op: u8, blend_op: u8, delay_num: u16, delay_den: u16) -> FrameControl {
    FrameControl {
        sequence: 0,
        width: 1,
        height: 1,
        x_offset: 0,
        y_offset: 0,
        delay_num,
        delay_den,
        dispose_op,
        blend_op,
    }
}

#[test]
fn frame_control_codes_fall_back() {
    assert_eq!(control(0, 0, 0, 0).dispose(), DisposeOp::None);
    assert_eq!(control(1, 0, 0, 0).dispose(), DisposeOp::Background);
    assert_eq!(control(2, 0, 0, 0).dispose(), DisposeOp::Previous);
    assert_eq!(control(9, 0, 0, 0).dispose(), DisposeOp::Background);
    assert_eq!(control(0, 1, 0, 0).blend(), BlendOp::Over);
    assert_eq!(control(0, 7, 0, 0).blend(), BlendOp::Source);
}

#[test]
fn frame_control_delay() {
    assert_eq!(control(0, 0, 1, 10).delay(), 0.1);
    assert_eq!(control(0, 0, 5, 0).delay(), 0.05);
    assert_eq!(control(0, 0, 0, 0).delay(), 0.0);
    assert_eq!(control(0, 0, 0, 30).delay(), 0.0);
}

#[test]
fn frame_control_parse_and_bounds() {
    let mut data = Vec::new();
    for v in [3u32, 4, 5, 6, 7] {
        data.extend_from_slice(&v.to_be_bytes());
    }
    data.extend_from_slice(&[0, 1, 0, 2, 1, 0]);
    let control = FrameControl::parse(&data).unwrap();
    assert_eq!(control.sequence, 3);
    assert_eq!((control.width, control.height, control.x_offset, control.y_offset), (4, 5, 6, 7));
    assert_eq!((control.delay_num, control.delay_den, control.dispose_op), (1, 2, 1));
    assert!(FrameControl::parse(&data[..25]).is_err());

    let header = ImageHeader::parse(&[0, 0, 0, 10, 0, 0, 0, 12, 8, 2, 0, 0, 0]).unwrap();
    assert!(control.validate(&header).is_ok());
    let header = ImageHeader::parse(&[0, 0, 0, 9, 0, 0, 0, 12, 8, 2, 0, 0, 0]).unwrap();
    assert!(control.validate(&header).is_err());
}

#[test]
fn sequence_numbers() {
    let mut expected = 0;
    check_sequence(&mut expected, 0, false).unwrap();
    check_sequence(&mut expected, 1, false).unwrap();
    assert!(check_sequence(&mut expected, 3, false).is_err());
    check_sequence(&mut expected, 3, true).unwrap();
    assert_eq!(expected, 4);
}

#[test]
fn chunk_crc_is_checked() {
    let chunk_bytes = |name: &[u8; 4], corrupt: bool| {
        let mut bytes = name.to_vec();
        bytes.extend_from_slice(b"abc");
        let crc = crc32fast::hash(&bytes) ^ u32::from(corrupt);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes
    };
    let finish = |bytes: &[u8], lenient: bool| {
        let head = ChunkHeader {
            name: ChunkType::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            length: 3,
            offset: 0,
        };
        let mut src = &bytes[4..];
        let result = Chunk::new(&mut src, head).finish(lenient);
        assert!(src.is_empty());
        result
    };

    finish(&chunk_bytes(b"IDAT", false), false).unwrap();
    assert!(finish(&chunk_bytes(b"IDAT", true), false).is_err());
    assert!(finish(&chunk_bytes(b"IDAT", true), true).is_ok());
    assert!(finish(&chunk_bytes(b"fcTL", true), false).is_err());
    assert!(finish(&chunk_bytes(b"tEXt", true), false).is_ok());
}
