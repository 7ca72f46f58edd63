// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use animframes::{
    open_reader, ApngReader, BlendOp, BufferStream, ByteStream, DecodeConfig, DisposeOp, Error, ErrorKind, Format,
    Frame, GifReader, ImageReader, Pixel, Provider, ProviderError, ProviderStream, Source, Value,
};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::max()).try_init();
}

// ============================================================================
// APNG fixtures
// ============================================================================

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

fn png_chunk(out: &mut Vec<u8>, name: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    let start = out.len();
    out.extend_from_slice(name);
    out.extend_from_slice(data);
    let crc = crc32fast::hash(&out[start..]);
    out.extend_from_slice(&crc.to_be_bytes());
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn ihdr(width: u32, height: u32, bit_depth: u8, color_type: u8, interlaced: bool) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&[bit_depth, color_type, 0, 0, u8::from(interlaced)]);
    data
}

fn actl(num_frames: u32, num_plays: u32) -> Vec<u8> {
    let mut data = num_frames.to_be_bytes().to_vec();
    data.extend_from_slice(&num_plays.to_be_bytes());
    data
}

#[derive(Clone, Copy)]
struct ApngFrame {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    delay: (u16, u16),
    dispose: u8,
    blend: u8,
    color: [u8; 4],
}

impl ApngFrame {
    fn new(x: u32, y: u32, width: u32, height: u32, color: [u8; 4]) -> Self {
        Self {
            x,
            y,
            width,
            height,
            delay: (0, 0),
            dispose: 0,
            blend: 0,
            color,
        }
    }
}

fn fctl(sequence: u32, frame: &ApngFrame) -> Vec<u8> {
    let mut data = Vec::new();
    for v in [sequence, frame.width, frame.height, frame.x, frame.y] {
        data.extend_from_slice(&v.to_be_bytes());
    }
    data.extend_from_slice(&frame.delay.0.to_be_bytes());
    data.extend_from_slice(&frame.delay.1.to_be_bytes());
    data.extend_from_slice(&[frame.dispose, frame.blend]);
    data
}

/// Non-interlaced scanlines, filter type 0, RGBA8.
fn solid_rgba(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let mut raw = Vec::new();
    for _ in 0..height {
        raw.push(0);
        for _ in 0..width {
            raw.extend_from_slice(&color);
        }
    }
    raw
}

fn fdat(sequence: u32, compressed: &[u8]) -> Vec<u8> {
    let mut data = sequence.to_be_bytes().to_vec();
    data.extend_from_slice(compressed);
    data
}

/// RGBA8 animation. With `hidden_default`, a gray default image precedes
/// the first `fcTL` and is not part of the animation.
fn build_apng(width: u32, height: u32, frames: &[ApngFrame], declared: u32, hidden_default: bool) -> Vec<u8> {
    let mut out = PNG_SIGNATURE.to_vec();
    png_chunk(&mut out, b"IHDR", &ihdr(width, height, 8, 6, false));
    png_chunk(&mut out, b"acTL", &actl(declared, 0));
    png_chunk(&mut out, b"tEXt", b"Comment\0fixture");
    if hidden_default {
        png_chunk(&mut out, b"IDAT", &zlib(&solid_rgba(width, height, [9, 9, 9, 255])));
    }
    let mut sequence = 0;
    for (i, frame) in frames.iter().enumerate() {
        png_chunk(&mut out, b"fcTL", &fctl(sequence, frame));
        sequence += 1;
        let compressed = zlib(&solid_rgba(frame.width, frame.height, frame.color));
        if i == 0 && !hidden_default {
            png_chunk(&mut out, b"IDAT", &compressed);
        } else {
            png_chunk(&mut out, b"fdAT", &fdat(sequence, &compressed));
            sequence += 1;
        }
    }
    png_chunk(&mut out, b"IEND", &[]);
    out
}

fn two_frame_apng() -> Vec<u8> {
    let mut first = ApngFrame::new(0, 0, 10, 10, [255, 0, 0, 255]);
    first.delay = (1, 10);
    let mut second = ApngFrame::new(2, 3, 4, 5, [0, 0, 255, 128]);
    second.dispose = 1;
    second.blend = 1;
    build_apng(10, 10, &[first, second], 2, false)
}

fn apng_reader(data: &[u8]) -> ApngReader<BufferStream> {
    ApngReader::new(BufferStream::from_slice(data)).expect("valid APNG")
}

fn collect_frames<R: ImageReader>(reader: &mut R) -> Vec<Frame> {
    reader.frames().collect::<Result<Vec<_>, _>>().expect("frames decode")
}

// ============================================================================
// APNG tests
// ============================================================================

#[test]
fn apng_two_frames() {
    init_logger();
    let mut reader = apng_reader(&two_frame_apng());
    assert_eq!(reader.width(), 10);
    assert_eq!(reader.height(), 10);
    assert_eq!(reader.num_frames(), 2);
    assert_eq!(reader.current_frame(), 0);
    assert_eq!(reader.loop_count(), Some(0));

    let mut frame = Frame::default();
    assert!(reader.read(&mut frame).unwrap());
    assert_eq!((frame.x, frame.y, frame.width, frame.height), (0, 0, 10, 10));
    assert_eq!(frame.delay, 0.1);
    assert_eq!(frame.dispose_op, DisposeOp::None);
    assert_eq!(frame.blend_op, BlendOp::Source);
    assert_eq!(frame.pixels.len(), 100);
    assert!(frame.pixels.iter().all(|&p| p == Pixel::opaque(255, 0, 0)));
    assert_eq!(reader.current_frame(), 1);

    assert!(reader.read(&mut frame).unwrap());
    assert_eq!((frame.x, frame.y, frame.width, frame.height), (2, 3, 4, 5));
    assert_eq!(frame.delay, 0.0);
    assert_eq!(frame.dispose_op, DisposeOp::Background);
    assert_eq!(frame.blend_op, BlendOp::Over);
    assert_eq!(frame.pixels.len(), 20);
    assert_eq!(frame.pixel(3, 4), Some(Pixel::new(0, 0, 255, 128)));
    assert_eq!(&frame.rgba_bytes()[..4], &[0, 0, 255, 128]);
    assert_eq!(reader.current_frame(), 2);

    assert!(!reader.read(&mut frame).unwrap());
    assert!(!reader.read(&mut frame).unwrap());
    assert_eq!(reader.current_frame(), 2);
}

#[test]
fn apng_unknown_codes_fall_back() {
    let mut first = ApngFrame::new(0, 0, 4, 4, [1, 2, 3, 255]);
    first.dispose = 7;
    first.blend = 9;
    first.delay = (3, 0);
    let mut second = ApngFrame::new(0, 0, 2, 2, [1, 2, 3, 255]);
    second.dispose = 2;
    second.delay = (0, 0);
    let frames = collect_frames(&mut apng_reader(&build_apng(4, 4, &[first, second], 2, false)));
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].dispose_op, DisposeOp::Background);
    assert_eq!(frames[0].blend_op, BlendOp::Source);
    assert_eq!(frames[0].delay, 0.03);
    assert_eq!(frames[1].dispose_op, DisposeOp::Previous);
    assert_eq!(frames[1].delay, 0.0);
}

#[test]
fn apng_hidden_default_image_is_skipped() {
    init_logger();
    let frames = [
        ApngFrame::new(0, 0, 3, 3, [10, 20, 30, 255]),
        ApngFrame::new(1, 1, 2, 2, [40, 50, 60, 255]),
    ];
    let mut reader = apng_reader(&build_apng(3, 3, &frames, 2, true));
    let decoded = collect_frames(&mut reader);
    assert_eq!(decoded.len(), 2);
    assert_eq!(reader.current_frame(), 2);
    assert!(decoded[0].pixels.iter().all(|&p| p == Pixel::opaque(10, 20, 30)));
    assert_eq!((decoded[1].x, decoded[1].y), (1, 1));
    assert!(decoded[1].pixels.iter().all(|&p| p == Pixel::opaque(40, 50, 60)));
}

#[test]
fn apng_restart_replays_identically() {
    let mut reader = apng_reader(&two_frame_apng());
    let first_pass = collect_frames(&mut reader);
    reader.restart().unwrap();
    assert_eq!(reader.current_frame(), 0);
    let second_pass = collect_frames(&mut reader);
    assert_eq!(first_pass, second_pass);
    for frame in &first_pass {
        assert_eq!(frame.pixels.len(), (frame.width * frame.height) as usize);
        assert!(frame.delay >= 0.0);
    }
}

#[test]
fn still_png_is_not_animated() {
    let mut png = PNG_SIGNATURE.to_vec();
    png_chunk(&mut png, b"IHDR", &ihdr(2, 2, 8, 6, false));
    png_chunk(&mut png, b"IDAT", &zlib(&solid_rgba(2, 2, [0; 4])));
    png_chunk(&mut png, b"IEND", &[]);
    let err = ApngReader::new(BufferStream::new(png)).err().unwrap();
    assert!(matches!(err, Error::NotAnimated));
    assert_eq!(err.kind(), ErrorKind::Format);
    assert_eq!(err.to_string(), "file is not animated");
}

#[test]
fn apng_signature_errors() {
    let mut data = two_frame_apng();
    data[1] = b'X';
    let err = ApngReader::new(BufferStream::new(data)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Format);

    let err = ApngReader::new(BufferStream::from_slice(&PNG_SIGNATURE[..5])).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn apng_crc_mismatch() {
    init_logger();
    let mut data = two_frame_apng();
    // Last CRC byte of IHDR: signature, length, name, 13 data bytes, 4 CRC bytes.
    data[8 + 4 + 4 + 13 + 3] ^= 0xff;
    let err = ApngReader::new(BufferStream::from_slice(&data)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Format);

    let config = DecodeConfig::default().lenient(true);
    let mut reader = ApngReader::with_config(BufferStream::new(data), config).unwrap();
    assert_eq!(collect_frames(&mut reader).len(), 2);
}

#[test]
fn apng_ancillary_crc_mismatch_is_ignored() {
    init_logger();
    let mut data = two_frame_apng();
    let text = data.windows(4).position(|w| w == b"tEXt").unwrap();
    let text_len = u32::from_be_bytes(data[text - 4..text].try_into().unwrap()) as usize;
    data[text + 4 + text_len] ^= 0xff;
    let mut reader = apng_reader(&data);
    assert_eq!(collect_frames(&mut reader).len(), 2);
}

fn apng_with_sequence_gap() -> Vec<u8> {
    let first = ApngFrame::new(0, 0, 2, 2, [1, 1, 1, 255]);
    let second = ApngFrame::new(0, 0, 1, 1, [2, 2, 2, 255]);
    let mut out = PNG_SIGNATURE.to_vec();
    png_chunk(&mut out, b"IHDR", &ihdr(2, 2, 8, 6, false));
    png_chunk(&mut out, b"acTL", &actl(2, 1));
    png_chunk(&mut out, b"fcTL", &fctl(0, &first));
    png_chunk(&mut out, b"IDAT", &zlib(&solid_rgba(2, 2, first.color)));
    png_chunk(&mut out, b"fcTL", &fctl(5, &second));
    png_chunk(&mut out, b"fdAT", &fdat(6, &zlib(&solid_rgba(1, 1, second.color))));
    png_chunk(&mut out, b"IEND", &[]);
    out
}

#[test]
fn apng_out_of_order_sequence_releases_reader() {
    init_logger();
    let mut reader = apng_reader(&apng_with_sequence_gap());
    assert_eq!(reader.loop_count(), Some(1));
    let mut frame = Frame::default();
    assert!(reader.read(&mut frame).unwrap());

    let err = reader.read(&mut frame).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert_eq!(reader.width(), 0);
    assert_eq!(reader.height(), 0);
    assert_eq!(reader.num_frames(), 0);

    let err = reader.read(&mut frame).unwrap_err();
    assert!(matches!(err, Error::Released));
    assert_eq!(err.kind(), ErrorKind::State);

    reader.restart().unwrap();
    assert_eq!(reader.width(), 2);
    assert!(reader.read(&mut frame).unwrap());
    assert_eq!(frame.pixels.len(), 4);
}

#[test]
fn apng_lenient_sequence() {
    let config = DecodeConfig::default().lenient(true);
    let mut reader = ApngReader::with_config(BufferStream::new(apng_with_sequence_gap()), config).unwrap();
    let frames = collect_frames(&mut reader);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].pixels, vec![Pixel::opaque(2, 2, 2)]);
}

#[test]
fn apng_iend_before_declared_frames() {
    let frames = [ApngFrame::new(0, 0, 2, 2, [0, 0, 0, 255])];
    let mut reader = apng_reader(&build_apng(2, 2, &frames, 3, false));
    assert_eq!(reader.num_frames(), 3);
    let mut frame = Frame::default();
    assert!(reader.read(&mut frame).unwrap());
    assert_eq!(reader.read(&mut frame).unwrap_err().kind(), ErrorKind::Format);
}

#[test]
fn apng_frame_outside_canvas() {
    let frames = [
        ApngFrame::new(0, 0, 4, 4, [0, 0, 0, 255]),
        ApngFrame::new(3, 3, 2, 2, [0, 0, 0, 255]),
    ];
    let mut reader = apng_reader(&build_apng(4, 4, &frames, 2, false));
    let mut frame = Frame::default();
    assert!(reader.read(&mut frame).unwrap());
    assert_eq!(reader.read(&mut frame).unwrap_err().kind(), ErrorKind::Format);
}

#[test]
fn apng_frame_limit() {
    let config = DecodeConfig::default().with_max_animation_frames(1);
    let err = ApngReader::with_config(BufferStream::new(two_frame_apng()), config).err().unwrap();
    assert!(matches!(err, Error::ResourceLimitExceeded(_)));

    let config = DecodeConfig::default().with_frame_pixel_limit(50);
    assert!(ApngReader::with_config(BufferStream::new(two_frame_apng()), config).is_err());
    assert!(ApngReader::with_config(BufferStream::new(two_frame_apng()), DecodeConfig::unlimited()).is_ok());
}

/// Raw RGB8 scanlines with filter 0, Adam7-ordered when `interlaced`.
fn rgb_scanlines(width: u32, height: u32, interlaced: bool, color: impl Fn(u32, u32) -> [u8; 3]) -> Vec<u8> {
    let passes: &[(u32, u32, u32, u32)] = if interlaced {
        &[(0, 0, 8, 8), (4, 0, 8, 8), (0, 4, 4, 8), (2, 0, 4, 4), (0, 2, 2, 4), (1, 0, 2, 2), (0, 1, 1, 2)]
    } else {
        &[(0, 0, 1, 1)]
    };
    let mut raw = Vec::new();
    for &(x0, y0, dx, dy) in passes {
        if x0 >= width || y0 >= height {
            continue;
        }
        for y in (y0..height).step_by(dy as usize) {
            raw.push(0);
            for x in (x0..width).step_by(dx as usize) {
                raw.extend_from_slice(&color(x, y));
            }
        }
    }
    raw
}

fn single_frame_rgb(width: u32, height: u32, interlaced: bool) -> Vec<u8> {
    let gradient = |x: u32, y: u32| [(x * 20) as u8, (y * 20) as u8, (x + y) as u8];
    let frame = ApngFrame::new(0, 0, width, height, [0; 4]);
    let mut out = PNG_SIGNATURE.to_vec();
    png_chunk(&mut out, b"IHDR", &ihdr(width, height, 8, 2, interlaced));
    png_chunk(&mut out, b"acTL", &actl(1, 0));
    png_chunk(&mut out, b"fcTL", &fctl(0, &frame));
    png_chunk(&mut out, b"IDAT", &zlib(&rgb_scanlines(width, height, interlaced, gradient)));
    png_chunk(&mut out, b"IEND", &[]);
    out
}

#[test]
fn apng_adam7_matches_progressive() {
    let plain = collect_frames(&mut apng_reader(&single_frame_rgb(11, 9, false)));
    let interlaced = collect_frames(&mut apng_reader(&single_frame_rgb(11, 9, true)));
    assert_eq!(plain.len(), 1);
    assert_eq!(plain, interlaced);
    assert_eq!(plain[0].pixel(5, 7), Some(Pixel::opaque(100, 140, 12)));
}

#[test]
fn apng_truecolor_ignores_color_key() {
    let frame = ApngFrame::new(0, 0, 2, 1, [0; 4]);
    let mut out = PNG_SIGNATURE.to_vec();
    png_chunk(&mut out, b"IHDR", &ihdr(2, 1, 8, 2, false));
    png_chunk(&mut out, b"tRNS", &[0, 10, 0, 20, 0, 30]);
    png_chunk(&mut out, b"acTL", &actl(1, 0));
    png_chunk(&mut out, b"fcTL", &fctl(0, &frame));
    png_chunk(&mut out, b"IDAT", &zlib(&[0, 10, 20, 30, 1, 2, 3]));
    png_chunk(&mut out, b"IEND", &[]);
    let frames = collect_frames(&mut apng_reader(&out));
    assert_eq!(frames[0].pixels, vec![Pixel::opaque(10, 20, 30), Pixel::opaque(1, 2, 3)]);
}

#[test]
fn apng_indexed_with_transparency() {
    let frame = ApngFrame::new(0, 0, 3, 1, [0; 4]);
    let mut out = PNG_SIGNATURE.to_vec();
    png_chunk(&mut out, b"IHDR", &ihdr(3, 1, 8, 3, false));
    png_chunk(&mut out, b"PLTE", &[10, 20, 30, 40, 50, 60]);
    png_chunk(&mut out, b"tRNS", &[0x80]);
    png_chunk(&mut out, b"acTL", &actl(1, 0));
    png_chunk(&mut out, b"fcTL", &fctl(0, &frame));
    png_chunk(&mut out, b"IDAT", &zlib(&[0, 0, 1, 0]));
    png_chunk(&mut out, b"IEND", &[]);
    let frames = collect_frames(&mut apng_reader(&out));
    assert_eq!(
        frames[0].pixels,
        vec![Pixel::new(10, 20, 30, 0x80), Pixel::opaque(40, 50, 60), Pixel::new(10, 20, 30, 0x80)]
    );
}

// ============================================================================
// GIF fixtures
// ============================================================================

struct GifFrame {
    left: u16,
    top: u16,
    width: u16,
    height: u16,
    interlaced: bool,
    /// (disposal method, delay in centiseconds, transparent index)
    control: Option<(u8, u16, Option<u8>)>,
    local_palette: Option<Vec<[u8; 3]>>,
    indices: Vec<u8>,
}

impl GifFrame {
    fn new(left: u16, top: u16, width: u16, height: u16, indices: Vec<u8>) -> Self {
        assert_eq!(indices.len(), usize::from(width) * usize::from(height));
        Self {
            left,
            top,
            width,
            height,
            interlaced: false,
            control: None,
            local_palette: None,
            indices,
        }
    }
}

/// Color table size field for a table of `len` entries (a power of two).
fn table_size_bits(len: usize) -> u8 {
    assert!(len.is_power_of_two() && (2..=256).contains(&len));
    len.trailing_zeros() as u8 - 1
}

fn sub_blocks(out: &mut Vec<u8>, data: &[u8]) {
    for chunk in data.chunks(255) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out.push(0);
}

fn build_gif(width: u16, height: u16, global: Option<&[[u8; 3]]>, loops: Option<u16>, frames: &[GifFrame]) -> Vec<u8> {
    let mut out = b"GIF89a".to_vec();
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    match global {
        Some(table) => {
            out.extend_from_slice(&[0x80 | table_size_bits(table.len()), 0, 0]);
            out.extend(table.iter().flatten());
        },
        None => out.extend_from_slice(&[0, 0, 0]),
    }
    if let Some(loops) = loops {
        out.extend_from_slice(&[0x21, 0xff, 11]);
        out.extend_from_slice(b"NETSCAPE2.0");
        out.extend_from_slice(&[3, 1]);
        out.extend_from_slice(&loops.to_le_bytes());
        out.push(0);
    }
    // A comment extension, skipped by the decoder.
    out.extend_from_slice(&[0x21, 0xfe]);
    sub_blocks(&mut out, b"fixture");

    for frame in frames {
        if let Some((disposal, delay, transparent)) = frame.control {
            let packed = (disposal << 2) | u8::from(transparent.is_some());
            out.extend_from_slice(&[0x21, 0xf9, 4, packed]);
            out.extend_from_slice(&delay.to_le_bytes());
            out.extend_from_slice(&[transparent.unwrap_or(0), 0]);
        }
        out.push(0x2c);
        for v in [frame.left, frame.top, frame.width, frame.height] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        let mut flags = if frame.interlaced { 0x40 } else { 0 };
        if let Some(table) = &frame.local_palette {
            flags |= 0x80 | table_size_bits(table.len());
        }
        out.push(flags);
        if let Some(table) = &frame.local_palette {
            out.extend(table.iter().flatten());
        }

        let width = usize::from(frame.width);
        let stored: Vec<u8> = if frame.interlaced {
            let mut rows = Vec::new();
            for (start, step) in [(0, 8), (4, 8), (2, 4), (1, 2)] {
                for y in (start..usize::from(frame.height)).step_by(step) {
                    rows.extend_from_slice(&frame.indices[y * width..(y + 1) * width]);
                }
            }
            rows
        } else {
            frame.indices.clone()
        };
        out.push(2);
        let compressed = weezl::encode::Encoder::new(weezl::BitOrder::Lsb, 2).encode(&stored).unwrap();
        sub_blocks(&mut out, &compressed);
    }
    out.push(0x3b);
    out
}

const FOUR_COLORS: [[u8; 3]; 4] = [[0, 0, 0], [255, 0, 0], [0, 255, 0], [0, 0, 255]];

fn gif_reader(data: &[u8]) -> GifReader<BufferStream> {
    GifReader::new(BufferStream::from_slice(data)).expect("valid GIF")
}

// ============================================================================
// GIF tests
// ============================================================================

#[test]
fn gif_frames_in_file_order() {
    init_logger();
    let mut first = GifFrame::new(0, 0, 4, 2, vec![0, 1, 2, 3, 3, 2, 1, 0]);
    first.control = Some((2, 25, None));
    let second = GifFrame::new(1, 1, 2, 1, vec![2, 2]);
    let data = build_gif(4, 2, Some(&FOUR_COLORS), Some(0), &[first, second]);

    let mut reader = gif_reader(&data);
    assert_eq!(reader.width(), 4);
    assert_eq!(reader.height(), 2);
    assert_eq!(reader.num_frames(), 0);
    assert_eq!(reader.loop_count(), None);

    let mut frame = Frame::default();
    assert!(reader.read(&mut frame).unwrap());
    assert_eq!(reader.loop_count(), Some(0));
    assert_eq!((frame.x, frame.y, frame.width, frame.height), (0, 0, 4, 2));
    assert_eq!(frame.dispose_op, DisposeOp::Background);
    assert_eq!(frame.blend_op, BlendOp::Over);
    assert_eq!(frame.delay, 0.25);
    assert_eq!(frame.pixel(1, 0), Some(Pixel::opaque(255, 0, 0)));
    assert_eq!(frame.pixel(0, 1), Some(Pixel::opaque(0, 0, 255)));

    assert!(reader.read(&mut frame).unwrap());
    assert_eq!((frame.x, frame.y, frame.width, frame.height), (1, 1, 2, 1));
    assert_eq!(frame.dispose_op, DisposeOp::None);
    assert_eq!(frame.delay, 0.0);
    assert_eq!(frame.pixels, vec![Pixel::opaque(0, 255, 0); 2]);
    assert_eq!(reader.current_frame(), 2);

    assert!(!reader.read(&mut frame).unwrap());
    assert!(!reader.read(&mut frame).unwrap());
    assert_eq!(reader.current_frame(), 2);
    assert_eq!(reader.num_frames(), 0);
}

#[test]
fn gif_interlaced_matches_sequential() {
    let indices: Vec<u8> = (0..8u8).flat_map(|y| [y % 4, (y + 1) % 4, (y + 2) % 4]).collect();
    let plain = GifFrame::new(0, 0, 3, 8, indices.clone());
    let mut interlaced = GifFrame::new(0, 0, 3, 8, indices);
    interlaced.interlaced = true;

    let plain = collect_frames(&mut gif_reader(&build_gif(3, 8, Some(&FOUR_COLORS), None, &[plain])));
    let interlaced = collect_frames(&mut gif_reader(&build_gif(3, 8, Some(&FOUR_COLORS), None, &[interlaced])));
    assert_eq!(plain.len(), 1);
    assert_eq!(plain[0].pixels, interlaced[0].pixels);
    assert_eq!(plain[0].pixel(0, 5), Some(Pixel::opaque(255, 0, 0)));
}

#[test]
fn gif_transparent_index() {
    let mut frame = GifFrame::new(0, 0, 3, 1, vec![0, 1, 2]);
    frame.control = Some((0, 0, Some(1)));
    let frames = collect_frames(&mut gif_reader(&build_gif(3, 1, Some(&FOUR_COLORS), None, &[frame])));
    assert_eq!(
        frames[0].pixels,
        vec![Pixel::opaque(0, 0, 0), Pixel::TRANSPARENT, Pixel::opaque(0, 255, 0)]
    );
}

#[test]
fn gif_disposal_mapping() {
    let mut frames = Vec::new();
    for disposal in [0u8, 1, 2, 3, 4, 7] {
        let mut frame = GifFrame::new(0, 0, 1, 1, vec![0]);
        frame.control = Some((disposal, 100, None));
        frames.push(frame);
    }
    let decoded = collect_frames(&mut gif_reader(&build_gif(1, 1, Some(&FOUR_COLORS), None, &frames)));
    let disposals: Vec<DisposeOp> = decoded.iter().map(|f| f.dispose_op).collect();
    assert_eq!(
        disposals,
        [
            DisposeOp::None,
            DisposeOp::None,
            DisposeOp::Background,
            DisposeOp::Previous,
            DisposeOp::None,
            DisposeOp::None
        ]
    );
    assert!(decoded.iter().all(|f| f.delay == 1.0 && f.blend_op == BlendOp::Over));
}

#[test]
fn gif_local_palette_overrides_global() {
    let mut frame = GifFrame::new(0, 0, 2, 1, vec![0, 1]);
    frame.local_palette = Some(vec![[7, 7, 7], [8, 8, 8]]);
    let frames = collect_frames(&mut gif_reader(&build_gif(2, 1, Some(&FOUR_COLORS), None, &[frame])));
    assert_eq!(frames[0].pixels, vec![Pixel::opaque(7, 7, 7), Pixel::opaque(8, 8, 8)]);
}

#[test]
fn gif_index_out_of_bounds() {
    let frame = GifFrame::new(0, 0, 2, 1, vec![0, 3]);
    let mut reader = gif_reader(&build_gif(2, 1, Some(&[[0, 0, 0], [1, 1, 1]]), None, &[frame]));
    let err = reader.read(&mut Frame::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert_eq!(err.to_string(), "color index invalid or out of bounds");
}

#[test]
fn gif_without_color_table() {
    let frame = GifFrame::new(0, 0, 1, 1, vec![0]);
    let mut reader = gif_reader(&build_gif(1, 1, None, None, &[frame]));
    assert_eq!(reader.read(&mut Frame::default()).unwrap_err().kind(), ErrorKind::Format);
}

#[test]
fn gif_unknown_record_releases_reader() {
    init_logger();
    let mut data = build_gif(1, 1, Some(&FOUR_COLORS), None, &[]);
    let trailer = data.len() - 1;
    data[trailer] = 0x99;
    let mut reader = gif_reader(&data);
    let mut frame = Frame::default();
    assert_eq!(reader.read(&mut frame).unwrap_err().kind(), ErrorKind::Format);
    assert_eq!(reader.width(), 0);
    assert!(matches!(reader.read(&mut frame), Err(Error::Released)));
    reader.restart().unwrap();
    assert_eq!(reader.width(), 1);
}

#[test]
fn gif_signature_errors() {
    let err = GifReader::new(BufferStream::from_slice(b"GIF8")).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Io);
    let err = GifReader::new(BufferStream::from_slice(b"JIF89a\x01\x00\x01\x00\x00\x00\x00")).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn gif_frame_outside_screen() {
    init_logger();
    let frame = GifFrame::new(1, 1, 2, 2, vec![1, 2, 3, 0]);
    let data = build_gif(2, 2, Some(&FOUR_COLORS), None, &[frame]);
    let frames = collect_frames(&mut gif_reader(&data));
    assert_eq!((frames[0].x, frames[0].y, frames[0].width, frames[0].height), (1, 1, 2, 2));
    assert_eq!(frames[0].pixels[0], Pixel::opaque(255, 0, 0));
    assert_eq!(frames[0].pixels[1], Pixel::opaque(0, 255, 0));
}

#[test]
fn gif_restart_replays_identically() {
    let frames = [
        GifFrame::new(0, 0, 2, 2, vec![0, 1, 2, 3]),
        GifFrame::new(0, 0, 1, 1, vec![3]),
    ];
    let mut reader = gif_reader(&build_gif(2, 2, Some(&FOUR_COLORS), None, &frames));
    let first_pass = collect_frames(&mut reader);
    reader.restart().unwrap();
    assert_eq!(reader.current_frame(), 0);
    assert_eq!(first_pass, collect_frames(&mut reader));
}

#[test]
fn gif_frame_limit() {
    let frames = [GifFrame::new(0, 0, 1, 1, vec![0]), GifFrame::new(0, 0, 1, 1, vec![1])];
    let data = build_gif(1, 1, Some(&FOUR_COLORS), None, &frames);
    let config = DecodeConfig::default().with_max_animation_frames(1);
    let mut reader = GifReader::with_config(BufferStream::new(data), config).unwrap();
    let mut frame = Frame::default();
    assert!(reader.read(&mut frame).unwrap());
    assert!(matches!(reader.read(&mut frame), Err(Error::ResourceLimitExceeded(_))));
}

// ============================================================================
// Byte streams and providers
// ============================================================================

#[test]
fn buffer_stream_rejects_write_and_flush() {
    let mut stream = BufferStream::from_slice(b"abc");
    assert_eq!(stream.write(b"x").unwrap_err().kind(), ErrorKind::State);
    assert_eq!(stream.flush().unwrap_err().kind(), ErrorKind::State);
    assert!(stream.close().is_ok());
    assert!(stream.open().is_ok());
    let mut buf = [0; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), 3);
}

#[derive(Clone, Copy, PartialEq)]
enum Behavior {
    Honest,
    Oversized,
    NotBytes,
    Failing,
}

struct TestProvider {
    data: Vec<u8>,
    pos: usize,
    behavior: Behavior,
    write_result: Value,
    releases: Rc<Cell<u32>>,
}

impl TestProvider {
    fn new(data: Vec<u8>, behavior: Behavior) -> (Self, Rc<Cell<u32>>) {
        let releases = Rc::new(Cell::new(0));
        let provider = Self {
            data,
            pos: 0,
            behavior,
            write_result: Value::Nil,
            releases: releases.clone(),
        };
        (provider, releases)
    }
}

impl Provider for TestProvider {
    fn read(&mut self, max_bytes: usize) -> Result<Value, ProviderError> {
        match self.behavior {
            Behavior::Honest => {
                let end = (self.pos + max_bytes).min(self.data.len());
                let bytes = self.data[self.pos..end].to_vec();
                self.pos = end;
                Ok(Value::Bytes(bytes))
            },
            Behavior::Oversized => Ok(Value::Bytes(vec![0; max_bytes + 1])),
            Behavior::NotBytes => Ok(Value::Integer(max_bytes as i64)),
            Behavior::Failing => Err("device unplugged".into()),
        }
    }

    fn write(&mut self, _bytes: &[u8]) -> Result<Value, ProviderError> {
        Ok(self.write_result.clone())
    }

    fn open(&mut self) -> Result<(), ProviderError> {
        self.pos = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn release(&mut self) {
        self.releases.set(self.releases.get() + 1);
    }
}

#[test]
fn provider_stream_decodes_and_releases_once() {
    init_logger();
    let (provider, releases) = TestProvider::new(two_frame_apng(), Behavior::Honest);
    let mut reader = ApngReader::new(ProviderStream::new(provider)).unwrap();
    assert_eq!(collect_frames(&mut reader).len(), 2);
    reader.restart().unwrap();
    assert_eq!(collect_frames(&mut reader).len(), 2);
    assert_eq!(releases.get(), 0);
    drop(reader);
    assert_eq!(releases.get(), 1);
}

#[test]
fn provider_released_when_open_fails() {
    let (provider, releases) = TestProvider::new(b"not an image".to_vec(), Behavior::Honest);
    assert!(GifReader::new(ProviderStream::new(provider)).is_err());
    assert_eq!(releases.get(), 1);
}

#[test]
fn provider_protocol_errors() {
    let (provider, _) = TestProvider::new(Vec::new(), Behavior::Oversized);
    let err = ApngReader::new(ProviderStream::new(provider)).err().unwrap();
    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(err.kind(), ErrorKind::Protocol);

    let (provider, _) = TestProvider::new(Vec::new(), Behavior::NotBytes);
    let err = GifReader::new(ProviderStream::new(provider)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    let (provider, _) = TestProvider::new(Vec::new(), Behavior::Failing);
    let err = GifReader::new(ProviderStream::new(provider)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn provider_write_results() {
    let (mut provider, _) = TestProvider::new(Vec::new(), Behavior::Honest);
    provider.write_result = Value::Integer(4);
    let mut stream = ProviderStream::new(provider);
    assert_eq!(stream.write(b"abcd").unwrap(), 4);
    assert!(stream.flush().is_ok());

    for bad in [Value::Integer(-1), Value::Number(1.5), Value::Boolean(true), Value::Nil] {
        let (mut provider, _) = TestProvider::new(Vec::new(), Behavior::Honest);
        provider.write_result = bad;
        let mut stream = ProviderStream::new(provider);
        assert_eq!(stream.write(b"abcd").unwrap_err().kind(), ErrorKind::Protocol);
    }

    let (mut provider, _) = TestProvider::new(Vec::new(), Behavior::Honest);
    provider.write_result = Value::Number(2.0);
    assert_eq!(ProviderStream::new(provider).write(b"ab").unwrap(), 2);
}

// ============================================================================
// Format selection
// ============================================================================

#[test]
fn open_reader_by_format() {
    let apng = two_frame_apng();
    let gif = build_gif(1, 1, Some(&FOUR_COLORS), None, &[GifFrame::new(0, 0, 1, 1, vec![2])]);
    assert_eq!(Format::detect(&apng), Some(Format::Apng));
    assert_eq!(Format::detect(&gif), Some(Format::Gif));

    let config = DecodeConfig::default();
    let mut reader = open_reader(Format::Apng, Source::from(apng), &config).unwrap();
    assert_eq!(reader.num_frames(), 2);
    assert_eq!(collect_frames(&mut reader).len(), 2);

    let (provider, releases) = TestProvider::new(gif.clone(), Behavior::Honest);
    let boxed: Box<dyn Provider> = Box::new(provider);
    let mut reader = open_reader(Format::Gif, Source::from(boxed), &config).unwrap();
    let frames = collect_frames(&mut reader);
    assert_eq!(frames[0].pixels, vec![Pixel::opaque(0, 255, 0)]);
    drop(reader);
    assert_eq!(releases.get(), 1);

    assert!(open_reader(Format::Apng, Source::from(&gif[..]), &config).is_err());
}

#[test]
fn unused_provider_source_is_released() {
    let (provider, releases) = TestProvider::new(two_frame_apng(), Behavior::Honest);
    let boxed: Box<dyn Provider> = Box::new(provider);
    let source = Source::from(boxed);
    assert_eq!(releases.get(), 0);
    drop(source);
    assert_eq!(releases.get(), 1);
}

#[test]
fn frames_iterator_stops_after_error() {
    let mut data = build_gif(1, 1, Some(&FOUR_COLORS), None, &[GifFrame::new(0, 0, 1, 1, vec![0])]);
    let trailer = data.len() - 1;
    data[trailer] = 0x00;
    let mut reader = gif_reader(&data);
    let results: Vec<_> = reader.frames().collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
}
