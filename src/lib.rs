#![deny(unsafe_code)]
//! Frame-by-frame decoding of animated PNG (APNG) and GIF images.
//!
//! Both decoders implement [`ImageReader`]: construct one over a
//! [`ByteStream`], call [`ImageReader::read`] until it returns `false`, and
//! [`ImageReader::restart`] to play the animation again from the start.
//! Every frame carries its placement on the canvas, its disposal and blend
//! operations, its delay in seconds, and fully resolved RGBA pixels.
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use fallible_collections::TryReserveError;
use std::io::Read;

mod apng;
mod chunks;
mod frame;
mod gif;
mod palette;
mod scanline;
mod stream;

pub use crate::apng::ApngReader;
pub use crate::frame::{BlendOp, DisposeOp, Frame, Pixel};
pub use crate::gif::GifReader;
pub use crate::stream::{BufferStream, ByteStream, Provider, ProviderError, ProviderStream, Source, Value};

/// Lossless widening to `u64`.
trait ToU64 {
    fn to_u64(self) -> u64;
}

impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self as u64
    }
}

/// Lossless widening to `usize`. Only implemented for unsigned types that
/// fit; anything wider fails the assertion at compile time.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self as usize
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

/// Indicate the current offset (i.e., bytes already read) in a reader
pub(crate) trait Offset {
    fn offset(&self) -> u64;
}

/// Owns a decoder's byte stream, exposing it as `std::io::Read` and
/// tracking how many bytes have been pulled since the last rewind.
///
/// A short read marks the end of the data: later reads return 0 without
/// asking the stream again until the next rewind.
pub(crate) struct Input<S> {
    stream: S,
    offset: u64,
    ended: bool,
}

impl<S: ByteStream> Input<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            offset: 0,
            ended: false,
        }
    }

    /// Re-open the stream so the next read starts at the first byte.
    pub(crate) fn rewind(&mut self) -> Result<()> {
        self.stream.open()?;
        self.offset = 0;
        self.ended = false;
        Ok(())
    }
}

impl<S> Offset for Input<S> {
    fn offset(&self) -> u64 {
        self.offset
    }
}

impl<S: ByteStream> Read for Input<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.ended || buf.is_empty() {
            return Ok(0);
        }
        let bytes_read = self.stream.read(buf)?;
        self.ended = bytes_read < buf.len();
        self.offset = self
            .offset
            .checked_add(bytes_read.to_u64())
            .ok_or(Error::Unsupported("total bytes read too large for offset type"))?;
        Ok(bytes_read)
    }
}

/// Broad classification of an [`Error`], for callers that only need to
/// know who is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The stream failed, or ended where more bytes were required.
    Io,
    /// The data is not a valid (animated) image.
    Format,
    /// A [`Provider`] returned a value of the wrong shape.
    Protocol,
    /// An operation was not legal in the current state.
    State,
}

/// Describes decoder failures.
///
/// This enum wraps the standard `io::Error` type, unified with
/// our own decoder error states and those of crates we use.
#[derive(Debug)]
pub enum Error {
    /// Decode error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Decode error caused by limited decoder support rather than invalid data.
    Unsupported(&'static str),
    /// The PNG stream is valid but carries no `acTL` chunk.
    NotAnimated,
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io` and from stream providers.
    Io(std::io::Error),
    /// A stream provider broke its contract.
    Protocol(&'static str),
    /// The operation is not allowed on this object.
    InvalidState(&'static str),
    /// An earlier error released the reader; only `restart` recovers it.
    Released,
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during decoding
    ResourceLimitExceeded(&'static str),
}

impl Error {
    /// Which part of the taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnexpectedEOF | Self::Io(_) => ErrorKind::Io,
            Self::InvalidData(_)
            | Self::Unsupported(_)
            | Self::NotAnimated
            | Self::OutOfMemory
            | Self::ResourceLimitExceeded(_) => ErrorKind::Format,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::InvalidState(_) | Self::Released => ErrorKind::State,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s)
            | Self::Unsupported(s)
            | Self::Protocol(s)
            | Self::InvalidState(s)
            | Self::ResourceLimitExceeded(s) => *s,
            Self::NotAnimated => "file is not animated",
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return std::fmt::Display::fmt(err, f),
            Self::Released => "reader was released by an earlier error; restart it first",
            Self::OutOfMemory => "OOM",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated scanline")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        // Our own errors travel through `Read` adapters boxed inside an io::Error.
        if err.get_ref().is_some_and(|inner| inner.is::<Self>()) {
            return match err.into_inner().map(|inner| inner.downcast::<Self>()) {
                Some(Ok(inner)) => *inner,
                _ => Self::InvalidData("lost stream error"),
            };
        }
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Configuration for decoding with resource limits and validation options
///
/// Resource limits are checked **before** allocations occur, preventing out-of-memory
/// conditions from malicious files that claim unrealistic dimensions or counts.
///
/// # Examples
///
/// ```rust
/// use animframes::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Strict limits for untrusted input
/// let config = DecodeConfig::default()
///     .with_frame_pixel_limit(16_000_000)
///     .with_max_animation_frames(100);
///
/// // No limits
/// let config = DecodeConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Maximum number of pixels in the canvas or in any single frame.
    /// Default: 256 megapixels
    pub frame_pixel_limit: Option<u64>,

    /// Maximum number of animation frames.
    /// Default: 10,000 frames
    pub max_animation_frames: Option<u32>,

    /// Enable lenient decoding mode.
    ///
    /// When true, CRC mismatches in critical chunks and out-of-order APNG
    /// sequence numbers are logged instead of failing. Ancillary chunks with
    /// a bad CRC are always logged and ignored.
    /// Default: false (strict validation)
    pub lenient: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            frame_pixel_limit: Some(256_000_000),
            max_animation_frames: Some(10_000),
            lenient: false,
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no resource limits.
    pub fn unlimited() -> Self {
        Self {
            frame_pixel_limit: None,
            max_animation_frames: None,
            lenient: false,
        }
    }

    /// Set the maximum pixel count of the canvas and of each frame
    pub fn with_frame_pixel_limit(mut self, pixels: u64) -> Self {
        self.frame_pixel_limit = Some(pixels);
        self
    }

    /// Set the maximum animation frame count
    pub fn with_max_animation_frames(mut self, frames: u32) -> Self {
        self.max_animation_frames = Some(frames);
        self
    }

    /// Enable lenient decoding mode
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }
}

pub(crate) struct ResourceTracker<'a> {
    config: &'a DecodeConfig,
}

impl<'a> ResourceTracker<'a> {
    pub(crate) fn new(config: &'a DecodeConfig) -> Self {
        Self { config }
    }

    pub(crate) fn validate_frame_pixels(&self, width: u32, height: u32) -> Result<()> {
        if let Some(limit) = self.config.frame_pixel_limit {
            let pixels = u64::from(width)
                .checked_mul(u64::from(height))
                .ok_or(Error::InvalidData("dimension overflow"))?;

            if pixels > limit {
                return Err(Error::ResourceLimitExceeded("frame pixel limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_animation_frames(&self, count: u32) -> Result<()> {
        if let Some(limit) = self.config.max_animation_frames {
            if count > limit {
                return Err(Error::ResourceLimitExceeded("animation frame count limit exceeded"));
            }
        }

        Ok(())
    }
}

/// The operations every animation decoder offers.
///
/// A reader owns its byte stream. Construction opens and validates the
/// container; after that, each successful [`read`](Self::read) yields the
/// next frame. When any call fails the reader releases its decode state:
/// the canvas reports `0×0` and further reads fail with
/// [`Error::Released`] until [`restart`](Self::restart) succeeds.
pub trait ImageReader {
    /// Canvas width, or 0 when no container is open.
    fn width(&self) -> u32;

    /// Canvas height, or 0 when no container is open.
    fn height(&self) -> u32;

    /// Frame count declared up front.
    ///
    /// GIF has no such declaration, so GIF readers always report 0; drive
    /// them with [`read`](Self::read) until it returns `false`.
    fn num_frames(&self) -> u32;

    /// Number of frames decoded since the last open.
    fn current_frame(&self) -> u32;

    /// How many times the animation asks to be played; `Some(0)` means forever.
    fn loop_count(&self) -> Option<u32>;

    /// Decode the next frame into `frame`, overwriting all of its fields.
    ///
    /// Returns `Ok(false)` once the animation is exhausted, and keeps
    /// returning `Ok(false)` until [`restart`](Self::restart).
    fn read(&mut self, frame: &mut Frame) -> Result<bool>;

    /// Re-open the stream and start over from the first frame.
    fn restart(&mut self) -> Result<()>;

    /// Iterate over the remaining frames.
    fn frames(&mut self) -> Frames<'_, Self>
    where
        Self: Sized,
    {
        Frames::new(self)
    }
}

impl<R: ImageReader + ?Sized> ImageReader for Box<R> {
    fn width(&self) -> u32 {
        (**self).width()
    }

    fn height(&self) -> u32 {
        (**self).height()
    }

    fn num_frames(&self) -> u32 {
        (**self).num_frames()
    }

    fn current_frame(&self) -> u32 {
        (**self).current_frame()
    }

    fn loop_count(&self) -> Option<u32> {
        (**self).loop_count()
    }

    fn read(&mut self, frame: &mut Frame) -> Result<bool> {
        (**self).read(frame)
    }

    fn restart(&mut self) -> Result<()> {
        (**self).restart()
    }
}

/// Iterator over the frames remaining in an [`ImageReader`].
///
/// Yields each decoded frame, stops after the last one, and stops after
/// yielding the first error.
pub struct Frames<'a, R: ?Sized> {
    reader: &'a mut R,
    done: bool,
}

impl<'a, R: ImageReader + ?Sized> Frames<'a, R> {
    pub fn new(reader: &'a mut R) -> Self {
        Self { reader, done: false }
    }
}

impl<R: ImageReader + ?Sized> Iterator for Frames<'_, R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut frame = Frame::default();
        match self.reader.read(&mut frame) {
            Ok(true) => Some(Ok(frame)),
            Ok(false) => {
                self.done = true;
                None
            },
            Err(err) => {
                self.done = true;
                Some(Err(err))
            },
        }
    }
}

/// Animated image container formats this crate decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Apng,
    Gif,
}

impl Format {
    /// Identify the format from the first bytes of a file.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&apng::PNG_SIGNATURE) {
            Some(Self::Apng)
        } else if bytes.starts_with(gif::GIF_SIGNATURE) {
            Some(Self::Gif)
        } else {
            None
        }
    }
}

/// Open a reader for `format` over `source`.
///
/// A [`Source::Bytes`] is decoded from an owned in-memory copy, a
/// [`Source::Provider`] pulls its bytes from the provider on demand.
pub fn open_reader(format: Format, source: Source, config: &DecodeConfig) -> Result<Box<dyn ImageReader>> {
    let stream = source.into_stream();
    let reader: Box<dyn ImageReader> = match format {
        Format::Apng => Box::new(ApngReader::with_config(stream, config.clone())?),
        Format::Gif => Box::new(GifReader::with_config(stream, config.clone())?),
    };
    Ok(reader)
}

/// Skip a number of bytes that we don't care to parse.
pub(crate) fn skip<T: Read>(src: &mut T, bytes: u64) -> Result<()> {
    let copied = std::io::copy(&mut src.take(bytes), &mut std::io::sink())?;
    if copied != bytes {
        return Err(Error::UnexpectedEOF);
    }
    Ok(())
}

pub(crate) fn be_u16<T: byteorder::ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u32<T: byteorder::ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn le_u16<T: byteorder::ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::LittleEndian>().map_err(From::from)
}

pub(crate) fn read_u8<T: byteorder::ReadBytesExt>(src: &mut T) -> Result<u8> {
    src.read_u8().map_err(From::from)
}

#[test]
fn errors_survive_io_adapters() {
    let io_err: std::io::Error = Error::Protocol("provider read more bytes than requested").into();
    let err = Error::from(io_err);
    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(err.kind(), ErrorKind::Protocol);

    let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
    assert!(matches!(Error::from(eof), Error::UnexpectedEOF));
}

#[test]
fn format_detection() {
    assert_eq!(Format::detect(b"\x89PNG\r\n\x1a\n\0\0\0\x0dIHDR"), Some(Format::Apng));
    assert_eq!(Format::detect(b"GIF89a\x01\0"), Some(Format::Gif));
    assert_eq!(Format::detect(b"RIFF"), None);
}

#[test]
fn skip_reports_short_streams() {
    let mut src = &b"1234"[..];
    assert!(skip(&mut src, 2).is_ok());
    assert!(matches!(skip(&mut src, 5), Err(Error::UnexpectedEOF)));
}

#[cfg(test)]
struct TrickleStream {
    reads: u32,
}

#[cfg(test)]
impl ByteStream for TrickleStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reads += 1;
        buf[0] = b'x';
        Ok(1)
    }

    fn write(&mut self, _: &[u8]) -> Result<usize> {
        Ok(0)
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn short_read_ends_input() {
    let mut input = Input::new(TrickleStream { reads: 0 });
    let mut buf = [0; 4];
    assert!(matches!(read_u8(&mut input), Ok(b'x')));
    assert!(matches!(Error::from(input.read_exact(&mut buf).unwrap_err()), Error::UnexpectedEOF));
    assert_eq!(input.stream.reads, 2);
    assert_eq!(input.offset(), 2);

    input.rewind().unwrap();
    assert_eq!(input.read(&mut buf).unwrap(), 1);
    assert_eq!(input.stream.reads, 3);
}
