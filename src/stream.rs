//! Byte sources the decoders pull their input from.
//!
//! A decoder owns exactly one [`ByteStream`]. Two implementations are
//! provided: [`ProviderStream`] forwards every call to a host object
//! implementing [`Provider`], and [`BufferStream`] serves an owned copy
//! of an in-memory buffer.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Error, Result};

/// Uniform access to a seekable-from-the-start sequence of bytes.
pub trait ByteStream {
    /// Fill at most `buf.len()` bytes and return how many were written.
    /// Returning fewer, including zero, means the data has ended.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Hand `bytes` to the stream and return how many it accepted.
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    /// (Re)open the stream so the next read starts at the first byte.
    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        (**self).write(bytes)
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// A dynamically typed result returned by a [`Provider`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Bytes(Vec<u8>),
}

impl Value {
    /// The value as a byte count, if it is a non-negative integral number.
    fn as_count(&self) -> Option<usize> {
        match *self {
            Self::Integer(n) => usize::try_from(n).ok(),
            Self::Number(n) if n >= 0.0 && n.fract() == 0.0 && n <= usize::MAX as f64 => Some(n as usize),
            _ => None,
        }
    }
}

/// Failure reported by a [`Provider`]; surfaces as [`Error::Io`].
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// A host object that supplies bytes on request.
///
/// Results are checked for shape: `read` must produce [`Value::Bytes`] no
/// longer than requested and `write` a non-negative integral number, or
/// the call fails with [`Error::Protocol`].
pub trait Provider {
    fn read(&mut self, max_bytes: usize) -> Result<Value, ProviderError>;

    fn write(&mut self, bytes: &[u8]) -> Result<Value, ProviderError>;

    fn open(&mut self) -> Result<(), ProviderError>;

    fn close(&mut self) -> Result<(), ProviderError>;

    fn flush(&mut self) -> Result<(), ProviderError>;

    /// Drop whatever keeps the host object alive.
    /// Called exactly once, when the owning [`ProviderStream`] is dropped.
    fn release(&mut self) {}
}

impl<P: Provider + ?Sized> Provider for Box<P> {
    fn read(&mut self, max_bytes: usize) -> Result<Value, ProviderError> {
        (**self).read(max_bytes)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<Value, ProviderError> {
        (**self).write(bytes)
    }

    fn open(&mut self) -> Result<(), ProviderError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        (**self).close()
    }

    fn flush(&mut self) -> Result<(), ProviderError> {
        (**self).flush()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

fn provider_failure(err: ProviderError) -> Error {
    Error::Io(std::io::Error::other(err))
}

/// A [`ByteStream`] backed by a [`Provider`].
pub struct ProviderStream<P: Provider> {
    provider: P,
}

impl<P: Provider> ProviderStream<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P: Provider> ByteStream for ProviderStream<P> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let bytes = match self.provider.read(buf.len()).map_err(provider_failure)? {
            Value::Bytes(bytes) => bytes,
            _ => return Err(Error::Protocol("provider read did not return bytes")),
        };
        let dest = buf
            .get_mut(..bytes.len())
            .ok_or(Error::Protocol("provider read more bytes than requested"))?;
        dest.copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.provider
            .write(bytes)
            .map_err(provider_failure)?
            .as_count()
            .ok_or(Error::Protocol("provider write did not return a byte count"))
    }

    fn open(&mut self) -> Result<()> {
        self.provider.open().map_err(provider_failure)
    }

    fn close(&mut self) -> Result<()> {
        self.provider.close().map_err(provider_failure)
    }

    fn flush(&mut self) -> Result<()> {
        self.provider.flush().map_err(provider_failure)
    }
}

impl<P: Provider> Drop for ProviderStream<P> {
    fn drop(&mut self) {
        self.provider.release();
    }
}

/// A read-only [`ByteStream`] over an owned copy of a byte buffer.
#[derive(Debug, Clone)]
pub struct BufferStream {
    data: Vec<u8>,
    pos: usize,
}

impl BufferStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Copy `data` into a new stream.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }

    /// Read cursor, in bytes from the start.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl ByteStream for BufferStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.data.get(self.pos..).unwrap_or_default();
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        self.pos += count;
        Ok(count)
    }

    fn write(&mut self, _bytes: &[u8]) -> Result<usize> {
        Err(Error::InvalidState("cannot write to a read-only buffer"))
    }

    fn open(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.pos = self.data.len();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Err(Error::InvalidState("cannot flush a read-only buffer"))
    }
}

/// Where a reader built by [`open_reader`](crate::open_reader) gets its bytes.
///
/// A provider is wrapped in its stream as soon as it becomes a `Source`, so
/// it is released even if the source is dropped unused.
pub enum Source {
    Provider(ProviderStream<Box<dyn Provider>>),
    Bytes(Vec<u8>),
}

impl Source {
    /// Select the stream implementation matching this source.
    pub fn into_stream(self) -> Box<dyn ByteStream> {
        match self {
            Self::Provider(stream) => Box::new(stream),
            Self::Bytes(data) => Box::new(BufferStream::new(data)),
        }
    }
}

impl From<Vec<u8>> for Source {
    fn from(data: Vec<u8>) -> Self {
        Self::Bytes(data)
    }
}

impl From<&[u8]> for Source {
    fn from(data: &[u8]) -> Self {
        Self::Bytes(data.to_vec())
    }
}

impl From<Box<dyn Provider>> for Source {
    fn from(provider: Box<dyn Provider>) -> Self {
        Self::Provider(ProviderStream::new(provider))
    }
}

#[test]
fn buffer_cursor_moves_with_open_and_close() {
    let mut stream = BufferStream::from_slice(b"abcdef");
    let mut buf = [0; 4];
    assert_eq!(stream.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"abcd");
    assert_eq!(stream.read(&mut buf).unwrap(), 2);
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    stream.open().unwrap();
    assert_eq!(stream.position(), 0);
    stream.close().unwrap();
    assert_eq!(stream.position(), 6);
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn write_counts() {
    assert_eq!(Value::Integer(3).as_count(), Some(3));
    assert_eq!(Value::Number(3.0).as_count(), Some(3));
    assert_eq!(Value::Number(3.5).as_count(), None);
    assert_eq!(Value::Integer(-1).as_count(), None);
    assert_eq!(Value::Nil.as_count(), None);
    assert_eq!(Value::Bytes(vec![1]).as_count(), None);
}
