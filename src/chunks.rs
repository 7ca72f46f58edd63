// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

macro_rules! chunk_database {
    ($($chunkenum:ident $chunktype:expr),*,) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub(crate) enum ChunkType {
            $($chunkenum),*,
            UnknownChunk(u32),
        }

        impl From<u32> for ChunkType {
            fn from(t: u32) -> ChunkType {
                use self::ChunkType::*;
                match t {
                    $($chunktype => $chunkenum),*,
                    _ => UnknownChunk(t),
                }
            }
        }

        impl From<ChunkType> for u32 {
            fn from(t: ChunkType) -> u32 {
                use self::ChunkType::*;
                match t {
                    $($chunkenum => $chunktype),*,
                    UnknownChunk(t) => t,
                }
            }
        }

        impl fmt::Debug for ChunkType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                fmt::Debug::fmt(&fourcc, f)
            }
        }
    }
}

#[derive(Default, PartialEq, Clone, Copy)]
pub(crate) struct FourCC {
    pub value: [u8; 4],
}

impl From<u32> for FourCC {
    fn from(number: u32) -> FourCC {
        FourCC {
            value: number.to_be_bytes(),
        }
    }
}

impl From<ChunkType> for FourCC {
    fn from(t: ChunkType) -> FourCC {
        let chunk_num: u32 = Into::into(t);
        From::from(chunk_num)
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => fmt::Debug::fmt(&self.value, f),
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

chunk_database!(
    ImageHeader                       0x4948_4452, // "IHDR"
    Palette                           0x504c_5445, // "PLTE"
    ImageData                         0x4944_4154, // "IDAT"
    ImageEnd                          0x4945_4e44, // "IEND"
    Transparency                      0x7452_4e53, // "tRNS"
    AnimationControl                  0x6163_544c, // "acTL"
    FrameControl                      0x6663_544c, // "fcTL"
    FrameData                         0x6664_4154, // "fdAT"
);

impl ChunkType {
    /// Decoders must understand critical chunks; ancillary ones (lowercase
    /// first letter) may be skipped.
    pub(crate) fn is_critical(self) -> bool {
        u32::from(self) & 0x2000_0000 == 0
    }
}

#[test]
fn chunk_names() {
    assert_eq!(ChunkType::from(u32::from_be_bytes(*b"fcTL")), ChunkType::FrameControl);
    assert_eq!(format!("{:?}", ChunkType::FrameData), "fdAT");
    assert_eq!(FourCC::from(u32::from_be_bytes(*b"zzzz")).to_string(), "zzzz");
}

#[test]
fn criticality() {
    assert!(ChunkType::ImageData.is_critical());
    assert!(!ChunkType::Transparency.is_critical());
    assert!(ChunkType::from(u32::from_be_bytes(*b"ABCD")).is_critical());
    assert!(!ChunkType::from(u32::from_be_bytes(*b"tEXt")).is_critical());
}
