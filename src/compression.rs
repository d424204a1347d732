use crate::CompressionScheme;
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use num::ToPrimitive;
use std::io::{Read, Write};
use thiserror::Error;

/// Decompressed size of one segmented LZ block.
const SEGMENT_SIZE: usize = 0x4000;
/// Upper bound on how much a compressed byte is trusted to expand when
/// preallocating output.
const MAX_RATIO: usize = 256;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("{0:?} archives do not store compressed resources")]
    Unsupported(CompressionScheme),
    #[error("Resource of {0:#x} bytes is too large to compress")]
    TooLarge(usize),
    #[error("Compressed resource is truncated")]
    Truncated,
    #[error("Compressed resource decoded to {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Lz(#[from] lz4_flex::block::DecompressError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Result<T> = core::result::Result<T, CompressionError>;

fn frame_size(len: usize) -> Result<u32> {
    len.to_u32().ok_or(CompressionError::TooLarge(len))
}

/// Compresses `data` and frames it with its decompressed size, as stored in a
/// resource body.
pub(crate) fn compress(scheme: CompressionScheme, data: &[u8]) -> Result<Vec<u8>> {
    let mut framed = Vec::with_capacity(data.len() / 2 + 4);
    framed.extend_from_slice(&frame_size(data.len())?.to_be_bytes());
    match scheme {
        CompressionScheme::None => return Err(CompressionError::Unsupported(scheme)),
        CompressionScheme::Deflate => {
            let mut encoder = ZlibEncoder::new(framed, Compression::best());
            encoder.write_all(data)?;
            framed = encoder.finish()?;
        }
        CompressionScheme::SegmentedLz => {
            for segment in data.chunks(SEGMENT_SIZE) {
                let packed = lz4_flex::block::compress(segment);
                if packed.len() < segment.len() {
                    framed.extend_from_slice(&(packed.len() as i16).to_be_bytes());
                    framed.extend_from_slice(&packed);
                } else {
                    framed.extend_from_slice(&(-(segment.len() as i16)).to_be_bytes());
                    framed.extend_from_slice(segment);
                }
            }
        }
    }
    Ok(framed)
}

/// Inverse of [`compress`]. Bytes after the end of the compressed stream are
/// ignored, so bodies that still carry their padding decode fine.
pub(crate) fn decompress(scheme: CompressionScheme, framed: &[u8]) -> Result<Vec<u8>> {
    if framed.len() < 4 {
        return Err(CompressionError::Truncated);
    }
    let expected = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
    let body = &framed[4..];
    let data = match scheme {
        CompressionScheme::None => return Err(CompressionError::Unsupported(scheme)),
        CompressionScheme::Deflate => {
            let mut data = Vec::with_capacity(expected.min(body.len() * MAX_RATIO));
            ZlibDecoder::new(body)
                .take(expected as u64)
                .read_to_end(&mut data)?;
            data
        }
        CompressionScheme::SegmentedLz => decompress_segments(body, expected)?,
    };
    if data.len() != expected {
        return Err(CompressionError::SizeMismatch {
            expected,
            actual: data.len(),
        });
    }
    Ok(data)
}

fn decompress_segments(mut body: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(expected.min(body.len() * MAX_RATIO));
    while data.len() < expected {
        if body.len() < 2 {
            return Err(CompressionError::Truncated);
        }
        let length = i16::from_be_bytes([body[0], body[1]]);
        body = &body[2..];
        let stored = length.unsigned_abs() as usize;
        if body.len() < stored {
            return Err(CompressionError::Truncated);
        }
        let (segment, rest) = body.split_at(stored);
        if length < 0 {
            data.extend_from_slice(segment);
        } else {
            let segment_size = SEGMENT_SIZE.min(expected - data.len());
            data.extend(lz4_flex::block::decompress(segment, segment_size)?);
        }
        body = rest;
    }
    Ok(data)
}
