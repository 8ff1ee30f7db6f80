//! Animation payload framing.
//!
//! Every coded frame starts with a fixed little-endian header:
//!
//! ```text
//! magic "VRLE" | version u8 | flags u8 | pass u8 | quality_step u8
//! | pixel_format u8 | reserved u8 | width u32 | height u32 | body_len u32
//! ```
//!
//! followed by `body_len` bytes of run-length data.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use vcs_common::{CodingError, CodingResult, PixelFormat, Resolution};

pub const MAGIC: [u8; 4] = *b"VRLE";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 22;

const FLAG_KEYFRAME: u8 = 1 << 0;

/// Decoded payload header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PayloadHeader {
    pub keyframe: bool,
    /// Encoding pass that produced the frame (1-based).
    pub pass: u8,
    /// Number of low bits cleared before coding. 0 is lossless.
    pub quality_step: u8,
    pub pixel_format: PixelFormat,
    pub resolution: Resolution,
    pub body_len: u32,
}

impl PayloadHeader {
    pub fn write_to(&self, out: &mut Vec<u8>) -> CodingResult<()> {
        out.write_all(&MAGIC)?;
        out.write_u8(VERSION)?;
        out.write_u8(if self.keyframe { FLAG_KEYFRAME } else { 0 })?;
        out.write_u8(self.pass)?;
        out.write_u8(self.quality_step)?;
        out.write_u8(self.pixel_format.code())?;
        out.write_u8(0)?;
        out.write_u32::<LittleEndian>(self.resolution.width)?;
        out.write_u32::<LittleEndian>(self.resolution.height)?;
        out.write_u32::<LittleEndian>(self.body_len)?;
        Ok(())
    }
}

/// Parse the header of a coded frame and return it with the body.
pub fn split_payload(data: &[u8]) -> CodingResult<(PayloadHeader, &[u8])> {
    if data.len() < HEADER_LEN {
        return Err(bad_payload(format!("{} bytes is shorter than a header", data.len())));
    }
    let mut cursor = Cursor::new(data);
    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(bad_payload(format!("bad magic {magic:?}")));
    }
    let version = cursor.read_u8()?;
    if version != VERSION {
        return Err(bad_payload(format!("unsupported version {version}")));
    }
    let flags = cursor.read_u8()?;
    let pass = cursor.read_u8()?;
    let quality_step = cursor.read_u8()?;
    let code = cursor.read_u8()?;
    let pixel_format = PixelFormat::from_code(code)
        .ok_or_else(|| bad_payload(format!("unknown pixel format code {code}")))?;
    let _reserved = cursor.read_u8()?;
    let width = cursor.read_u32::<LittleEndian>()?;
    let height = cursor.read_u32::<LittleEndian>()?;
    let body_len = cursor.read_u32::<LittleEndian>()?;

    let body = data
        .get(HEADER_LEN..HEADER_LEN + body_len as usize)
        .ok_or_else(|| bad_payload(format!("body of {body_len} bytes is truncated")))?;

    let header = PayloadHeader {
        keyframe: flags & FLAG_KEYFRAME != 0,
        pass,
        quality_step,
        pixel_format,
        resolution: Resolution::new(width, height),
        body_len,
    };
    Ok((header, body))
}

/// Read the header of a coded frame.
pub fn inspect_payload(data: &[u8]) -> CodingResult<PayloadHeader> {
    split_payload(data).map(|(header, _)| header)
}

fn bad_payload(detail: String) -> CodingError {
    CodingError::CodecMalfunction(format!("invalid animation payload: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> PayloadHeader {
        PayloadHeader {
            keyframe: true,
            pass: 2,
            quality_step: 1,
            pixel_format: PixelFormat::Bgra8,
            resolution: Resolution::new(64, 32),
            body_len: 3,
        }
    }

    #[test]
    fn header_layout() {
        let mut out = Vec::new();
        header().write_to(&mut out).unwrap();
        assert_eq!(out.len(), HEADER_LEN);
        assert_eq!(&out[..4], b"VRLE");
        assert_eq!(out[5], FLAG_KEYFRAME);
        assert_eq!(&out[10..14], &64u32.to_le_bytes());
    }

    #[test]
    fn split_returns_body() {
        let mut out = Vec::new();
        header().write_to(&mut out).unwrap();
        out.extend([0xAA, 0xBB, 0xCC, 0xDD]);
        let (parsed, body) = split_payload(&out).unwrap();
        assert_eq!(parsed, header());
        assert_eq!(body, &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(inspect_payload(b"short").is_err());
        let mut out = Vec::new();
        header().write_to(&mut out).unwrap();
        out[0] = b'X';
        assert!(matches!(
            inspect_payload(&out),
            Err(CodingError::CodecMalfunction(_))
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let mut out = Vec::new();
        header().write_to(&mut out).unwrap();
        out.push(1);
        assert!(split_payload(&out).is_err());
    }
}
