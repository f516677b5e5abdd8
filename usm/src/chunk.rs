//! The 32-byte chunk header shared by every channel type (component C4).

use typed_builder::TypedBuilder;

use crate::error::{Result, UsmError};
use crate::io::{ByteReader, ByteWriter};

/// Chunk signatures recognized on the wire.
pub const SIGNATURES: [&[u8; 4]; 5] = [b"CRID", b"@SFV", b"@SFA", b"@SBT", b"@ALP"];

const HEADER_LEN: usize = 32;
const HEADER_OFFSET: u8 = 24;
const ALIGNMENT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Stream,
    Header,
    SectionEnd,
    Metadata,
}

impl PayloadType {
    fn from_u16(v: u16) -> Result<Self> {
        Ok(match v {
            0 => PayloadType::Stream,
            1 => PayloadType::Header,
            2 => PayloadType::SectionEnd,
            3 => PayloadType::Metadata,
            other => {
                return Err(UsmError::MalformedChunk {
                    reason: format!("unknown payload type {other}"),
                });
            }
        })
    }

    fn to_u16(self) -> u16 {
        match self {
            PayloadType::Stream => 0,
            PayloadType::Header => 1,
            PayloadType::SectionEnd => 2,
            PayloadType::Metadata => 3,
        }
    }
}

/// A parsed chunk. Transient: exists only for the duration of one
/// demux/mux step and borrows its payload from the source buffer. Most
/// callers only care about signature/type/channel and leave the timing
/// fields at their zero default (header and section-end chunks carry no
/// frame timing), so construction goes through [`TypedBuilder`].
#[derive(Debug, TypedBuilder)]
pub struct Chunk<'a> {
    pub signature: [u8; 4],
    pub payload_type: PayloadType,
    pub channel_number: u8,
    #[builder(default)]
    pub frame_time: u32,
    #[builder(default)]
    pub frame_rate: u8,
    #[builder(default)]
    pub frame_number: u32,
    #[builder(default)]
    pub encrypt_flag: bool,
    #[builder(default)]
    pub payload: &'a [u8],
}

impl<'a> Chunk<'a> {
    pub fn channel_key(&self) -> (&[u8; 4], u8) {
        (&self.signature, self.channel_number)
    }

    /// Parses one chunk starting at `data[0]`. Returns the chunk and the
    /// number of bytes it occupies on disk.
    pub fn parse(data: &'a [u8]) -> Result<(Chunk<'a>, usize)> {
        if data.len() < HEADER_LEN {
            return Err(UsmError::MalformedChunk {
                reason: "buffer shorter than chunk header".to_string(),
            });
        }
        let mut r = ByteReader::new(data);
        let mut signature = [0u8; 4];
        signature.copy_from_slice(r.read_bytes(4)?);
        if !SIGNATURES.contains(&&signature) {
            return Err(UsmError::MalformedChunk {
                reason: format!("unrecognized chunk signature {:?}", String::from_utf8_lossy(&signature)),
            });
        }
        let size = r.read_u32()? as usize;
        let header_offset = r.read_u8()?;
        let footer_size = r.read_u8()? as usize;
        let payload_type = PayloadType::from_u16(r.read_u16()?)?;
        let frame_time = r.read_u24()?;
        let frame_rate = r.read_u8()?;
        let frame_number = r.read_u32()?;
        let encrypt_flag = r.read_u8()? != 0;
        let channel_number = r.read_u8()?;
        r.skip(10)?; // reserved, always zero

        if header_offset as usize != HEADER_OFFSET as usize {
            return Err(UsmError::MalformedChunk {
                reason: format!("unexpected header offset {header_offset}"),
            });
        }
        if size < HEADER_LEN + footer_size || size > data.len() {
            return Err(UsmError::MalformedChunk {
                reason: format!("chunk size {size} inconsistent with buffer"),
            });
        }
        let payload_len = size - HEADER_LEN - footer_size;
        let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];

        Ok((
            Chunk {
                signature,
                payload_type,
                frame_time,
                frame_rate,
                frame_number,
                encrypt_flag,
                channel_number,
                payload,
            },
            size,
        ))
    }

    /// Serializes this chunk's metadata and `payload`, padding the total
    /// length to an 8-byte boundary with a zero footer.
    pub fn write(&self, payload: &[u8]) -> Vec<u8> {
        let unpadded = HEADER_LEN + payload.len();
        let padded = unpadded.div_ceil(ALIGNMENT) * ALIGNMENT;
        let footer_size = padded - unpadded;

        let mut w = ByteWriter::with_capacity(padded);
        w.write_bytes(&self.signature);
        w.write_u32(padded as u32);
        w.write_u8(HEADER_OFFSET);
        w.write_u8(footer_size as u8);
        w.write_u16(self.payload_type.to_u16());
        w.write_u24(self.frame_time);
        w.write_u8(self.frame_rate);
        w.write_u32(self.frame_number);
        w.write_u8(self.encrypt_flag as u8);
        w.write_u8(self.channel_number);
        w.write_bytes(&[0u8; 10]);
        w.write_bytes(payload);
        for _ in 0..footer_size {
            w.write_u8(0);
        }
        w.into_vec()
    }
}
