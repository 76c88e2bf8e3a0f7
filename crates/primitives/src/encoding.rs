//! Little-endian wire serialization with CompactSize lengths.

use corvid_consensus::Hash256;

/// Collection sizes on the wire are bounded well below the CompactSize
/// ceiling; anything larger is garbage or an attack.
const MAX_COMPACT_SIZE: u64 = 0x0200_0000;

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// CompactSize: shortest prefix that holds the value.
    pub fn write_varint(&mut self, value: u64) {
        match value {
            0..=0xfc => self.write_u8(value as u8),
            0xfd..=0xffff => {
                self.write_u8(0xfd);
                self.write_u16_le(value as u16);
            }
            0x1_0000..=0xffff_ffff => {
                self.write_u8(0xfe);
                self.write_u32_le(value as u32);
            }
            _ => {
                self.write_u8(0xff);
                self.write_u64_le(value);
            }
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_hash_le(&mut self, hash: &Hash256) {
        self.write_bytes(hash);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    NonCanonicalVarInt,
    SizeTooLarge,
    InvalidData(&'static str),
    TrailingBytes,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "input ended mid-field"),
            DecodeError::NonCanonicalVarInt => {
                write!(f, "CompactSize not in shortest form")
            }
            DecodeError::SizeTooLarge => write!(f, "declared size is implausibly large"),
            DecodeError::InvalidData(message) => write!(f, "{message}"),
            DecodeError::TrailingBytes => write!(f, "unconsumed bytes after decode"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Cursor over a byte slice. Every read advances; a short slice
/// surfaces as `UnexpectedEof` rather than a panic.
pub struct Decoder<'a> {
    input: &'a [u8],
    cursor: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.input.len())
            .ok_or(DecodeError::UnexpectedEof)?;
        let slice = &self.input[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_slice(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.read_slice(len)?.to_vec())
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_hash_le(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed()
    }

    /// CompactSize, rejecting non-minimal encodings so that a given
    /// value has exactly one wire form.
    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let (value, floor) = match self.read_u8()? {
            prefix @ 0..=0xfc => (u64::from(prefix), 0),
            0xfd => (u64::from(self.read_u16_le()?), 0xfd),
            0xfe => (u64::from(self.read_u32_le()?), 0x1_0000),
            _ => (self.read_u64_le()?, 0x1_0000_0000),
        };
        if value < floor {
            return Err(DecodeError::NonCanonicalVarInt);
        }
        if value > MAX_COMPACT_SIZE {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_varint()? as usize;
        self.read_bytes(len)
    }
}

pub trait Encodable {
    fn consensus_encode(&self, encoder: &mut Encoder);
}

pub trait Decodable: Sized {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError>;
}

pub fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    value.consensus_encode(&mut encoder);
    encoder.into_inner()
}

/// Decode a value that must span the whole input.
pub fn decode<T: Decodable>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = T::consensus_decode(&mut decoder)?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_prefix_boundaries() {
        for (value, wire) in [
            (0u64, vec![0x00]),
            (0xfc, vec![0xfc]),
            (0xfd, vec![0xfd, 0xfd, 0x00]),
            (0xffff, vec![0xfd, 0xff, 0xff]),
            (0x1_0000, vec![0xfe, 0x00, 0x00, 0x01, 0x00]),
        ] {
            let mut encoder = Encoder::new();
            encoder.write_varint(value);
            assert_eq!(encoder.into_inner(), wire, "encoding {value}");
            assert_eq!(Decoder::new(&wire).read_varint(), Ok(value));
        }
    }

    #[test]
    fn padded_varint_is_rejected() {
        // 5 encoded with a two-byte payload
        let wire = [0xfd, 0x05, 0x00];
        assert_eq!(
            Decoder::new(&wire).read_varint(),
            Err(DecodeError::NonCanonicalVarInt)
        );
    }

    #[test]
    fn absurd_size_is_rejected() {
        let wire = [0xfe, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(
            Decoder::new(&wire).read_varint(),
            Err(DecodeError::SizeTooLarge)
        );
    }

    #[test]
    fn short_input_is_eof_not_panic() {
        let mut decoder = Decoder::new(&[0x01, 0x02]);
        assert_eq!(decoder.read_u32_le(), Err(DecodeError::UnexpectedEof));
    }
}
