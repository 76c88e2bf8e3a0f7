//! Block header types and the era-aware wire codec.
//!
//! Headers come in two layouts. The legacy layout is the classic
//! 80-byte header with a 32-bit nonce. Once the mix-hash era activates,
//! headers grow to 120 bytes: the 32-bit nonce is replaced by the block
//! height, a 64-bit nonce and a 32-byte mix hash. Which layout (and
//! which proof-of-work digest) applies is decided solely by the header
//! timestamp against the activation times in [`ChainParams`].

use corvid_consensus::constants::{EXTENDED_HEADER_SIZE, LEGACY_HEADER_SIZE};
use corvid_consensus::{ChainParams, Hash256};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{keccak256d, mix_digest, sha256d};

/// Proof-of-work era, selected by header timestamp.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowEra {
    /// Original double-sha256 era.
    Sha256d,
    /// Double-keccak era, still on the 80-byte layout.
    Keccak,
    /// Mix-hash era on the extended 120-byte layout.
    Mix,
}

impl PowEra {
    pub fn for_time(time: u32, params: &ChainParams) -> PowEra {
        if time >= params.mix_activation_time {
            PowEra::Mix
        } else if time >= params.keccak_activation_time {
            PowEra::Keccak
        } else {
            PowEra::Sha256d
        }
    }

    pub fn is_extended(self) -> bool {
        self == PowEra::Mix
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Nonce {
    Legacy(u32),
    Extended {
        height: u32,
        nonce64: u64,
        mix_hash: Hash256,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: Nonce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderDecodeError {
    Decode(DecodeError),
    BadLength(usize),
    /// Timestamp says one layout, the byte length (or nonce shape) says
    /// another.
    EraMismatch,
    /// A stored legacy record must be zero in the padding bytes.
    BadPadding,
}

impl From<DecodeError> for HeaderDecodeError {
    fn from(error: DecodeError) -> Self {
        HeaderDecodeError::Decode(error)
    }
}

impl std::fmt::Display for HeaderDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderDecodeError::Decode(error) => write!(f, "{error}"),
            HeaderDecodeError::BadLength(len) => write!(f, "bad header length {len}"),
            HeaderDecodeError::EraMismatch => write!(f, "header layout does not match its era"),
            HeaderDecodeError::BadPadding => write!(f, "legacy header record has dirty padding"),
        }
    }
}

impl std::error::Error for HeaderDecodeError {}

impl Header {
    pub fn era(&self, params: &ChainParams) -> PowEra {
        PowEra::for_time(self.time, params)
    }

    /// Height carried inside an extended header, if any.
    pub fn encoded_height(&self) -> Option<u32> {
        match self.nonce {
            Nonce::Legacy(_) => None,
            Nonce::Extended { height, .. } => Some(height),
        }
    }

    /// Wire serialization: 80 bytes for legacy nonces, 120 for extended.
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        match &self.nonce {
            Nonce::Legacy(nonce) => encoder.write_u32_le(*nonce),
            Nonce::Extended {
                height,
                nonce64,
                mix_hash,
            } => {
                encoder.write_u32_le(*height);
                encoder.write_u64_le(*nonce64);
                encoder.write_hash_le(mix_hash);
            }
        }
        encoder.into_inner()
    }

    /// Storage serialization: always 120 bytes, legacy headers padded
    /// with trailing zeros. A header whose wire form is all zeros does
    /// not exist, so the all-zero record doubles as "absent".
    pub fn encode_record(&self) -> [u8; EXTENDED_HEADER_SIZE] {
        let wire = self.consensus_encode();
        let mut record = [0u8; EXTENDED_HEADER_SIZE];
        record[..wire.len()].copy_from_slice(&wire);
        record
    }

    /// Decode from either layout. Accepts the 80-byte legacy wire form,
    /// the 120-byte extended wire form, and the 120-byte padded storage
    /// record of a legacy header.
    pub fn consensus_decode(bytes: &[u8], params: &ChainParams) -> Result<Self, HeaderDecodeError> {
        if bytes.len() != LEGACY_HEADER_SIZE && bytes.len() != EXTENDED_HEADER_SIZE {
            return Err(HeaderDecodeError::BadLength(bytes.len()));
        }
        // timestamp sits at the same offset in both layouts
        let time = u32::from_le_bytes([bytes[68], bytes[69], bytes[70], bytes[71]]);
        let era = PowEra::for_time(time, params);

        if era.is_extended() {
            if bytes.len() != EXTENDED_HEADER_SIZE {
                return Err(HeaderDecodeError::EraMismatch);
            }
        } else if bytes.len() == EXTENDED_HEADER_SIZE {
            if bytes[LEGACY_HEADER_SIZE..].iter().any(|b| *b != 0) {
                return Err(HeaderDecodeError::BadPadding);
            }
        }

        let body = if era.is_extended() {
            bytes
        } else {
            &bytes[..LEGACY_HEADER_SIZE]
        };
        let mut decoder = Decoder::new(body);
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash_le()?;
        let merkle_root = decoder.read_hash_le()?;
        let decoded_time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = if era.is_extended() {
            Nonce::Extended {
                height: decoder.read_u32_le()?,
                nonce64: decoder.read_u64_le()?,
                mix_hash: decoder.read_hash_le()?,
            }
        } else {
            Nonce::Legacy(decoder.read_u32_le()?)
        };
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time: decoded_time,
            bits,
            nonce,
        })
    }

    /// Block identifier, which doubles as the proof-of-work digest.
    pub fn hash(&self, params: &ChainParams) -> Hash256 {
        match (self.era(params), &self.nonce) {
            (PowEra::Mix, Nonce::Extended {
                nonce64, mix_hash, ..
            }) => {
                let wire = self.consensus_encode();
                let seed = sha256d(&wire[..LEGACY_HEADER_SIZE]);
                mix_digest(&seed, mix_hash, *nonce64)
            }
            (PowEra::Keccak, _) => keccak256d(&self.consensus_encode()),
            _ => sha256d(&self.consensus_encode()),
        }
    }
}
