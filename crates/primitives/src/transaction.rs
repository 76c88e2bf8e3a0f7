//! Transaction types and serialization.

use corvid_consensus::Hash256;

use crate::encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

#[derive(Clone, Debug, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&encode(self))
    }

    /// Strict parse of a full transaction: every byte consumed, lists
    /// non-empty. Used both for wallet transactions and as the
    /// plausibility test behind the Merkle second-preimage guard.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let tx: Transaction = decode(bytes)?;
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(DecodeError::InvalidData("transaction has empty in/out list"));
        }
        Ok(tx)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let in_count = decoder.read_varint()? as usize;
        let mut inputs = Vec::with_capacity(in_count.min(1024));
        for _ in 0..in_count {
            inputs.push(TxIn::consensus_decode(decoder)?);
        }
        let out_count = decoder.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(out_count.min(1024));
        for _ in 0..out_count {
            outputs.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}
