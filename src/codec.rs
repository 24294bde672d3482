//! Record and result interchange encodings.
//!
//! Records travel inside patched oracle source as
//! `base64(zlib(protobuf(record)))`. Oracle results travel as JSON, gzipped
//! once they grow past [`PAYLOAD_COMPRESSION_THRESHOLD`].

use crate::config::PAYLOAD_COMPRESSION_THRESHOLD;
use crate::error::CodecError;
use crate::proto::{Data, Record};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use prost::Message;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Encode a record as the compressed text token embedded in oracle source.
pub fn record_to_compressed_text(record: &Record) -> Result<String, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&record.encode_to_vec())?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Inverse of [`record_to_compressed_text`].
pub fn record_from_compressed_text(text: &str) -> Result<Record, CodecError> {
    let compressed = STANDARD.decode(text.trim())?;
    let mut raw = Vec::new();
    ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut raw)?;
    Ok(Record::decode(raw.as_slice())?)
}

/// The placeholder embedded for a lookup that resolved to nothing.
pub fn null_record() -> Record {
    Record::default()
}

pub fn is_null_record(record: &Record) -> bool {
    record.id == 0 && record.data.is_empty() && record.meta.is_empty()
}

/// Hex SHA-256 of the record's binary encoding. Meta maps are ordered, so
/// equal records always hash equally.
pub fn structural_hash(record: &Record) -> String {
    hex::encode(Sha256::digest(record.encode_to_vec()))
}

/// Wrap raw JSON bytes into a result payload, compressing large ones.
pub fn build_payload(raw: Vec<u8>) -> Result<Data, CodecError> {
    if raw.len() <= PAYLOAD_COMPRESSION_THRESHOLD {
        return Ok(Data {
            compressed: false,
            payload: raw,
        });
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::best());
    encoder.write_all(&raw)?;
    Ok(Data {
        compressed: true,
        payload: encoder.finish()?,
    })
}

pub fn encode_value(value: &Value) -> Result<Data, CodecError> {
    build_payload(serde_json::to_vec(value)?)
}

/// Decode a node's result payload into a generic JSON value.
pub fn decode_payload(data: &Data) -> Result<Value, CodecError> {
    if data.payload.is_empty() {
        return Ok(Value::Null);
    }
    if !data.compressed {
        return Ok(serde_json::from_slice(&data.payload)?);
    }
    let mut raw = Vec::new();
    GzDecoder::new(data.payload.as_slice()).read_to_end(&mut raw)?;
    Ok(serde_json::from_slice(&raw)?)
}
