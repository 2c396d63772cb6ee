//! Payload codec: serialization plus threshold-gated compression.
//!
//! Values serialize to JSON; payloads over the configured threshold are
//! gzip-compressed. The stored form always starts with a one-byte codec
//! marker so the reader never guesses. A payload that fails to decompress
//! or deserialize is corrupt: the caller evicts it and reports a miss,
//! never a hard error.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

use stratum_core::{CacheError, Compression, StratumResult, CODEC_GZIP, CODEC_RAW};

/// Encodes and decodes stored payloads.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    threshold_bytes: usize,
    compression: Compression,
}

impl PayloadCodec {
    pub fn new(threshold_bytes: usize, compression: Compression) -> Self {
        Self {
            threshold_bytes,
            compression,
        }
    }

    /// Serialize a value into marker-prefixed stored bytes, compressing
    /// when the serialized size exceeds the threshold.
    pub fn encode<T: Serialize>(&self, value: &T) -> StratumResult<Vec<u8>> {
        let raw = serde_json::to_vec(value).map_err(CacheError::codec)?;

        if self.compression == Compression::Gzip && raw.len() > self.threshold_bytes {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&raw).map_err(CacheError::codec)?;
            let compressed = encoder.finish().map_err(CacheError::codec)?;

            let mut payload = Vec::with_capacity(compressed.len() + 1);
            payload.push(CODEC_GZIP);
            payload.extend_from_slice(&compressed);
            return Ok(payload);
        }

        let mut payload = Vec::with_capacity(raw.len() + 1);
        payload.push(CODEC_RAW);
        payload.extend_from_slice(&raw);
        Ok(payload)
    }

    /// Decode marker-prefixed stored bytes back into a value.
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> StratumResult<T> {
        let (marker, body) = payload
            .split_first()
            .ok_or_else(|| CacheError::codec("empty payload"))?;

        match *marker {
            CODEC_RAW => serde_json::from_slice(body).map_err(CacheError::codec),
            CODEC_GZIP => {
                let mut decoder = GzDecoder::new(body);
                let mut raw = Vec::new();
                decoder.read_to_end(&mut raw).map_err(CacheError::codec)?;
                serde_json::from_slice(&raw).map_err(CacheError::codec)
            }
            other => Err(CacheError::codec(format!("unknown codec marker {other}"))),
        }
    }
}
