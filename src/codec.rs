// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payload codecs.
//!
//! Every message is stored as a single binary field (`m`) on its log entry.
//! The codec turns a payload into those bytes and back. Codecs are
//! pluggable per topic; [`JsonCodec`] is the default.
//!
//! # Compression
//!
//! [`CompressedCodec`] wraps another codec and zstd-compresses encodings at
//! or above a size threshold. Decoding detects the zstd magic bytes, so a
//! topic can switch to compression without a migration: old, uncompressed
//! entries still decode.

use crate::error::{Result, TopicError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read;

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Converts payloads to and from their stored bytes.
pub trait Codec<M>: Send + Sync + 'static {
    /// Encode a payload for publishing.
    fn encode(&self, message: &M) -> Result<Vec<u8>>;

    /// Decode a payload read from the log.
    fn decode(&self, bytes: &[u8]) -> Result<M>;
}

/// JSON encoding via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<M> Codec<M> for JsonCodec
where
    M: Serialize + DeserializeOwned,
{
    fn encode(&self, message: &M) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| TopicError::Codec(format!("json encode: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<M> {
        serde_json::from_slice(bytes).map_err(|e| TopicError::Codec(format!("json decode: {}", e)))
    }
}

/// Wraps a codec with zstd compression for large payloads.
#[derive(Debug, Clone)]
pub struct CompressedCodec<C> {
    inner: C,
    /// Encodings shorter than this are stored as-is.
    min_size: usize,
    level: i32,
}

impl<C> CompressedCodec<C> {
    /// Compress encodings of at least `min_size` bytes at zstd level 3.
    pub fn new(inner: C, min_size: usize) -> Self {
        Self {
            inner,
            min_size,
            level: 3,
        }
    }

    /// Override the zstd compression level.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }
}

impl<M, C> Codec<M> for CompressedCodec<C>
where
    C: Codec<M>,
{
    fn encode(&self, message: &M) -> Result<Vec<u8>> {
        let raw = self.inner.encode(message)?;
        if raw.len() < self.min_size {
            return Ok(raw);
        }
        zstd::encode_all(&raw[..], self.level)
            .map_err(|e| TopicError::Codec(format!("zstd encode: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<M> {
        let raw = maybe_decompress(bytes)?;
        self.inner.decode(&raw)
    }
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| TopicError::Codec(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| TopicError::Codec(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}
