// src/modules/entry_codec.rs
//! Hot-tier value framing
//!
//! ```text
//!  [tag: u8][payload]
//!   0x00 → JSON entry as-is
//!   0x01 → zstd(JSON entry)
//! ```
//!
//! Small modules are stored raw; zstd's frame overhead outweighs the gain.

use crate::modules::cache::ModuleCacheEntry;
use crate::utils::errors::{EngineError, Result};
use bytes::{BufMut, Bytes, BytesMut};

const TAG_RAW: u8 = 0x00;
const TAG_ZSTD: u8 = 0x01;

/// Refuse to inflate an entry beyond this (64 MiB)
pub const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct EntryCodec {
    level: i32,
    min_compress_len: usize,
}

impl EntryCodec {
    pub fn new(level: i32, min_compress_len: usize) -> Self {
        Self {
            level,
            min_compress_len,
        }
    }

    pub fn encode(&self, entry: &ModuleCacheEntry) -> Result<Bytes> {
        let json = serde_json::to_vec(entry)?;

        if json.len() < self.min_compress_len {
            return Ok(framed(TAG_RAW, &json));
        }

        let packed = zstd::bulk::compress(&json, self.level).map_err(|e| {
            EngineError::CompressionFailed(format!("{}: {}", entry.path, e))
        })?;
        if packed.len() >= json.len() {
            return Ok(framed(TAG_RAW, &json));
        }
        Ok(framed(TAG_ZSTD, &packed))
    }

    pub fn decode(&self, raw: &[u8]) -> Result<ModuleCacheEntry> {
        let (tag, payload) = raw
            .split_first()
            .ok_or_else(|| EngineError::CompressionFailed("empty cache value".to_string()))?;

        match *tag {
            TAG_RAW => Ok(serde_json::from_slice(payload)?),
            TAG_ZSTD => {
                let json = zstd::bulk::decompress(payload, MAX_ENTRY_SIZE)
                    .map_err(|e| EngineError::CompressionFailed(e.to_string()))?;
                Ok(serde_json::from_slice(&json)?)
            }
            other => Err(EngineError::CompressionFailed(format!(
                "unknown cache value tag 0x{:02x}",
                other
            ))),
        }
    }
}

impl Default for EntryCodec {
    fn default() -> Self {
        Self::new(3, 512)
    }
}

fn framed(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(tag);
    buf.put_slice(payload);
    buf.freeze()
}
