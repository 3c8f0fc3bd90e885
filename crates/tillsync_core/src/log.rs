//! Record log framing.
//!
//! Every write batch becomes one frame:
//!
//! ```text
//! magic (4) | version (2) | length (4) | CBOR entries (length) | crc32 (4)
//! ```
//!
//! The CRC covers everything before it. Replay stops at the first frame
//! that is incomplete or fails its checksum; the bytes from there on are a
//! torn tail and are truncated by the store.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tillsync_protocol::{from_cbor, to_cbor};

/// Magic bytes identifying a frame.
pub const LOG_MAGIC: [u8; 4] = *b"TLOG";

/// Current frame format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
const HEADER_SIZE: usize = 10;

const CRC_SIZE: usize = 4;

/// Kind of record held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// A session entity.
    Session,
    /// An order entity.
    Order,
    /// A line item entity.
    LineItem,
    /// An outbox mutation.
    Mutation,
    /// A temporary to canonical id link.
    Alias,
    /// A deny-list entry for an evicted id.
    Evicted,
}

impl RecordKind {
    /// Every kind, in index order.
    pub const ALL: [RecordKind; 6] = [
        RecordKind::Session,
        RecordKind::Order,
        RecordKind::LineItem,
        RecordKind::Mutation,
        RecordKind::Alias,
        RecordKind::Evicted,
    ];

    /// Returns a short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Session => "session",
            RecordKind::Order => "order",
            RecordKind::LineItem => "line_item",
            RecordKind::Mutation => "mutation",
            RecordKind::Alias => "alias",
            RecordKind::Evicted => "evicted",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change inside a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Insert or replace a record.
    Put {
        /// Record kind.
        kind: RecordKind,
        /// Record key.
        key: String,
        /// Encoded record.
        value: Vec<u8>,
    },
    /// Remove a record.
    Delete {
        /// Record kind.
        kind: RecordKind,
        /// Record key.
        key: String,
    },
}

/// Encodes a batch of entries as one frame.
pub fn encode_frame(entries: &[LogEntry]) -> CoreResult<Vec<u8>> {
    let payload = to_cbor(&entries)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("write batch too large"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&LOG_MAGIC);
    data.extend_from_slice(&LOG_VERSION.to_le_bytes());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Result of scanning a log.
#[derive(Debug, Default)]
pub struct Replay {
    /// Decoded batches, in log order.
    pub batches: Vec<Vec<LogEntry>>,
    /// Length of the valid prefix.
    pub valid_len: u64,
}

impl Replay {
    /// Returns the number of bytes past the valid prefix.
    pub fn torn_bytes(&self, total: u64) -> u64 {
        total.saturating_sub(self.valid_len)
    }
}

/// Decodes every complete, checksummed frame at the start of `data`.
pub fn decode_frames(data: &[u8]) -> Replay {
    let mut replay = Replay::default();
    let mut pos = 0usize;

    while data.len() - pos >= HEADER_SIZE {
        let header = &data[pos..pos + HEADER_SIZE];
        if header[0..4] != LOG_MAGIC {
            break;
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != LOG_VERSION {
            break;
        }
        let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;

        let frame_len = HEADER_SIZE + len + CRC_SIZE;
        if data.len() - pos < frame_len {
            break;
        }

        let body_end = pos + HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        if compute_crc32(&data[pos..body_end]) != stored {
            break;
        }

        let Ok(entries) = from_cbor::<Vec<LogEntry>>(&data[pos + HEADER_SIZE..body_end]) else {
            break;
        };

        replay.batches.push(entries);
        pos += frame_len;
        replay.valid_len = pos as u64;
    }

    replay
}

/// Computes a CRC32 checksum (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
