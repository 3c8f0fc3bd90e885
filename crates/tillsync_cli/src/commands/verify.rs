//! Verify command implementation.

use super::read_log;
use std::path::Path;
use tillsync_core::{
    compute_crc32, AliasRecord, EvictedRecord, LogEntry, MutationRecord, RecordKind, LOG_MAGIC,
    LOG_VERSION,
};
use tillsync_protocol::{from_cbor, LineItem, Order, ProtocolResult, Session};

/// magic (4) + version (2) + length (4)
const HEADER_SIZE: usize = 10;
const CRC_SIZE: usize = 4;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Frames checked.
    pub frames_checked: usize,
    /// Frames with a valid checksum and body.
    pub valid_frames: usize,
    /// Record bodies decoded.
    pub records_checked: usize,
    /// Bytes past the last valid frame.
    pub torn_bytes: u64,
    /// Errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying replica at {}", path.display());
    println!();

    let data = read_log(path)?;
    let result = verify_log(&data);

    println!(
        "  frames checked: {}, valid: {}, records checked: {}",
        result.frames_checked, result.valid_frames, result.records_checked
    );
    if result.torn_bytes > 0 {
        println!(
            "  torn tail: {} bytes (an interrupted write; dropped on next open)",
            result.torn_bytes
        );
    }
    for error in &result.errors {
        println!("    ERROR: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Replica verification passed");
        Ok(())
    } else {
        println!("✗ Replica verification failed");
        Err("Verification failed".into())
    }
}

/// Walks every frame of a log.
///
/// A damaged final frame is a torn tail, which recovery handles. Damage
/// followed by more data means records after it are unreachable, which is
/// an error.
pub(crate) fn verify_log(data: &[u8]) -> VerifyResult {
    let mut result = VerifyResult::default();
    let mut pos = 0usize;

    while pos < data.len() {
        result.frames_checked += 1;
        match check_frame(&data[pos..]) {
            Ok((frame_len, entries)) => {
                result.valid_frames += 1;
                for entry in &entries {
                    if let LogEntry::Put { kind, key, value } = entry {
                        result.records_checked += 1;
                        if let Err(err) = decode_record(*kind, value) {
                            result
                                .errors
                                .push(format!("{kind} {key} at offset {pos}: {err}"));
                        }
                    }
                }
                pos += frame_len;
            }
            Err(problem) => {
                let remaining = data.len() - pos;
                match problem {
                    FrameProblem::Truncated => {
                        result.torn_bytes = remaining as u64;
                    }
                    FrameProblem::Corrupt(reason) => {
                        result.torn_bytes = remaining as u64;
                        if !is_last_frame(&data[pos..]) {
                            result.errors.push(format!(
                                "{reason} at offset {pos}; {remaining} bytes after it are unreachable"
                            ));
                        }
                    }
                }
                break;
            }
        }
    }

    result
}

enum FrameProblem {
    Truncated,
    Corrupt(String),
}

fn frame_len(data: &[u8]) -> Option<usize> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
    Some(HEADER_SIZE + len + CRC_SIZE)
}

fn is_last_frame(data: &[u8]) -> bool {
    frame_len(data).map_or(true, |len| len >= data.len())
}

fn check_frame(data: &[u8]) -> Result<(usize, Vec<LogEntry>), FrameProblem> {
    let Some(total) = frame_len(data) else {
        return Err(FrameProblem::Truncated);
    };
    if data[0..4] != LOG_MAGIC {
        return Err(FrameProblem::Corrupt(format!(
            "invalid magic {:?}",
            &data[0..4]
        )));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != LOG_VERSION {
        return Err(FrameProblem::Corrupt(format!("unsupported version {version}")));
    }
    if data.len() < total {
        return Err(FrameProblem::Truncated);
    }

    let body_end = total - CRC_SIZE;
    let stored = u32::from_le_bytes([
        data[body_end],
        data[body_end + 1],
        data[body_end + 2],
        data[body_end + 3],
    ]);
    let computed = compute_crc32(&data[..body_end]);
    if stored != computed {
        return Err(FrameProblem::Corrupt(format!(
            "CRC mismatch (stored={stored:08x}, computed={computed:08x})"
        )));
    }

    from_cbor::<Vec<LogEntry>>(&data[HEADER_SIZE..body_end])
        .map(|entries| (total, entries))
        .map_err(|err| FrameProblem::Corrupt(format!("undecodable frame: {err}")))
}

fn decode_record(kind: RecordKind, value: &[u8]) -> ProtocolResult<()> {
    match kind {
        RecordKind::Session => from_cbor::<Session>(value).map(drop),
        RecordKind::Order => from_cbor::<Order>(value).map(drop),
        RecordKind::LineItem => from_cbor::<LineItem>(value).map(drop),
        RecordKind::Mutation => from_cbor::<MutationRecord>(value).map(drop),
        RecordKind::Alias => from_cbor::<AliasRecord>(value).map(drop),
        RecordKind::Evicted => from_cbor::<EvictedRecord>(value).map(drop),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixture;
    use tempfile::tempdir;
    use tillsync_core::encode_frame;

    #[test]
    fn written_replica_verifies() {
        let dir = tempdir().unwrap();
        fixture::seed(dir.path());
        let data = read_log(dir.path()).unwrap();

        let result = verify_log(&data);
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.frames_checked, result.valid_frames);
        assert_eq!(result.torn_bytes, 0);
        assert!(result.records_checked >= 8);
    }

    #[test]
    fn torn_tail_is_not_an_error() {
        let frame = encode_frame(&[LogEntry::Delete {
            kind: RecordKind::Session,
            key: "a".into(),
        }])
        .unwrap();
        let mut data = frame.clone();
        data.extend_from_slice(&frame[..frame.len() - 3]);

        let result = verify_log(&data);
        assert!(result.is_ok());
        assert_eq!(result.valid_frames, 1);
        assert_eq!(result.torn_bytes, (frame.len() - 3) as u64);
    }

    #[test]
    fn corruption_before_more_data_fails() {
        let frame = encode_frame(&[LogEntry::Delete {
            kind: RecordKind::Order,
            key: "b".into(),
        }])
        .unwrap();
        let mut data = frame.clone();
        data.extend_from_slice(&frame);
        data.extend_from_slice(&frame);
        let flip = frame.len() + HEADER_SIZE;
        data[flip] ^= 0xFF;

        let result = verify_log(&data);
        assert!(!result.is_ok());
        assert_eq!(result.valid_frames, 1);
    }

    #[test]
    fn undecodable_record_body_is_reported() {
        let frame = encode_frame(&[LogEntry::Put {
            kind: RecordKind::Session,
            key: "s".into(),
            value: vec![0xFF, 0x00],
        }])
        .unwrap();
        let result = verify_log(&frame);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("session s"));
    }
}
