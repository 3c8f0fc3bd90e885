//! Dump outbox command implementation.

use super::LogImage;
use serde::Serialize;
use std::path::Path;
use tillsync_core::MutationRecord;

/// One queued mutation, for output.
#[derive(Debug, Serialize)]
pub struct MutationInfo {
    /// Mutation id.
    pub id: String,
    /// Delivery stream.
    pub stream: String,
    /// Operation name.
    pub operation: String,
    /// Delivery state.
    pub state: String,
    /// Send attempts so far.
    pub attempts: u32,
    /// Unix milliseconds at enqueue.
    pub created_at: u64,
    /// Earliest retry time, Unix milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<u64>,
    /// Last failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Idempotency key sent with every attempt.
    pub idempotency_key: String,
}

impl From<MutationRecord> for MutationInfo {
    fn from(record: MutationRecord) -> Self {
        Self {
            id: record.id.to_string(),
            stream: record.stream.to_string(),
            operation: record.operation.op_type().to_string(),
            state: format!("{:?}", record.state),
            attempts: record.attempts,
            created_at: record.created_at,
            not_before: record.not_before,
            last_error: record.last_error,
            idempotency_key: record.idempotency_key,
        }
    }
}

/// Runs the dump-outbox command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mutations = read_outbox(path, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&mutations)?);
        }
        _ => {
            print_text_output(&mutations);
        }
    }

    Ok(())
}

pub(crate) fn read_outbox(
    path: &Path,
    limit: Option<usize>,
) -> Result<Vec<MutationInfo>, Box<dyn std::error::Error>> {
    let image = LogImage::load(path)?;
    // Keys are zero padded ids, so key order is delivery order.
    Ok(image
        .decode::<MutationRecord>()?
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(MutationInfo::from)
        .collect())
}

fn print_text_output(mutations: &[MutationInfo]) {
    if mutations.is_empty() {
        println!("Outbox is empty");
        return;
    }
    println!(
        "{:<8} {:<14} {:<10} {:>8}  {}",
        "ID", "OPERATION", "STATE", "ATTEMPTS", "STREAM"
    );
    for m in mutations {
        println!(
            "{:<8} {:<14} {:<10} {:>8}  {}",
            m.id, m.operation, m.state, m.attempts, m.stream
        );
        if let Some(error) = &m.last_error {
            println!("         last error: {error}");
        }
    }
    println!();
    println!("{} mutation(s) queued", mutations.len());
}
