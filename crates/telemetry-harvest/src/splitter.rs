// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ops::Range;

use tracing::{trace, warn};

use crate::compressor::Compression;
use crate::errors::SplitError;

/// Default cap on a compressed request body accepted by the ingest.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1_000_000;

/// A compressed request body plus the slice of input records it encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedChunk {
    pub body: Vec<u8>,
    pub records: Range<usize>,
}

/// Splits `records` into compressed chunks of at most `max_bytes` each.
///
/// `encode` serializes a slice of records into its wire form, so enveloped signals are sized
/// with their envelope applied to every chunk. The slice is bisected by record count until each
/// half compresses under the limit; chunk order always follows record order.
///
/// A single record that still does not fit is emitted on its own and left for the ingest to
/// reject.
pub fn split<T, E>(
    records: &[T],
    max_bytes: usize,
    compression: Compression,
    encode: E,
) -> Result<Vec<CompressedChunk>, SplitError>
where
    E: Fn(&[T]) -> Result<Vec<u8>, serde_json::Error>,
{
    let mut chunks = Vec::new();
    if records.is_empty() {
        return Ok(chunks);
    }
    split_range(records, 0..records.len(), max_bytes, compression, &encode, &mut chunks)?;
    Ok(chunks)
}

fn split_range<T, E>(
    records: &[T],
    range: Range<usize>,
    max_bytes: usize,
    compression: Compression,
    encode: &E,
    chunks: &mut Vec<CompressedChunk>,
) -> Result<(), SplitError>
where
    E: Fn(&[T]) -> Result<Vec<u8>, serde_json::Error>,
{
    let serialized = encode(&records[range.clone()])?;
    let body = compression.compress(&serialized)?;

    if body.len() <= max_bytes {
        chunks.push(CompressedChunk {
            body,
            records: range,
        });
        return Ok(());
    }

    if range.len() == 1 {
        warn!(
            "Record {} compresses to {} bytes, over the {max_bytes} byte limit, sending it anyway",
            range.start,
            body.len()
        );
        chunks.push(CompressedChunk {
            body,
            records: range,
        });
        return Ok(());
    }

    let mid = range.start + range.len() / 2;
    trace!(
        "Chunk {:?} compressed to {} bytes, bisecting at {mid}",
        range,
        body.len()
    );
    split_range(records, range.start..mid, max_bytes, compression, encode, chunks)?;
    split_range(records, mid..range.end, max_bytes, compression, encode, chunks)
}
