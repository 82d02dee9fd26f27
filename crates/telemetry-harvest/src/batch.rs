// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-invocation accumulation of raw telemetry chunks.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Telemetry bookkeeping for one function execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub request_id: String,
    pub start: DateTime<Utc>,
    /// Raw Telemetry API POST bodies in arrival order.
    pub telemetry: Vec<Vec<u8>>,
}

impl Invocation {
    #[must_use]
    pub fn new(request_id: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.into(),
            start,
            telemetry: Vec::new(),
        }
    }

    #[must_use]
    pub fn telemetry_bytes(&self) -> usize {
        self.telemetry.iter().map(Vec::len).sum()
    }
}

#[derive(Debug)]
struct BatchState {
    invocations: Vec<Invocation>,
    index: HashMap<String, usize>,
    total_bytes: usize,
    last_harvest: Instant,
    latest_request_id: Option<String>,
}

impl BatchState {
    fn new() -> Self {
        Self {
            invocations: Vec::new(),
            index: HashMap::new(),
            total_bytes: 0,
            last_harvest: Instant::now(),
            latest_request_id: None,
        }
    }

    fn slot(&mut self, request_id: &str, start: DateTime<Utc>) -> &mut Invocation {
        let position = match self.index.get(request_id) {
            Some(position) => *position,
            None => {
                self.invocations.push(Invocation::new(request_id, start));
                let position = self.invocations.len() - 1;
                self.index.insert(request_id.to_string(), position);
                position
            }
        };
        &mut self.invocations[position]
    }

    fn ready(&self, byte_threshold: usize, interval: Duration) -> bool {
        self.total_bytes > byte_threshold || self.last_harvest.elapsed() > interval
    }
}

/// Invocations accumulated since the last harvest.
///
/// A single lock serializes appends against the harvest snapshot-and-clear, so no chunk is
/// ever seen by two harvests or lost between them.
#[derive(Debug)]
pub struct Batch {
    state: Mutex<BatchState>,
    byte_threshold: usize,
    interval: Duration,
}

impl Batch {
    #[must_use]
    pub fn new(byte_threshold: usize, interval: Duration) -> Self {
        Self {
            state: Mutex::new(BatchState::new()),
            byte_threshold,
            interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        // The state is consistent after every statement, a panicking holder cannot leave it
        // half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an invocation. Calling it again for the same request id is a no-op apart
    /// from marking it as the latest.
    pub fn add_invocation(&self, request_id: &str, start: DateTime<Utc>) {
        let mut state = self.lock();
        state.slot(request_id, start);
        state.latest_request_id = Some(request_id.to_string());
    }

    /// Appends a raw chunk to `request_id`, creating a placeholder invocation when it is
    /// not known to the batch.
    pub fn add_telemetry(&self, request_id: &str, bytes: Vec<u8>) {
        let mut state = self.lock();
        if !state.index.contains_key(request_id) {
            debug!("Telemetry for unregistered invocation {request_id:?}, adding placeholder");
        }
        let len = bytes.len();
        state.slot(request_id, Utc::now()).telemetry.push(bytes);
        state.total_bytes += len;
    }

    /// Appends a raw chunk to the most recently registered invocation.
    pub fn add_telemetry_to_latest(&self, bytes: Vec<u8>) {
        let mut state = self.lock();
        let request_id = state.latest_request_id.clone().unwrap_or_default();
        let len = bytes.len();
        state.slot(&request_id, Utc::now()).telemetry.push(bytes);
        state.total_bytes += len;
    }

    #[must_use]
    pub fn ready_to_harvest(&self) -> bool {
        self.lock().ready(self.byte_threshold, self.interval)
    }

    /// Takes every accumulated invocation. Without `force` nothing is taken, and nothing
    /// changes, unless a threshold has been crossed.
    #[must_use]
    pub fn harvest(&self, force: bool) -> Vec<Invocation> {
        let mut state = self.lock();
        if !force && !state.ready(self.byte_threshold, self.interval) {
            return Vec::new();
        }
        let harvested_bytes = state.total_bytes;
        state.index.clear();
        state.total_bytes = 0;
        state.last_harvest = Instant::now();
        let invocations = std::mem::take(&mut state.invocations);
        if let Some(oldest) = invocations.iter().map(|invocation| invocation.start).min() {
            debug!(
                "Harvested {} invocations holding {harvested_bytes} bytes, oldest started at {} (forced: {force})",
                invocations.len(),
                oldest.to_rfc3339()
            );
        }
        invocations
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().invocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().invocations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn batch(byte_threshold: usize) -> Batch {
        Batch::new(byte_threshold, Duration::from_secs(3600))
    }

    #[test]
    fn test_add_invocation_is_idempotent() {
        let batch = batch(1_000);
        let first = Utc::now();
        batch.add_invocation("req-1", first);
        batch.add_telemetry("req-1", b"[]".to_vec());
        batch.add_invocation("req-1", first + chrono::Duration::seconds(5));

        let harvested = batch.harvest(true);
        assert_eq!(harvested.len(), 1);
        assert_eq!(harvested[0].start, first);
        assert_eq!(harvested[0].telemetry, vec![b"[]".to_vec()]);
    }

    #[test]
    fn test_unknown_invocation_gets_placeholder() {
        let batch = batch(1_000);
        batch.add_telemetry("late", b"abc".to_vec());

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.total_bytes(), 3);
        let harvested = batch.harvest(true);
        assert_eq!(harvested[0].request_id, "late");
    }

    #[test]
    fn test_telemetry_goes_to_latest_invocation() {
        let batch = batch(1_000);
        batch.add_telemetry_to_latest(b"early".to_vec());
        batch.add_invocation("req-1", Utc::now());
        batch.add_invocation("req-2", Utc::now());
        batch.add_telemetry_to_latest(b"two".to_vec());

        let harvested = batch.harvest(true);
        let ids: Vec<_> = harvested.iter().map(|i| i.request_id.as_str()).collect();
        assert_eq!(ids, vec!["", "req-1", "req-2"]);
        assert_eq!(harvested[2].telemetry, vec![b"two".to_vec()]);
        assert!(harvested[1].telemetry.is_empty());
    }

    #[test]
    fn test_non_forced_harvest_is_gated() {
        let batch = batch(10);
        batch.add_telemetry("req-1", vec![0; 5]);

        assert!(!batch.ready_to_harvest());
        assert!(batch.harvest(false).is_empty());
        assert_eq!(batch.total_bytes(), 5);
        assert_eq!(batch.len(), 1);

        batch.add_telemetry("req-1", vec![0; 6]);
        assert!(batch.ready_to_harvest());
        let harvested = batch.harvest(false);
        assert_eq!(harvested[0].telemetry_bytes(), 11);
        assert_eq!(batch.total_bytes(), 0);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_time_threshold() {
        let batch = Batch::new(usize::MAX, Duration::from_millis(1));
        batch.add_telemetry("req-1", vec![1]);
        thread::sleep(Duration::from_millis(5));

        assert!(batch.ready_to_harvest());
        assert_eq!(batch.harvest(false).len(), 1);
        assert_eq!(batch.total_bytes(), 0);
    }

    #[test]
    fn test_forced_harvest_ignores_thresholds() {
        let batch = batch(usize::MAX);
        batch.add_telemetry("req-1", vec![1, 2, 3]);
        assert_eq!(batch.harvest(true).len(), 1);
        assert!(batch.harvest(true).is_empty());
    }

    #[test]
    fn test_concurrent_appends_are_harvested_exactly_once() {
        let batch = Arc::new(batch(usize::MAX));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let batch = Arc::clone(&batch);
                thread::spawn(move || {
                    for i in 0..500u32 {
                        let mut chunk = vec![w as u8];
                        chunk.extend_from_slice(&i.to_be_bytes());
                        batch.add_telemetry(&format!("req-{w}"), chunk);
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while writers.iter().any(|w| !w.is_finished()) {
            seen.extend(batch.harvest(true));
        }
        for writer in writers {
            writer.join().expect("writer panicked");
        }
        seen.extend(batch.harvest(true));

        let mut chunks: Vec<Vec<u8>> = seen.into_iter().flat_map(|i| i.telemetry).collect();
        assert_eq!(chunks.len(), 4 * 500);
        chunks.sort();
        chunks.dedup();
        assert_eq!(chunks.len(), 4 * 500);
        assert_eq!(batch.total_bytes(), 0);
    }
}
