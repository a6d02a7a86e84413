//! Pending pod port retries
//!
//! Pods whose port could not be set up are kept here, keyed by
//! `namespace/name`, until a later attempt succeeds or the pod is deleted.
//! Each pod backs off independently with a [`FibonacciBackoff`].

use crate::backoff::FibonacciBackoff;
use crate::workload::Workload;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct RetryEntry {
    workload: Workload,
    backoff: FibonacciBackoff,
    attempts: u32,
    next_attempt: Instant,
}

#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: Mutex<HashMap<String, RetryEntry>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule (another) attempt for a pod and return the delay until it.
    ///
    /// Re-adding a pod keeps its backoff progress and replaces the stored
    /// workload with the newer one.
    pub fn add(&self, workload: Workload, now: Instant) -> Duration {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = workload.key();
        let entry = entries.entry(key).or_insert_with(|| RetryEntry {
            workload: workload.clone(),
            backoff: FibonacciBackoff::default(),
            attempts: 0,
            next_attempt: now,
        });
        let delay = entry.backoff.next_backoff();
        entry.workload = workload;
        entry.attempts += 1;
        entry.next_attempt = now + delay;
        delay
    }

    /// Drop a pending retry; returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Workloads whose next attempt is due, with the number of failed attempts so far.
    pub fn due(&self, now: Instant) -> Vec<(Workload, u32)> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut due: Vec<(Workload, u32)> = entries
            .values()
            .filter(|entry| entry.next_attempt <= now)
            .map(|entry| (entry.workload.clone(), entry.attempts))
            .collect();
        due.sort_by(|a, b| a.0.key().cmp(&b.0.key()));
        due
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
