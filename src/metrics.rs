//! Process-wide fan-out counters.
//!
//! Plain atomics, bumped by [`crate::fanout::LogSink`] and the task queue.
//! Degraded failures are kept per fan-out step so a status dump shows which
//! collection is misbehaving.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

static MESSAGES_PERSISTED: AtomicU64 = AtomicU64::new(0);
static SENDS_ABORTED: AtomicU64 = AtomicU64::new(0);
static PUSH_DELIVERED: AtomicU64 = AtomicU64::new(0);
static PUSH_MISSED: AtomicU64 = AtomicU64::new(0);
static TASKS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static TASKS_FAILED: AtomicU64 = AtomicU64::new(0);
static TASKS_DROPPED: AtomicU64 = AtomicU64::new(0);

static DEGRADED: OnceLock<Mutex<HashMap<&'static str, u64>>> = OnceLock::new();

pub fn inc_messages_persisted() {
    MESSAGES_PERSISTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_sends_aborted() {
    SENDS_ABORTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_push_delivered() {
    PUSH_DELIVERED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_push_missed() {
    PUSH_MISSED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_tasks_completed() {
    TASKS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_tasks_failed() {
    TASKS_FAILED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_tasks_dropped() {
    TASKS_DROPPED.fetch_add(1, Ordering::Relaxed);
}

fn degraded_lock() -> &'static Mutex<HashMap<&'static str, u64>> {
    DEGRADED.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Count one absorbed failure for a fan-out step.
pub fn record_degraded(step: &'static str) {
    // A poisoned map only loses a counter; never take the send path down for it.
    if let Ok(mut guard) = degraded_lock().lock() {
        let counter = guard.entry(step).or_default();
        *counter = counter.saturating_add(1);
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_persisted: u64,
    pub sends_aborted: u64,
    pub push_delivered: u64,
    pub push_missed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_dropped: u64,
    pub degraded: HashMap<&'static str, u64>,
}

impl MetricsSnapshot {
    pub fn degraded_total(&self) -> u64 {
        self.degraded.values().sum()
    }
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        messages_persisted: MESSAGES_PERSISTED.load(Ordering::Relaxed),
        sends_aborted: SENDS_ABORTED.load(Ordering::Relaxed),
        push_delivered: PUSH_DELIVERED.load(Ordering::Relaxed),
        push_missed: PUSH_MISSED.load(Ordering::Relaxed),
        tasks_completed: TASKS_COMPLETED.load(Ordering::Relaxed),
        tasks_failed: TASKS_FAILED.load(Ordering::Relaxed),
        tasks_dropped: TASKS_DROPPED.load(Ordering::Relaxed),
        degraded: degraded_lock().lock().map(|g| g.clone()).unwrap_or_default(),
    }
}
