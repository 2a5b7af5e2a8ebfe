use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub messages_in: u64,
    pub duplicates_dropped: u64,
    pub bot_replies: u64,
    pub relay_failures: u64,
    pub status_updates: u64,
    pub tasks_failed: u64,
}

#[derive(Debug)]
pub struct MetricsStore {
    start_time: Instant,
    messages_in: AtomicU64,
    duplicates_dropped: AtomicU64,
    bot_replies: AtomicU64,
    relay_failures: AtomicU64,
    status_updates: AtomicU64,
    tasks_failed: AtomicU64,
}

impl MetricsStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            messages_in: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            bot_replies: AtomicU64::new(0),
            relay_failures: AtomicU64::new(0),
            status_updates: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
        })
    }

    pub fn inc_messages_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicates_dropped(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bot_replies(&self) {
        self.bot_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_relay_failures(&self) {
        self.relay_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_status_updates(&self) {
        self.status_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            bot_replies: self.bot_replies.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
            status_updates: self.status_updates.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
        }
    }
}
