use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct IngestStats {
    blocks: AtomicU64,
    duplicate_blocks: AtomicU64,
    skipped_payloads: AtomicU64,
    transactions: AtomicU64,
    alert_transitions: AtomicU64,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub const fn new() -> Self {
        Self {
            blocks: AtomicU64::new(0),
            duplicate_blocks: AtomicU64::new(0),
            skipped_payloads: AtomicU64::new(0),
            transactions: AtomicU64::new(0),
            alert_transitions: AtomicU64::new(0),
        }
    }

    pub fn inc_blocks(&self, n: u64) {
        self.blocks.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_duplicate_blocks(&self, n: u64) {
        self.duplicate_blocks.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_skipped_payloads(&self, n: u64) {
        self.skipped_payloads.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_transactions(&self, n: u64) {
        self.transactions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_alert_transitions(&self, n: u64) {
        self.alert_transitions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            blocks: self.blocks.load(Ordering::Relaxed),
            duplicate_blocks: self.duplicate_blocks.load(Ordering::Relaxed),
            skipped_payloads: self.skipped_payloads.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            alert_transitions: self.alert_transitions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestSnapshot {
    pub blocks: u64,
    pub duplicate_blocks: u64,
    pub skipped_payloads: u64,
    pub transactions: u64,
    pub alert_transitions: u64,
}

pub static INGEST_STATS: IngestStats = IngestStats::new();
