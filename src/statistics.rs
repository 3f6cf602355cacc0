use std::sync::atomic::{AtomicUsize, Ordering};

/// The kind of event that can be reported into `Statistics`.
#[derive(Debug, Clone, Copy)]
pub enum Stat {
    TransactionStarted,
    TransactionFinished,
    ObserverRegistered,
    ObserverCancelled,
    DedupHit,
    Retransmission,
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Endpoint-wide counters. These are snapshot counters, not gauges: active
/// transaction/observer counts are read directly off the tables that own
/// them (`TransactionTable::len`, `ObservationRegistry::len`) rather than
/// tracked here, since a counter that must be decremented on every possible
/// exit path drifts; this struct only tracks monotonic event counts.
///
/// # Example
///
/// ```
/// use coap_endpoint::statistics::*;
///
/// let statistics = Statistics::default();
/// statistics.record(Stat::DedupHit);
/// statistics.record(Stat::DedupHit);
/// assert_eq!(statistics.dedup_hits.get(), 2);
/// ```
#[derive(Default)]
pub struct Statistics {
    pub transactions_started: Count,
    pub transactions_finished: Count,
    pub observers_registered: Count,
    pub observers_cancelled: Count,
    pub dedup_hits: Count,
    pub retransmissions: Count,
}

impl Statistics {
    pub fn record(&self, stat: Stat) {
        match stat {
            Stat::TransactionStarted => self.transactions_started.add(1),
            Stat::TransactionFinished => self.transactions_finished.add(1),
            Stat::ObserverRegistered => self.observers_registered.add(1),
            Stat::ObserverCancelled => self.observers_cancelled.add(1),
            Stat::DedupHit => self.dedup_hits.add(1),
            Stat::Retransmission => self.retransmissions.add(1),
        }
    }
}
