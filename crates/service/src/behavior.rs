//! Immutable protocol constants (RFC 7252 §4.8) and the quantities derived
//! from them. One `Behavior` is shared (by reference) across every layer of
//! an endpoint's stack; it never changes after construction.

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Behavior {
    pub max_outbound_bytes: usize,
    pub max_inbound_bytes: usize,
    pub max_retransmit: u32,
    pub ack_timeout_ms: u64,
    pub ack_random_factor: f64,
    pub nstart: u32,
    pub default_leisure_ms: u64,
    pub probing_rate: u32,
    pub max_latency_ms: u64,
    pub multicast_response_avg_delay_ms: u64,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            max_outbound_bytes: 1152,
            max_inbound_bytes: 65535,
            max_retransmit: 4,
            ack_timeout_ms: 2000,
            ack_random_factor: 1.5,
            nstart: 1,
            default_leisure_ms: 5000,
            probing_rate: 1,
            max_latency_ms: 100_000,
            multicast_response_avg_delay_ms: 25,
        }
    }
}

impl Behavior {
    /// Fixed equal to `ack_timeout_ms` (RFC 7252 §4.8.2).
    pub fn processing_delay_ms(&self) -> u64 {
        self.ack_timeout_ms
    }

    pub fn max_transmit_span_ms(&self) -> f64 {
        self.ack_timeout_ms as f64 * ((1u64 << self.max_retransmit) - 1) as f64 * self.ack_random_factor
    }

    pub fn max_transmit_wait_ms(&self) -> f64 {
        self.ack_timeout_ms as f64 * ((1u64 << (self.max_retransmit + 1)) - 1) as f64 * self.ack_random_factor
    }

    pub fn exchange_lifetime_ms(&self) -> f64 {
        self.max_transmit_span_ms() + 2.0 * self.max_latency_ms as f64 + self.processing_delay_ms() as f64
    }

    pub fn non_lifetime_ms(&self) -> f64 {
        self.max_transmit_span_ms() + self.max_latency_ms as f64
    }

    /// `ack_timeout · (1 + rand[0,1) · ack_random_factor) << (attempt−1)`,
    /// `attempt` capped at 5 per RFC 7252 §4.2 (beyond which `max_retransmit`
    /// will already have closed the entry).
    pub fn retransmit_timeout_ms(&self, attempt: u32) -> u64 {
        let attempt = attempt.clamp(1, 5);
        let base = self.ack_timeout_ms as f64 * (1.0 + rand::rng().random::<f64>() * self.ack_random_factor);
        (base as u64) << (attempt - 1)
    }

    pub fn multicast_delay_ms(&self) -> u64 {
        (self.multicast_response_avg_delay_ms as f64 * rand::rng().random::<f64>() * self.ack_random_factor) as u64
    }
}
