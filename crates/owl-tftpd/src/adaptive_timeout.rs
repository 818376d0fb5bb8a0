//! Retransmission timeout estimation after RFC 6298.
//!
//! Used when a client asks for `timeout=adaptive` and the server allows it.
//! One round trip is measured at a time; samples taken across a
//! retransmission are discarded (Karn's algorithm).

use std::time::{Duration, Instant};

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;
const K: f64 = 4.0;
const CLOCK_GRANULARITY: f64 = 1e-5;
const MAX_RTO: Duration = Duration::from_secs(60);
// 2^-8 seconds
const INITIAL_RTO: Duration = Duration::from_nanos(3_906_250);

#[derive(Debug, Clone)]
pub struct AdaptiveTimeout {
    srtt: f64,
    rttvar: f64,
    rto: Duration,
    has_sample: bool,
    timer: Option<Instant>,
    starting_block: u64,
}

impl Default for AdaptiveTimeout {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveTimeout {
    pub fn new() -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: INITIAL_RTO,
            has_sample: false,
            timer: None,
            starting_block: 0,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn is_timer_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Block whose acknowledgement the running measurement waits for.
    pub fn starting_block(&self) -> u64 {
        self.starting_block
    }

    pub fn start_timer(&mut self, block: u64) {
        self.starting_block = block;
        self.timer = Some(Instant::now());
    }

    pub fn cancel_timer(&mut self) {
        self.timer = None;
    }

    /// Stop the running measurement and fold it into the estimate.
    pub fn stop_timer(&mut self) {
        if let Some(started) = self.timer.take() {
            self.sample(started.elapsed());
        }
    }

    /// Apply one round trip measurement.
    pub fn sample(&mut self, rtt: Duration) {
        let r = rtt.as_secs_f64();
        if self.has_sample {
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (self.srtt - r).abs();
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * r;
        } else {
            self.srtt = r;
            self.rttvar = r / 2.0;
            self.has_sample = true;
        }
        let rto = self.srtt + CLOCK_GRANULARITY.max(K * self.rttvar);
        self.rto = Duration::from_secs_f64(rto).min(MAX_RTO);
    }

    /// Double the timeout after an expiry.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
    }
}
