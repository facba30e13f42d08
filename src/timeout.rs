//! Adaptive retransmission timeout (RFC 6298).
//!
//! `RTO = SRTT + max(G, 4 * RTTVAR)`, doubled on every retransmission timeout
//! and capped at [`MAX_RTO`]. A running timer remembers the first block it
//! was started for, and a later ACK only yields an RTT sample when it covers
//! that block. Retransmitted windows never start the timer (Karn).

use std::time::{Duration, Instant};

/// RTO before the first sample is taken (2^-8 s).
pub const INITIAL_RTO: Duration = Duration::from_nanos(3_906_250);
pub const MAX_RTO: Duration = Duration::from_secs(60);
/// Clock granularity `G`.
pub const GRANULARITY: Duration = Duration::from_micros(10);

#[derive(Debug, Clone)]
pub struct AdaptiveTimeout {
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
    first_measurement: bool,
    timer: Option<RunningTimer>,
}

#[derive(Debug, Clone, Copy)]
struct RunningTimer {
    started_at: Instant,
    first_block: u64,
}

impl Default for AdaptiveTimeout {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveTimeout {
    pub fn new() -> Self {
        Self {
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            rto: INITIAL_RTO,
            first_measurement: true,
            timer: None,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Duration {
        self.srtt
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Starts timing the flight that begins with `first_block`.
    pub fn start_timer(&mut self, first_block: u64) {
        self.timer = Some(RunningTimer {
            started_at: Instant::now(),
            first_block,
        });
    }

    /// Stops the timer if `acked_block` closes the timed flight, folding
    /// the elapsed time into the estimate. Returns the new RTO when a
    /// sample was taken.
    pub fn stop_timer(&mut self, acked_block: u64) -> Option<Duration> {
        let timer = self.timer?;
        if acked_block < timer.first_block {
            return None;
        }
        self.timer = None;
        self.sample(timer.started_at.elapsed());
        Some(self.rto)
    }

    /// Drops the running timer without sampling.
    pub fn cancel_timer(&mut self) {
        self.timer = None;
    }

    pub fn sample(&mut self, rtt: Duration) {
        if self.first_measurement {
            self.first_measurement = false;
            self.srtt = rtt;
            self.rttvar = rtt / 2;
        } else {
            // beta = 1/4, alpha = 1/8
            self.rttvar = self.rttvar * 3 / 4 + self.srtt.abs_diff(rtt) / 4;
            self.srtt = self.srtt * 7 / 8 + rtt / 8;
        }
        self.rto = (self.srtt + GRANULARITY.max(self.rttvar * 4)).min(MAX_RTO);
    }

    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_estimate() {
        let mut rto = AdaptiveTimeout::new();
        assert_eq!(rto.rto(), INITIAL_RTO);
        rto.sample(Duration::from_millis(100));
        assert_eq!(rto.srtt(), Duration::from_millis(100));
        // 100ms + 4 * 50ms
        assert_eq!(rto.rto(), Duration::from_millis(300));
    }

    #[test]
    fn converges_on_constant_rtt() {
        let r = Duration::from_millis(10);
        let mut rto = AdaptiveTimeout::new();
        let mut previous = Duration::MAX;
        for _ in 0..60 {
            rto.sample(r);
            assert!(rto.rto() <= previous);
            previous = rto.rto();
        }
        assert_eq!(rto.srtt(), r);
        assert!(rto.rto() - r < Duration::from_micros(100), "{:?}", rto.rto());
        assert!(rto.rto() >= r + GRANULARITY);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut rto = AdaptiveTimeout::new();
        rto.backoff();
        assert_eq!(rto.rto(), INITIAL_RTO * 2);
        for _ in 0..40 {
            rto.backoff();
        }
        assert_eq!(rto.rto(), MAX_RTO);
        rto.sample(Duration::from_secs(50));
        assert_eq!(rto.rto(), MAX_RTO);
    }

    #[test]
    fn samples_only_acks_covering_the_timed_flight() {
        let mut rto = AdaptiveTimeout::new();
        assert_eq!(rto.stop_timer(1), None);

        rto.start_timer(5);
        assert_eq!(rto.stop_timer(4), None);
        assert!(rto.is_running());
        assert!(rto.stop_timer(6).is_some());
        assert!(!rto.is_running());

        rto.start_timer(7);
        rto.cancel_timer();
        assert_eq!(rto.stop_timer(7), None);
    }
}
