//! Round trip time estimation for the retransmission timeout.
//!
//! This is the smoothed estimator from RFC 6298 with one deviation: SRTT does not start with
//!  the first sample but with a configured initial value, and every sample (including the
//!  first) is blended into it.

use crate::config::ConnectlessConfig;

const SRTT_ALPHA: f64 = 0.125;
const RTTVAR_BETA: f64 = 0.25;
const RTO_K: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// smoothed RTT in milliseconds
    srtt: f64,
    /// RTT variance in milliseconds
    rttvar: f64,
    granularity_ms: f64,
    min_rto_ms: f64,
    max_rto_ms: f64,
}

impl RttEstimator {
    pub fn new(config: &ConnectlessConfig) -> RttEstimator {
        RttEstimator {
            srtt: config.initial_srtt.as_secs_f64() * 1000.0,
            rttvar: 0.0,
            granularity_ms: config.rto_granularity.as_secs_f64() * 1000.0,
            min_rto_ms: config.min_rto.as_secs_f64() * 1000.0,
            max_rto_ms: config.max_rto.as_secs_f64() * 1000.0,
        }
    }

    pub fn on_sample(&mut self, rtt_ms: u64) {
        let sample = rtt_ms as f64;
        self.rttvar = (1.0 - RTTVAR_BETA) * self.rttvar + RTTVAR_BETA * (self.srtt - sample).abs();
        self.srtt = (1.0 - SRTT_ALPHA) * self.srtt + SRTT_ALPHA * sample;
    }

    /// Applied when a retransmission timer expires without anything being received in the
    ///  meantime
    pub fn backoff(&mut self) {
        self.srtt = (self.srtt * 2.0).max(self.granularity_ms).min(self.max_rto_ms);
    }

    /// RTO in milliseconds: `SRTT + max(4*RTTVAR, granularity)`, clamped to the configured range
    pub fn rto_ms(&self) -> u64 {
        let rto = self.srtt + f64::max(RTO_K * self.rttvar, self.granularity_ms);
        rto.clamp(self.min_rto_ms, self.max_rto_ms) as u64
    }

    #[cfg(test)]
    pub fn srtt_ms(&self) -> f64 {
        self.srtt
    }

    #[cfg(test)]
    pub fn rttvar_ms(&self) -> f64 {
        self.rttvar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use rstest::rstest;

    fn estimator() -> RttEstimator {
        RttEstimator::new(&ConnectlessConfig::default_ipv4())
    }

    #[test]
    fn test_initial() {
        let rtt = estimator();
        assert_eq!(rtt.srtt_ms(), 1000.0);
        assert_eq!(rtt.rttvar_ms(), 0.0);
        assert_eq!(rtt.rto_ms(), 1030);
    }

    #[test]
    fn test_first_sample() {
        let mut rtt = estimator();
        rtt.on_sample(200);
        // rttvar = 0.25 * 800, srtt = 0.875 * 1000 + 0.125 * 200
        assert_eq!(rtt.rttvar_ms(), 200.0);
        assert_eq!(rtt.srtt_ms(), 900.0);
        assert_eq!(rtt.rto_ms(), 1700);
    }

    #[test]
    fn test_converges() {
        let mut rtt = estimator();
        for _ in 0..200 {
            rtt.on_sample(50);
        }
        assert!((rtt.srtt_ms() - 50.0).abs() < 1.0);
        assert_eq!(rtt.rto_ms(), 80);
    }

    #[rstest]
    #[case::doubles(100, 200.0)]
    #[case::granularity_floor(10, 30.0)]
    #[case::max_rto_cap(40_000, 60_000.0)]
    fn test_backoff(#[case] srtt: u64, #[case] expected_srtt: f64) {
        let mut rtt = estimator();
        rtt.srtt = srtt as f64;
        rtt.backoff();
        assert_eq!(rtt.srtt_ms(), expected_srtt);
    }

    #[test]
    fn test_rto_clamped() {
        let mut config = ConnectlessConfig::default_ipv4();
        config.min_rto = Duration::from_millis(200);
        config.initial_srtt = Duration::from_millis(10);
        let rtt = RttEstimator::new(&config);
        assert_eq!(rtt.rto_ms(), 200);
    }
}
