use std::cmp::{max, min};
use std::time::Duration;
use crate::config::RtoConfig;

const MAX_BACKOFF_SHIFT: u32 = 16;

/// Retransmission timeout estimation along the lines of RFC 6298: smoothed RTT and RTT variance
///  from samples, exponential backoff on timeouts, clamped to the configured bounds.
///
/// Samples must only be taken from messages that were transmitted exactly once, otherwise it is
///  ambiguous which transmission the ack belongs to.
pub struct RtoEstimator {
    config: RtoConfig,
    srtt: Option<Duration>,
    rttvar: Duration,
    backoff_shift: u32,
}

impl RtoEstimator {
    pub fn new(config: RtoConfig) -> RtoEstimator {
        RtoEstimator {
            config,
            srtt: None,
            rttvar: Duration::ZERO,
            backoff_shift: 0,
        }
    }

    pub fn on_rtt_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let deviation = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + deviation) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        self.backoff_shift = 0;
    }

    pub fn on_retransmission_timeout(&mut self) {
        self.backoff_shift = min(self.backoff_shift + 1, MAX_BACKOFF_SHIFT);
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn current_rto(&self) -> Duration {
        let base = match self.srtt {
            None => self.config.initial_rto,
            Some(srtt) => srtt + max(self.rttvar * 4, Duration::from_millis(1)),
        };
        let base = max(base, self.config.min_rto);

        let backed_off = base.checked_mul(1 << self.backoff_shift)
            .unwrap_or(self.config.max_rto);
        min(backed_off, self.config.max_rto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> RtoConfig {
        RtoConfig {
            initial_rto: Duration::from_millis(1000),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_initial() {
        let rto = RtoEstimator::new(config());
        assert_eq!(rto.current_rto(), Duration::from_millis(1000));
        assert_eq!(rto.srtt(), None);
    }

    #[rstest]
    #[case::first_sample(vec![400], Duration::from_millis(400), Duration::from_millis(1200))]
    #[case::clamped_to_min(vec![10], Duration::from_millis(10), Duration::from_millis(200))]
    #[case::stable(vec![400, 400], Duration::from_millis(400), Duration::from_millis(1000))]
    #[case::second_higher(vec![400, 800], Duration::from_millis(450), Duration::from_millis(1450))]
    fn test_rtt_samples(#[case] samples: Vec<u64>, #[case] expected_srtt: Duration, #[case] expected_rto: Duration) {
        let mut rto = RtoEstimator::new(config());
        for s in samples {
            rto.on_rtt_sample(Duration::from_millis(s));
        }
        assert_eq!(rto.srtt(), Some(expected_srtt));
        assert_eq!(rto.current_rto(), expected_rto);
    }

    #[rstest]
    #[case::once(1, Duration::from_millis(2000))]
    #[case::twice(2, Duration::from_millis(4000))]
    #[case::clamped(10, Duration::from_secs(60))]
    #[case::many(100, Duration::from_secs(60))]
    fn test_backoff(#[case] num_timeouts: usize, #[case] expected: Duration) {
        let mut rto = RtoEstimator::new(config());
        for _ in 0..num_timeouts {
            rto.on_retransmission_timeout();
        }
        assert_eq!(rto.current_rto(), expected);
    }

    #[test]
    fn test_sample_resets_backoff() {
        let mut rto = RtoEstimator::new(config());
        rto.on_retransmission_timeout();
        rto.on_retransmission_timeout();
        rto.on_rtt_sample(Duration::from_millis(400));
        assert_eq!(rto.current_rto(), Duration::from_millis(1200));
    }
}
