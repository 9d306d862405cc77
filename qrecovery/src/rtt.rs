use std::time::Duration;

pub const INITIAL_RTT: Duration = Duration::from_millis(333);
pub const GRANULARITY: Duration = Duration::from_millis(1);
/// Maximum reordering in time before a packet is deemed lost, 9/8 of an RTT.
pub const TIME_THRESHOLD: f32 = 1.125;

/// RTT estimation as described in
/// [section-5](https://www.rfc-editor.org/rfc/rfc9002#section-5)
/// of [QUIC-RECOVERY](https://www.rfc-editor.org/rfc/rfc9002).
#[derive(Debug, Clone)]
pub struct Rtt {
    max_ack_delay: Duration,
    has_sample: bool,
    latest_rtt: Duration,
    smoothed_rtt: Duration,
    rttvar: Duration,
    min_rtt: Duration,
}

impl Default for Rtt {
    fn default() -> Self {
        Self::new(Duration::from_millis(25))
    }
}

impl Rtt {
    pub fn new(max_ack_delay: Duration) -> Self {
        Self {
            max_ack_delay,
            has_sample: false,
            latest_rtt: Duration::ZERO,
            smoothed_rtt: INITIAL_RTT,
            rttvar: INITIAL_RTT / 2,
            min_rtt: Duration::ZERO,
        }
    }

    pub fn update(&mut self, latest_rtt: Duration, mut ack_delay: Duration, is_handshake_confirmed: bool) {
        self.latest_rtt = latest_rtt;
        if !self.has_sample {
            self.min_rtt = latest_rtt;
            self.smoothed_rtt = latest_rtt;
            self.rttvar = latest_rtt / 2;
            self.has_sample = true;
            return;
        }

        // min_rtt ignores acknowledgment delay.
        self.min_rtt = self.min_rtt.min(latest_rtt);

        // Limit ack_delay by max_ack_delay after handshake confirmation.
        if is_handshake_confirmed {
            ack_delay = ack_delay.min(self.max_ack_delay);
        }

        // Adjust for acknowledgment delay if plausible.
        let mut adjusted_rtt = latest_rtt;
        if latest_rtt >= self.min_rtt + ack_delay {
            adjusted_rtt = latest_rtt - ack_delay;
        }

        let abs_diff = self.smoothed_rtt.abs_diff(adjusted_rtt);
        self.rttvar = self.rttvar.mul_f32(0.75) + abs_diff.mul_f32(0.25);
        self.smoothed_rtt = self.smoothed_rtt.mul_f32(0.875) + adjusted_rtt.mul_f32(0.125);
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    /// How long after a later packet was acknowledged an earlier one is
    /// declared lost.
    pub fn loss_delay(&self) -> Duration {
        self.latest_rtt
            .max(self.smoothed_rtt)
            .mul_f32(TIME_THRESHOLD)
            .max(GRANULARITY)
    }

    pub fn pto_base_duration(&self, pto_count: u32) -> Duration {
        (self.smoothed_rtt + (self.rttvar * 4).max(GRANULARITY)) * (1 << pto_count.min(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample() {
        let mut rtt = Rtt::default();
        assert_eq!(rtt.smoothed_rtt(), INITIAL_RTT);
        rtt.update(Duration::from_millis(100), Duration::ZERO, false);
        assert!(rtt.has_sample());
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(100));
        assert_eq!(rtt.rttvar(), Duration::from_millis(50));
        assert_eq!(rtt.min_rtt(), Duration::from_millis(100));
    }

    #[test]
    fn test_smoothing_and_ack_delay() {
        let mut rtt = Rtt::new(Duration::from_millis(10));
        rtt.update(Duration::from_millis(100), Duration::ZERO, true);
        // 50ms ack delay is capped at 10ms once the handshake is confirmed
        rtt.update(Duration::from_millis(180), Duration::from_millis(50), true);
        let smoothed = rtt.smoothed_rtt().as_micros() as i128;
        assert!((smoothed - 108_750).abs() < 10, "{smoothed}");
        assert_eq!(rtt.min_rtt(), Duration::from_millis(100));
        assert_eq!(rtt.latest_rtt(), Duration::from_millis(180));
    }

    #[test]
    fn test_loss_delay() {
        let mut rtt = Rtt::default();
        rtt.update(Duration::from_millis(80), Duration::ZERO, false);
        let delay = rtt.loss_delay().as_micros() as i128;
        assert!((delay - 90_000).abs() < 10, "{delay}");
    }
}
