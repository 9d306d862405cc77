//! The congestion controller seam, and the NewReno window used by default.

use std::time::Instant;

use qbase::Epoch;

/// Default datagram size in bytes.
pub const MSS: usize = 1200;

// min(10*MSS, max(2*MSS, 14600)), see https://datatracker.ietf.org/doc/html/rfc6928#autoid-3
const INIT_CWND: u64 = 10 * MSS as u64;
const INFINITE_SSTHRESH: u64 = u64::MAX;
const LOSS_REDUCTION_FACTOR: f64 = 0.5;

/// The interface the connection drives a congestion control algorithm
/// through. Pacing and timers are the driver's business.
pub trait CongestionController: Send {
    /// How many more bytes may be put in flight now.
    /// # Parameters
    /// - `bytes_in_flight`: The bytes of in-flight packets neither acknowledged nor lost.
    fn send_quota(&self, bytes_in_flight: usize) -> usize;

    /// Records the sending of a packet.
    /// # Parameters
    /// - `pn`: The packet number of the sent packet.
    /// - `sent_bytes`: The number of bytes sent in this packet.
    /// - `in_flight`: Whether the packet counts toward bytes in flight.
    fn on_packet_sent(&mut self, epoch: Epoch, pn: u64, sent_bytes: usize, in_flight: bool, now: Instant);

    /// Records the acknowledgment of an in-flight packet.
    /// # Parameters
    /// - `time_sent`: When the acknowledged packet was sent.
    fn on_packet_acked(&mut self, epoch: Epoch, pn: u64, bytes: usize, time_sent: Instant, now: Instant);

    /// Records the loss of an in-flight packet.
    /// # Parameters
    /// - `time_sent`: When the lost packet was sent.
    fn on_packet_lost(&mut self, epoch: Epoch, pn: u64, bytes: usize, time_sent: Instant, now: Instant);

    /// The current congestion window.
    fn cwnd(&self) -> u64;
}

#[derive(Debug)]
pub struct NewReno {
    cwnd: u64,
    ssthresh: u64,
    // https://datatracker.ietf.org/doc/html/rfc3465#autoid-3
    bytes_acked: u64,
    recovery_start_time: Option<Instant>,
}

impl Default for NewReno {
    fn default() -> Self {
        Self::new()
    }
}

impl NewReno {
    pub fn new() -> Self {
        NewReno {
            cwnd: INIT_CWND,
            ssthresh: INFINITE_SSTHRESH,
            bytes_acked: 0,
            recovery_start_time: None,
        }
    }

    fn in_congestion_recovery(&self, sent_time: Instant) -> bool {
        self.recovery_start_time
            .is_some_and(|recovery_start_time| sent_time <= recovery_start_time)
    }
}

impl CongestionController for NewReno {
    fn send_quota(&self, bytes_in_flight: usize) -> usize {
        self.cwnd.saturating_sub(bytes_in_flight as u64) as usize
    }

    fn on_packet_sent(&mut self, _: Epoch, _: u64, _: usize, _: bool, _: Instant) {}

    fn on_packet_acked(&mut self, _: Epoch, _: u64, bytes: usize, time_sent: Instant, _: Instant) {
        if self.in_congestion_recovery(time_sent) {
            return;
        }
        if self.cwnd < self.ssthresh {
            // slow start
            self.cwnd += bytes as u64;
            if self.cwnd >= self.ssthresh {
                self.bytes_acked = self.cwnd - self.ssthresh;
            }
        } else {
            // congestion avoidance, one MSS per window of acknowledged bytes
            self.bytes_acked += bytes as u64;
            if self.bytes_acked >= self.cwnd {
                self.bytes_acked -= self.cwnd;
                self.cwnd += MSS as u64;
            }
        }
    }

    fn on_packet_lost(&mut self, epoch: Epoch, pn: u64, _: usize, time_sent: Instant, now: Instant) {
        if self.in_congestion_recovery(time_sent) {
            return;
        }
        self.recovery_start_time = Some(now);
        self.cwnd = ((self.cwnd as f64 * LOSS_REDUCTION_FACTOR) as u64).max(2 * MSS as u64);
        self.bytes_acked = (self.bytes_acked as f64 * LOSS_REDUCTION_FACTOR) as u64;
        self.ssthresh = self.cwnd;
        tracing::debug!(target: "quic", ?epoch, pn, cwnd = self.cwnd, "congestion event");
    }

    fn cwnd(&self) -> u64 {
        self.cwnd
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ack_round(reno: &mut NewReno, pns: std::ops::Range<u64>, time_sent: Instant) {
        for pn in pns {
            reno.on_packet_acked(Epoch::Data, pn, MSS, time_sent, time_sent);
        }
    }

    #[test]
    fn test_reno_slow_start() {
        let mut reno = NewReno::new();
        let now = Instant::now();
        assert_eq!(reno.send_quota(0), INIT_CWND as usize);
        ack_round(&mut reno, 0..10, now);
        assert_eq!(reno.cwnd(), 20 * MSS as u64);
        ack_round(&mut reno, 10..30, now);
        assert_eq!(reno.cwnd(), 40 * MSS as u64);
        assert_eq!(reno.send_quota(45 * MSS), 0);
    }

    #[test]
    fn test_reno_congestion_avoidance() {
        let mut reno = NewReno::new();
        let now = Instant::now();
        reno.ssthresh = 30 * MSS as u64;
        ack_round(&mut reno, 0..20, now);
        assert_eq!(reno.cwnd(), 30 * MSS as u64);
        ack_round(&mut reno, 20..50, now);
        assert_eq!(reno.cwnd(), 31 * MSS as u64);
    }

    #[test]
    fn test_reno_congestion_event() {
        let mut reno = NewReno::new();
        let now = Instant::now();
        reno.ssthresh = 20 * MSS as u64;
        ack_round(&mut reno, 0..10, now);
        assert_eq!(reno.cwnd(), 20 * MSS as u64);

        let time_lost = now + Duration::from_millis(100);
        reno.on_packet_lost(Epoch::Data, 11, MSS, now, time_lost);
        assert_eq!(reno.cwnd(), 10 * MSS as u64);
        assert_eq!(reno.ssthresh, 10 * MSS as u64);
        assert_eq!(reno.recovery_start_time, Some(time_lost));

        // losses and acks of packets sent before the recovery are ignored
        reno.on_packet_lost(Epoch::Data, 12, MSS, now, time_lost);
        ack_round(&mut reno, 13..20, now);
        assert_eq!(reno.cwnd(), 10 * MSS as u64);
    }
}
