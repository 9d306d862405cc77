//! Instrumentation of a connection: the value records handed to observers
//! and the registry delivering them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod observer;

pub use observer::{ArcObservers, LoggingObserver, Observer, ObserverError};

/// One packet declared lost.
///
/// Reordering and timeout are not exclusive: a packet that is both far
/// behind the largest acknowledged one and old enough is flagged twice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LostPacket {
    pub packet_number: u64,
    pub size: u64,
    pub lost_by_reorder_threshold: bool,
    pub lost_by_timeout: bool,
}

/// The packets found lost by one pass of loss detection.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LossEvent {
    /// The packet number space, `initial`, `handshake` or `application`.
    pub space: String,
    pub largest_acked: Option<u64>,
    pub lost_packets: Vec<LostPacket>,
}

impl LossEvent {
    pub fn lost_bytes(&self) -> u64 {
        self.lost_packets.iter().map(|p| p.size).sum()
    }
}

/// One round trip measurement, taken when the largest acknowledged packet
/// of an ACK frame was newly acknowledged and ack-eliciting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RttSample {
    pub packet_number: u64,
    pub rtt: Duration,
    pub ack_delay: Duration,
    pub smoothed_rtt: Duration,
    pub min_rtt: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_event_json() {
        let event = LossEvent {
            space: "application".to_owned(),
            largest_acked: None,
            lost_packets: vec![LostPacket {
                packet_number: 3,
                size: 1200,
                lost_by_reorder_threshold: true,
                lost_by_timeout: false,
            }],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("largest_acked").is_none());
        assert_eq!(json["lost_packets"][0]["packet_number"], 3);
        assert_eq!(event.lost_bytes(), 1200);
    }
}
