//! Loss detection of [section-6.1](https://www.rfc-editor.org/rfc/rfc9002#section-6.1)
//! of [QUIC-RECOVERY](https://www.rfc-editor.org/rfc/rfc9002).

use std::time::Instant;

use crate::{
    journal::{SentJournal, SentPacket},
    rtt::Rtt,
};

/// Maximum reordering in packets before a packet is deemed lost.
pub const PACKET_THRESHOLD: u64 = 3;

/// A packet declared lost, with what gave it away. Both triggers can hold
/// at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostPacket {
    pub packet: SentPacket,
    pub by_reorder_threshold: bool,
    pub by_timeout: bool,
}

/// The outcome of one loss detection pass over a space.
#[derive(Debug, Default)]
pub struct LossDetection {
    pub lost: Vec<LostPacket>,
    /// When the earliest packet not yet lost would be, if nothing is
    /// acknowledged until then.
    pub loss_time: Option<Instant>,
}

/// Remove and return the packets of `journal` now considered lost.
///
/// Only packets sent before the largest acknowledged one are candidates; a
/// packet is lost once [`PACKET_THRESHOLD`] later packets were acknowledged
/// or once it is older than the loss delay.
pub fn detect_lost(journal: &mut SentJournal, rtt: &Rtt, now: Instant) -> LossDetection {
    let Some(largest_acked) = journal.largest_acked() else {
        return LossDetection::default();
    };
    let loss_delay = rtt.loss_delay();
    let lost_send_time = now.checked_sub(loss_delay);

    let mut verdicts = Vec::new();
    let mut loss_time: Option<Instant> = None;
    for packet in journal.iter_up_to(largest_acked) {
        let by_timeout = lost_send_time.is_some_and(|deadline| packet.time_sent <= deadline);
        let by_reorder_threshold = largest_acked >= packet.pn + PACKET_THRESHOLD;
        if by_timeout || by_reorder_threshold {
            verdicts.push((packet.pn, by_reorder_threshold, by_timeout));
        } else {
            let when = packet.time_sent + loss_delay;
            loss_time = Some(loss_time.map_or(when, |t| t.min(when)));
        }
    }

    let pns: Vec<u64> = verdicts.iter().map(|&(pn, ..)| pn).collect();
    let lost = journal
        .remove_packets(&pns)
        .into_iter()
        .zip(verdicts)
        .map(|(packet, (_, by_reorder_threshold, by_timeout))| LostPacket {
            packet,
            by_reorder_threshold,
            by_timeout,
        })
        .collect();
    LossDetection { lost, loss_time }
}
