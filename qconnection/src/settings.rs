use std::time::Duration;

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use thiserror::Error;

use crate::scheduler::{AckOnlyPolicy, FrameCategory, SchedulingPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transport settings: {0}")]
pub struct InvalidSettings(pub &'static str);

/// The knobs of one connection. There is no transport parameter exchange
/// here, so the peer is assumed to grant the same credits as these.
#[derive(Builder, Getters, CopyGetters, Debug, Clone, PartialEq)]
#[builder(default, setter(into), build_fn(skip))]
pub struct TransportSettings {
    /// Largest datagram this endpoint writes.
    #[getset(get_copy = "pub")]
    max_packet_size: usize,
    /// Datagrams carrying Initial packets are padded up to this size.
    #[getset(get_copy = "pub")]
    min_initial_datagram_size: usize,
    /// The AEAD expansion reserved at the end of every packet.
    #[getset(get_copy = "pub")]
    tag_len: usize,
    /// Packets written per call to `write_datagrams` at most.
    #[getset(get_copy = "pub")]
    max_packets_per_write: usize,
    /// Consecutive attempts without progress before an alert, 0 disables.
    #[getset(get_copy = "pub")]
    loop_detector_threshold: u64,
    #[getset(get_copy = "pub")]
    ack_only_policy: AckOnlyPolicy,
    #[getset(get = "pub")]
    scheduling_order: Vec<FrameCategory>,
    #[getset(get_copy = "pub")]
    initial_max_data: u64,
    #[getset(get_copy = "pub")]
    initial_max_stream_data: u64,
    #[getset(get_copy = "pub")]
    initial_max_streams_bidi: u64,
    #[getset(get_copy = "pub")]
    initial_max_streams_uni: u64,
    #[getset(get_copy = "pub")]
    max_ack_delay: Duration,
    /// Length of the connection ids issued for this connection.
    #[getset(get_copy = "pub")]
    cid_len: usize,
    /// How many issued ids the peer may hold at once.
    #[getset(get_copy = "pub")]
    active_connection_id_limit: u64,
    /// The draining period, in probe timeouts.
    #[getset(get_copy = "pub")]
    drain_pto_multiplier: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_packet_size: 1200,
            min_initial_datagram_size: 1200,
            tag_len: 16,
            max_packets_per_write: 5,
            loop_detector_threshold: 5,
            ack_only_policy: AckOnlyPolicy::Send,
            scheduling_order: FrameCategory::DEFAULT_ORDER.to_vec(),
            initial_max_data: 1 << 20,
            initial_max_stream_data: 1 << 18,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            max_ack_delay: Duration::from_millis(25),
            cid_len: 8,
            active_connection_id_limit: 2,
            drain_pto_multiplier: 3,
        }
    }
}

impl TransportSettings {
    pub fn builder() -> TransportSettingsBuilder {
        TransportSettingsBuilder::default()
    }

    pub fn scheduling_policy(&self) -> SchedulingPolicy {
        SchedulingPolicy::new(self.scheduling_order.iter().copied(), self.ack_only_policy)
    }
}

impl TransportSettingsBuilder {
    pub fn build(&self) -> Result<TransportSettings, InvalidSettings> {
        let default = TransportSettings::default();
        let settings = TransportSettings {
            max_packet_size: self.max_packet_size.unwrap_or(default.max_packet_size),
            min_initial_datagram_size: self
                .min_initial_datagram_size
                .unwrap_or(default.min_initial_datagram_size),
            tag_len: self.tag_len.unwrap_or(default.tag_len),
            max_packets_per_write: self
                .max_packets_per_write
                .unwrap_or(default.max_packets_per_write),
            loop_detector_threshold: self
                .loop_detector_threshold
                .unwrap_or(default.loop_detector_threshold),
            ack_only_policy: self.ack_only_policy.unwrap_or(default.ack_only_policy),
            scheduling_order: self
                .scheduling_order
                .clone()
                .unwrap_or(default.scheduling_order),
            initial_max_data: self.initial_max_data.unwrap_or(default.initial_max_data),
            initial_max_stream_data: self
                .initial_max_stream_data
                .unwrap_or(default.initial_max_stream_data),
            initial_max_streams_bidi: self
                .initial_max_streams_bidi
                .unwrap_or(default.initial_max_streams_bidi),
            initial_max_streams_uni: self
                .initial_max_streams_uni
                .unwrap_or(default.initial_max_streams_uni),
            max_ack_delay: self.max_ack_delay.unwrap_or(default.max_ack_delay),
            cid_len: self.cid_len.unwrap_or(default.cid_len),
            active_connection_id_limit: self
                .active_connection_id_limit
                .unwrap_or(default.active_connection_id_limit),
            drain_pto_multiplier: self
                .drain_pto_multiplier
                .unwrap_or(default.drain_pto_multiplier),
        };
        if settings.max_packet_size < 1200 {
            return Err(InvalidSettings("max_packet_size below 1200"));
        }
        if settings.min_initial_datagram_size > settings.max_packet_size {
            return Err(InvalidSettings(
                "min_initial_datagram_size above max_packet_size",
            ));
        }
        if settings.max_packets_per_write == 0 {
            return Err(InvalidSettings("max_packets_per_write must be positive"));
        }
        if settings.active_connection_id_limit < 2 {
            return Err(InvalidSettings("active_connection_id_limit below 2"));
        }
        if settings.cid_len > qbase::cid::MAX_CID_SIZE {
            return Err(InvalidSettings("cid_len above 20"));
        }
        Ok(settings)
    }
}
