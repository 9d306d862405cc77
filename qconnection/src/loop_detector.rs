use std::sync::Weak;

use crate::callback::LoopDetectorCallback;

/// What a write attempt was trying to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum WriteDataReason {
    #[display("no_write")]
    NoWrite,
    #[display("probes")]
    Probes,
    #[display("ack")]
    Ack,
    #[display("crypto")]
    Crypto,
    #[display("stream")]
    Stream,
    #[display("retransmission")]
    Retransmission,
    #[display("control")]
    Control,
    #[display("close")]
    Close,
    #[display("padding")]
    Padding,
}

/// Why a write attempt produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum NoWriteReason {
    #[display("write_ok")]
    WriteOk,
    /// No sub-scheduler had anything to send.
    #[display("empty_scheduler")]
    EmptyScheduler,
    /// Something was pending but no frame fit.
    #[display("no_frame")]
    NoFrame,
    /// Frames were written but the packet was not worth sending.
    #[display("no_body")]
    NoBody,
    #[display("congestion_limited")]
    CongestionLimited,
    /// Stream data is buffered but the peer granted no credit for it.
    #[display("flow_control_blocked")]
    FlowControlBlocked,
    /// Streams are open and the window has room, the application wrote
    /// nothing.
    #[display("app_limited")]
    AppLimited,
    #[display("socket_failure")]
    SocketFailure,
}

/// Why a read attempt produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum NoReadReason {
    #[display("read_ok")]
    ReadOk,
    #[display("truncated")]
    Truncated,
    #[display("empty_data")]
    EmptyData,
    #[display("retriable_error")]
    RetriableError,
    #[display("non_retriable_error")]
    NonRetriableError,
    /// Every packet was a duplicate or could not be decrypted yet.
    #[display("stale_data")]
    StaleData,
}

#[derive(Debug, Clone, Copy)]
struct Streak<R> {
    reason: Option<R>,
    count: u64,
    fired: bool,
}

impl<R> Default for Streak<R> {
    fn default() -> Self {
        Self {
            reason: None,
            count: 0,
            fired: false,
        }
    }
}

impl<R: Copy + PartialEq> Streak<R> {
    /// Count one more failed attempt, returning the count when the streak
    /// reaches `threshold` for the first time.
    fn observe(&mut self, reason: R, threshold: u64) -> Option<u64> {
        if self.reason != Some(reason) {
            *self = Self {
                reason: Some(reason),
                ..Default::default()
            };
        }
        self.count += 1;
        if threshold == 0 || self.fired || self.count < threshold {
            return None;
        }
        self.fired = true;
        Some(self.count)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Spots a driver stuck calling read or write without any progress.
///
/// It only reports: an alert fires once per streak of identical failures
/// reaching the threshold, and the connection carries on.
#[derive(Default)]
pub struct LoopDetector {
    threshold: u64,
    write: Streak<(WriteDataReason, NoWriteReason)>,
    read: Streak<NoReadReason>,
    callback: Option<Weak<dyn LoopDetectorCallback>>,
}

impl std::fmt::Debug for LoopDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopDetector")
            .field("threshold", &self.threshold)
            .field("write", &self.write)
            .field("read", &self.read)
            .finish()
    }
}

impl LoopDetector {
    /// A threshold of 0 disables the detector.
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    pub fn set_callback(&mut self, callback: Option<Weak<dyn LoopDetectorCallback>>) {
        self.callback = callback;
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Record a write attempt. Returns true if it raised an alert.
    pub fn on_write_attempt(
        &mut self,
        data_reason: WriteDataReason,
        no_write_reason: NoWriteReason,
        context: &str,
    ) -> bool {
        if no_write_reason == NoWriteReason::WriteOk {
            self.write.reset();
            return false;
        }
        let Some(count) = self
            .write
            .observe((data_reason, no_write_reason), self.threshold)
        else {
            return false;
        };
        tracing::warn!(target: "quic", count, %data_reason, %no_write_reason, context, "suspicious write loop");
        if let Some(callback) = self.callback.as_ref().and_then(Weak::upgrade) {
            callback.on_suspicious_write_loops(count, data_reason, no_write_reason, context);
        }
        true
    }

    /// Record a read attempt. Returns true if it raised an alert.
    pub fn on_read_attempt(&mut self, no_read_reason: NoReadReason) -> bool {
        if no_read_reason == NoReadReason::ReadOk {
            self.read.reset();
            return false;
        }
        let Some(count) = self.read.observe(no_read_reason, self.threshold) else {
            return false;
        };
        tracing::warn!(target: "quic", count, %no_read_reason, "suspicious read loop");
        if let Some(callback) = self.callback.as_ref().and_then(Weak::upgrade) {
            callback.on_suspicious_read_loops(count, no_read_reason);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct Alerts {
        writes: Mutex<Vec<(u64, WriteDataReason, NoWriteReason, String)>>,
        reads: Mutex<Vec<(u64, NoReadReason)>>,
    }

    impl LoopDetectorCallback for Alerts {
        fn on_suspicious_write_loops(
            &self,
            count: u64,
            data_reason: WriteDataReason,
            no_write_reason: NoWriteReason,
            context: &str,
        ) {
            self.writes
                .lock()
                .unwrap()
                .push((count, data_reason, no_write_reason, context.to_owned()));
        }

        fn on_suspicious_read_loops(&self, count: u64, no_read_reason: NoReadReason) {
            self.reads.lock().unwrap().push((count, no_read_reason));
        }
    }

    fn detector(threshold: u64) -> (LoopDetector, Arc<Alerts>) {
        let alerts = Arc::new(Alerts::default());
        let mut detector = LoopDetector::new(threshold);
        let callback: Arc<dyn LoopDetectorCallback> = alerts.clone();
        detector.set_callback(Some(Arc::downgrade(&callback)));
        (detector, alerts)
    }

    #[test]
    fn test_fires_once_at_threshold() {
        let (mut detector, alerts) = detector(5);
        let fired: Vec<bool> = (0..6)
            .map(|_| {
                detector.on_write_attempt(
                    WriteDataReason::Stream,
                    NoWriteReason::EmptyScheduler,
                    "1rtt",
                )
            })
            .collect();
        assert_eq!(fired, vec![false, false, false, false, true, false]);
        assert_eq!(
            *alerts.writes.lock().unwrap(),
            vec![(
                5,
                WriteDataReason::Stream,
                NoWriteReason::EmptyScheduler,
                "1rtt".to_owned()
            )]
        );
    }

    #[test]
    fn test_success_rearms() {
        let (mut detector, alerts) = detector(2);
        for _ in 0..3 {
            detector.on_write_attempt(WriteDataReason::Ack, NoWriteReason::NoFrame, "");
        }
        detector.on_write_attempt(WriteDataReason::Ack, NoWriteReason::WriteOk, "");
        for _ in 0..2 {
            detector.on_write_attempt(WriteDataReason::Ack, NoWriteReason::NoFrame, "");
        }
        assert_eq!(alerts.writes.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_reason_change_restarts_count() {
        let (mut detector, alerts) = detector(3);
        detector.on_read_attempt(NoReadReason::EmptyData);
        detector.on_read_attempt(NoReadReason::EmptyData);
        detector.on_read_attempt(NoReadReason::StaleData);
        detector.on_read_attempt(NoReadReason::StaleData);
        assert!(alerts.reads.lock().unwrap().is_empty());
        assert!(detector.on_read_attempt(NoReadReason::StaleData));
        assert_eq!(*alerts.reads.lock().unwrap(), vec![(3, NoReadReason::StaleData)]);
    }

    #[test]
    fn test_disabled_and_dropped_callback() {
        let mut disabled = LoopDetector::new(0);
        for _ in 0..100 {
            assert!(!disabled.on_read_attempt(NoReadReason::Truncated));
        }

        let (mut detector, alerts) = detector(1);
        drop(alerts);
        // the alert is still reported to the caller
        assert!(detector.on_read_attempt(NoReadReason::Truncated));
    }
}
