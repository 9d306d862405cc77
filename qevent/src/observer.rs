use std::sync::{Arc, Mutex, MutexGuard};

use qbase::error::QuicError;
use thiserror::Error;

use crate::{LossEvent, RttSample};

/// A passive watcher of one connection. Every notification has an empty
/// default so that observers implement only what they care about.
///
/// Notifications are synchronous; an observer must not drive the
/// connection from inside one, but it may detach itself.
pub trait Observer: Send + Sync {
    /// Acknowledges that the observer was attached.
    fn observer_attach(&self) {}

    /// Acknowledges that the observer was detached before destruction.
    fn observer_detach(&self) {}

    /// The connection is being destroyed. Delivered exactly once to every
    /// observer still attached at that moment.
    fn destroy(&self) {}

    /// The connection started closing, with the error if any.
    fn close(&self, _error: Option<&QuicError>) {}

    fn app_rate_limited(&self) {}

    fn packet_loss_detected(&self, _event: &LossEvent) {}

    fn rtt_sample_generated(&self, _sample: &RttSample) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ObserverError {
    #[error("connection already destroyed")]
    Destroyed,
}

#[derive(Default)]
struct Observers {
    list: Vec<Arc<dyn Observer>>,
    destroyed: bool,
}

impl Observers {
    fn position(&self, observer: &Arc<dyn Observer>) -> Option<usize> {
        self.list.iter().position(|o| Arc::ptr_eq(o, observer))
    }
}

/// The observers attached to one connection.
///
/// Cloning shares the registry, which is how an observer keeps a handle to
/// detach itself from inside a notification: notifications iterate over a
/// snapshot taken without holding the lock, and skip observers detached in
/// the meantime.
#[derive(Clone, Default)]
pub struct ArcObservers(Arc<Mutex<Observers>>);

impl std::fmt::Debug for ArcObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.lock_guard();
        f.debug_struct("ArcObservers")
            .field("attached", &guard.list.len())
            .field("destroyed", &guard.destroyed)
            .finish()
    }
}

impl ArcObservers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_guard(&self) -> MutexGuard<'_, Observers> {
        self.0.lock().unwrap()
    }

    /// Attach `observer`. Attaching an observer twice is a no-op returning
    /// `Ok(false)`.
    pub fn attach(&self, observer: Arc<dyn Observer>) -> Result<bool, ObserverError> {
        {
            let mut guard = self.lock_guard();
            if guard.destroyed {
                return Err(ObserverError::Destroyed);
            }
            if guard.position(&observer).is_some() {
                return Ok(false);
            }
            guard.list.push(observer.clone());
        }
        observer.observer_attach();
        Ok(true)
    }

    /// Detach `observer`, returning false if it was not attached.
    pub fn detach(&self, observer: &Arc<dyn Observer>) -> bool {
        let removed = {
            let mut guard = self.lock_guard();
            guard.position(observer).map(|idx| guard.list.remove(idx))
        };
        match removed {
            Some(observer) => {
                observer.observer_detach();
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self, observer: &Arc<dyn Observer>) -> bool {
        self.lock_guard().position(observer).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock_guard().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock_guard().destroyed
    }

    fn notify(&self, f: impl Fn(&dyn Observer)) {
        let snapshot = self.lock_guard().list.clone();
        for observer in snapshot {
            if self.is_attached(&observer) {
                f(observer.as_ref());
            }
        }
    }

    pub fn on_close(&self, error: Option<&QuicError>) {
        self.notify(|o| o.close(error));
    }

    pub fn on_app_rate_limited(&self) {
        self.notify(|o| o.app_rate_limited());
    }

    pub fn on_packet_loss_detected(&self, event: &LossEvent) {
        self.notify(|o| o.packet_loss_detected(event));
    }

    pub fn on_rtt_sample_generated(&self, sample: &RttSample) {
        self.notify(|o| o.rtt_sample_generated(sample));
    }

    /// Deliver `destroy` to every attached observer and empty the registry.
    /// Later calls, and later attachments, are refused.
    pub fn destroy(&self) -> usize {
        let observers = {
            let mut guard = self.lock_guard();
            if guard.destroyed {
                return 0;
            }
            guard.destroyed = true;
            std::mem::take(&mut guard.list)
        };
        for observer in &observers {
            observer.destroy();
        }
        observers.len()
    }
}

/// Writes every notification to the `quic::observer` tracing target, loss
/// and RTT records as JSON.
#[derive(Debug, Default)]
pub struct LoggingObserver {
    name: String,
}

impl LoggingObserver {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Observer for LoggingObserver {
    fn observer_attach(&self) {
        tracing::debug!(target: "quic::observer", name = %self.name, "attached");
    }

    fn observer_detach(&self) {
        tracing::debug!(target: "quic::observer", name = %self.name, "detached");
    }

    fn destroy(&self) {
        tracing::debug!(target: "quic::observer", name = %self.name, "connection destroyed");
    }

    fn close(&self, error: Option<&QuicError>) {
        match error {
            Some(error) => tracing::info!(target: "quic::observer", name = %self.name, %error, "connection closing"),
            None => tracing::info!(target: "quic::observer", name = %self.name, "connection closing"),
        }
    }

    fn app_rate_limited(&self) {
        tracing::trace!(target: "quic::observer", name = %self.name, "app rate limited");
    }

    fn packet_loss_detected(&self, event: &LossEvent) {
        match serde_json::to_string(event) {
            Ok(json) => tracing::debug!(target: "quic::observer", name = %self.name, loss = %json),
            Err(error) => tracing::warn!(target: "quic::observer", %error, "unserializable loss event"),
        }
    }

    fn rtt_sample_generated(&self, sample: &RttSample) {
        match serde_json::to_string(sample) {
            Ok(json) => tracing::trace!(target: "quic::observer", name = %self.name, rtt = %json),
            Err(error) => tracing::warn!(target: "quic::observer", %error, "unserializable rtt sample"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{OnceLock, Weak},
        time::Duration,
    };

    use super::*;
    use crate::LostPacket;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Observer for Recorder {
        fn observer_attach(&self) {
            self.record("attach");
        }

        fn observer_detach(&self) {
            self.record("detach");
        }

        fn destroy(&self) {
            self.record("destroy");
        }

        fn close(&self, _: Option<&QuicError>) {
            self.record("close");
        }

        fn app_rate_limited(&self) {
            self.record("app_rate_limited");
        }

        fn packet_loss_detected(&self, _: &LossEvent) {
            self.record("loss");
        }

        fn rtt_sample_generated(&self, _: &RttSample) {
            self.record("rtt");
        }
    }

    /// Detaches itself on the first loss notification.
    struct SelfDetaching {
        registry: ArcObservers,
        me: OnceLock<Weak<dyn Observer>>,
        losses: Mutex<usize>,
    }

    impl Observer for SelfDetaching {
        fn packet_loss_detected(&self, _: &LossEvent) {
            *self.losses.lock().unwrap() += 1;
            if let Some(me) = self.me.get().and_then(Weak::upgrade) {
                assert!(self.registry.detach(&me));
            }
        }
    }

    fn loss_event() -> LossEvent {
        LossEvent {
            space: "application".to_owned(),
            largest_acked: Some(10),
            lost_packets: vec![LostPacket {
                packet_number: 1,
                size: 100,
                lost_by_reorder_threshold: true,
                lost_by_timeout: false,
            }],
        }
    }

    #[test]
    fn test_attach_is_idempotent() {
        let registry = ArcObservers::new();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn Observer> = recorder.clone();
        assert_eq!(registry.attach(observer.clone()), Ok(true));
        assert_eq!(registry.attach(observer.clone()), Ok(false));
        assert_eq!(registry.len(), 1);

        registry.on_app_rate_limited();
        assert!(registry.detach(&observer));
        assert!(!registry.detach(&observer));
        registry.on_app_rate_limited();
        assert_eq!(recorder.calls(), vec!["attach", "app_rate_limited", "detach"]);
    }

    #[test]
    fn test_destroy_exactly_once() {
        let registry = ArcObservers::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        registry.attach(first.clone()).unwrap();
        registry.attach(second.clone()).unwrap();

        registry.on_close(None);
        assert_eq!(registry.destroy(), 2);
        assert_eq!(registry.destroy(), 0);
        assert!(registry.is_empty());
        assert_eq!(first.calls(), vec!["attach", "close", "destroy"]);
        assert_eq!(second.calls(), vec!["attach", "close", "destroy"]);

        let late: Arc<dyn Observer> = Arc::new(Recorder::default());
        assert_eq!(registry.attach(late), Err(ObserverError::Destroyed));
    }

    #[test]
    fn test_detached_observer_misses_destroy() {
        let registry = ArcObservers::new();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn Observer> = recorder.clone();
        registry.attach(observer.clone()).unwrap();
        registry.detach(&observer);
        registry.destroy();
        assert_eq!(recorder.calls(), vec!["attach", "detach"]);
    }

    #[test]
    fn test_detach_from_within_callback() {
        let registry = ArcObservers::new();
        let detaching = Arc::new(SelfDetaching {
            registry: registry.clone(),
            me: OnceLock::new(),
            losses: Mutex::new(0),
        });
        let observer: Arc<dyn Observer> = detaching.clone();
        let _ = detaching.me.set(Arc::downgrade(&observer));
        let recorder = Arc::new(Recorder::default());

        registry.attach(observer).unwrap();
        registry.attach(recorder.clone()).unwrap();

        registry.on_packet_loss_detected(&loss_event());
        registry.on_packet_loss_detected(&loss_event());
        assert_eq!(*detaching.losses.lock().unwrap(), 1);
        assert_eq!(recorder.calls(), vec!["attach", "loss", "loss"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_logging_observer() {
        let registry = ArcObservers::new();
        registry
            .attach(Arc::new(LoggingObserver::new("test")))
            .unwrap();
        registry.on_packet_loss_detected(&loss_event());
        registry.on_rtt_sample_generated(&RttSample {
            packet_number: 3,
            rtt: Duration::from_millis(20),
            ack_delay: Duration::ZERO,
            smoothed_rtt: Duration::from_millis(20),
            min_rtt: Duration::from_millis(20),
        });
        assert_eq!(registry.destroy(), 1);
    }
}
