//! The in-process event bus (§4.7 "Event bus").

use crate::event::CacheEvent;
use crate::filter::SubscriptionOptions;
use crate::timestamp::EventClock;
use polycache_core::{BusError, PolycacheResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default interval at which the bus sweeps subscriptions for inactive weak
/// handles (§4.7).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Default inactivity threshold before a weak-ref subscription is dropped.
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(5 * 60);

type SubscriptionId = u64;

/// A handle returned by [`EventBus::subscribe`]. Dropping it does not
/// unsubscribe; call [`EventBus::unsubscribe`] explicitly, or rely on a
/// weak-ref subscription being swept once its anchor is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(SubscriptionId);

/// Per-subscription debounce coalescing state (§4.7): while a timer is in
/// flight, only the latest event is kept; everything older is dropped
/// without ever reaching the subscriber.
struct DebounceState<T> {
    pending: Option<CacheEvent<T>>,
    timer_running: bool,
}

impl<T> Default for DebounceState<T> {
    fn default() -> Self {
        Self { pending: None, timer_running: false }
    }
}

struct Subscription<T> {
    options: SubscriptionOptions<T>,
    sender: mpsc::UnboundedSender<CacheEvent<T>>,
    /// When `use_weak_ref` is set, holds a weak anchor; the subscription is
    /// swept once it no longer upgrades.
    anchor: Option<Weak<()>>,
    last_delivered: Mutex<Instant>,
    debounce: Arc<Mutex<DebounceState<T>>>,
    debounce_timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Subscription<T> {
    /// Abort any in-flight debounce timer, e.g. on unsubscribe or destroy.
    fn cancel_debounce(&self) {
        if let Some(handle) = self.debounce_timer.lock().expect("event bus mutex poisoned").take() {
            handle.abort();
        }
    }
}

struct Inner<T> {
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription<T>>>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
    clock: EventClock,
}

/// A typed, in-process publish/subscribe bus for cache events.
///
/// Cloning an `EventBus` shares the same subscriber table; it is the unit
/// passed around the store layer.
#[derive(Clone)]
pub struct EventBus<T> {
    inner: Arc<Inner<T>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<T> EventBus<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_clock(EventClock::new())
    }

    pub fn with_clock(clock: EventClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
                clock,
            }),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the periodic inactivity sweep (§4.7). Requires a Tokio runtime;
    /// call once per bus instance.
    pub fn spawn_sweeper(&self, interval: Duration, inactivity_threshold: Duration) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if inner.destroyed.load(Ordering::Acquire) {
                    return;
                }
                let now = Instant::now();
                let mut subs = inner.subscriptions.lock().expect("event bus mutex poisoned");
                let before = subs.len();
                subs.retain(|_, sub| {
                    if let Some(anchor) = &sub.anchor {
                        if anchor.upgrade().is_none() {
                            sub.cancel_debounce();
                            return false;
                        }
                    }
                    let last = *sub.last_delivered.lock().expect("event bus mutex poisoned");
                    if now.duration_since(last) < inactivity_threshold {
                        true
                    } else {
                        sub.cancel_debounce();
                        false
                    }
                });
                let swept = before - subs.len();
                if swept > 0 {
                    tracing::debug!(swept, "inactivity sweep removed subscriptions");
                }
            }
        });
        *self.sweeper.lock().expect("event bus mutex poisoned") = Some(handle);
    }

    /// Register a new subscription. Returns a handle so the caller can later
    /// unsubscribe, plus the receiving half of the channel events are
    /// delivered on.
    pub fn subscribe(
        &self,
        options: SubscriptionOptions<T>,
    ) -> PolycacheResult<(SubscriptionHandle, mpsc::UnboundedReceiver<CacheEvent<T>>)> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(BusError::Destroyed.into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let anchor = if options.use_weak_ref {
            Some(Weak::new())
        } else {
            None
        };
        let sub = Subscription {
            options,
            sender: tx,
            anchor,
            last_delivered: Mutex::new(Instant::now()),
            debounce: Arc::new(Mutex::new(DebounceState::default())),
            debounce_timer: Mutex::new(None),
        };
        self.inner
            .subscriptions
            .lock()
            .expect("event bus mutex poisoned")
            .insert(id, sub);
        tracing::debug!(subscription_id = id, "subscribed");
        Ok((SubscriptionHandle(id), rx))
    }

    /// Like [`subscribe`](Self::subscribe) but attaches `anchor` as the
    /// weak-ref liveness check, so the subscription is dropped by the sweep
    /// once `anchor` itself is dropped.
    pub fn subscribe_weak(
        &self,
        options: SubscriptionOptions<T>,
        anchor: &Arc<()>,
    ) -> PolycacheResult<(SubscriptionHandle, mpsc::UnboundedReceiver<CacheEvent<T>>)> {
        let (handle, rx) = self.subscribe(options)?;
        if let Some(sub) = self
            .inner
            .subscriptions
            .lock()
            .expect("event bus mutex poisoned")
            .get_mut(&handle.0)
        {
            sub.anchor = Some(Arc::downgrade(anchor));
        }
        Ok((handle, rx))
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self
            .inner
            .subscriptions
            .lock()
            .expect("event bus mutex poisoned")
            .remove(&handle.0);
        if let Some(sub) = &removed {
            sub.cancel_debounce();
        }
        tracing::debug!(subscription_id = handle.0, "unsubscribed");
        removed.is_some()
    }

    /// Publish an event to every matching, still-live subscriber.
    ///
    /// A no-op once the bus is destroyed (invariant: destroyed buses neither
    /// accept new subscribers nor deliver events). Subscriptions with
    /// `debounce_ms` set don't receive `event` immediately: it becomes the
    /// pending payload of that subscription's timer, which fires (and
    /// delivers only the latest pending event) once `debounce_ms` of quiet
    /// has elapsed since the timer was armed.
    pub fn emit(&self, mut event: CacheEvent<T>) -> PolycacheResult<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }
        event.timestamp = self.inner.clock.next();

        let mut subs = self.inner.subscriptions.lock().expect("event bus mutex poisoned");
        subs.retain(|id, sub| {
            if let Some(anchor) = &sub.anchor {
                if anchor.upgrade().is_none() {
                    sub.cancel_debounce();
                    return false;
                }
            }
            if !sub.options.matches(&event) {
                return true;
            }
            *sub.last_delivered.lock().expect("event bus mutex poisoned") = Instant::now();
            match sub.options.debounce_ms {
                Some(ms) => Self::schedule_debounced(*id, sub, ms, event.clone()),
                None => {
                    if sub.sender.send(event.clone()).is_err() {
                        return false;
                    }
                }
            }
            true
        });
        Ok(())
    }

    /// Arm or refresh a subscription's debounce timer with `event` as the
    /// latest pending payload. A timer already in flight just has its
    /// pending payload replaced; only one timer per subscription ever runs.
    fn schedule_debounced(id: SubscriptionId, sub: &Subscription<T>, ms: u64, event: CacheEvent<T>) {
        let mut state = sub.debounce.lock().expect("event bus mutex poisoned");
        state.pending = Some(event);
        if state.timer_running {
            return;
        }
        state.timer_running = true;
        drop(state);

        let debounce = Arc::clone(&sub.debounce);
        let sender = sub.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let pending = {
                let mut state = debounce.lock().expect("event bus mutex poisoned");
                state.timer_running = false;
                state.pending.take()
            };
            if let Some(event) = pending {
                if sender.send(event).is_err() {
                    tracing::debug!(subscription_id = id, "debounced delivery dropped, receiver gone");
                }
            }
        });
        *sub.debounce_timer.lock().expect("event bus mutex poisoned") = Some(handle);
    }

    /// Tear down the bus permanently: all subscribers are dropped, further
    /// `subscribe` calls fail, and `emit` becomes a no-op.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::Release);
        let mut subs = self.inner.subscriptions.lock().expect("event bus mutex poisoned");
        for sub in subs.values() {
            sub.cancel_debounce();
        }
        subs.clear();
        drop(subs);
        if let Some(handle) = self.sweeper.lock().expect("event bus mutex poisoned").take() {
            handle.abort();
        }
        tracing::debug!("event bus destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.lock().expect("event bus mutex poisoned").len()
    }
}

impl<T> Default for EventBus<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventSource, EventType};
    use chrono::Utc;

    fn event(event_type: EventType) -> CacheEvent<i32> {
        CacheEvent::new(event_type, Utc::now(), EventSource::Cache)
    }

    #[tokio::test]
    async fn subscribers_receive_matching_events() {
        let bus = EventBus::<i32>::new();
        let (_handle, mut rx) = bus.subscribe(SubscriptionOptions::default()).unwrap();
        bus.emit(event(EventType::ItemCreated)).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::ItemCreated);
    }

    #[tokio::test]
    async fn unsubscribed_handles_stop_receiving() {
        let bus = EventBus::<i32>::new();
        let (handle, mut rx) = bus.subscribe(SubscriptionOptions::default()).unwrap();
        assert!(bus.unsubscribe(handle));
        bus.emit(event(EventType::ItemCreated)).unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn destroyed_bus_rejects_subscribe_and_ignores_emit() {
        let bus = EventBus::<i32>::new();
        bus.destroy();
        assert!(bus.subscribe(SubscriptionOptions::default()).is_err());
        assert!(bus.emit(event(EventType::ItemCreated)).is_ok());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_subscription_coalesces_rapid_events_into_one_delivery() {
        let bus = EventBus::<i32>::new();
        let opts = SubscriptionOptions::default().with_debounce_ms(50);
        let (_handle, mut rx) = bus.subscribe(opts).unwrap();

        let mut e1 = event(EventType::ItemUpdated);
        e1.item = Some(1);
        let mut e2 = event(EventType::ItemUpdated);
        e2.item = Some(2);
        let mut e3 = event(EventType::ItemUpdated);
        e3.item = Some(3);

        bus.emit(e1).unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        bus.emit(e2).unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        bus.emit(e3).unwrap();

        assert!(rx.try_recv().is_err(), "debounced event should not be delivered yet");

        tokio::time::advance(Duration::from_millis(60)).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.item, Some(3), "only the latest coalesced event is delivered");
        assert!(rx.try_recv().is_err(), "earlier coalesced events are never delivered");
    }

    #[tokio::test]
    async fn unsubscribe_cancels_a_pending_debounce_timer() {
        let bus = EventBus::<i32>::new();
        let opts = SubscriptionOptions::default().with_debounce_ms(20);
        let (handle, mut rx) = bus.subscribe(opts).unwrap();
        bus.emit(event(EventType::ItemUpdated)).unwrap();
        assert!(bus.unsubscribe(handle));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn weak_ref_subscription_is_swept_once_anchor_drops() {
        let bus = EventBus::<i32>::new();
        let anchor = Arc::new(());
        let opts = SubscriptionOptions::default().with_weak_ref(true);
        let (_handle, _rx) = bus.subscribe_weak(opts, &anchor).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(anchor);
        // `emit` performs the liveness check inline, without waiting for the
        // periodic sweep task.
        bus.emit(event(EventType::ItemCreated)).unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
