//! [`EventPublisher`] – bounded, per-subject ordered event queues.
//!
//! The kernel hands every event to [`EventPublisher::publish`] through the
//! [`EventSink`] trait.  Publishing never blocks on subscribers: the event is
//! appended to its subject's queue and the dispatcher is woken.  Queues live
//! in a sharded map, so publishers for unrelated subjects rarely meet on the
//! same lock, and the ready list is an unbounded channel that publishers
//! push to without locking.
//!
//! # Overload
//!
//! Each subject's queue holds at most
//! [`PublisherConfig::subject_queue_capacity`] events.  When a new event
//! arrives at a full queue, the oldest [`EventPriority::Droppable`] event of
//! that subject is evicted.  [`EventPriority::Critical`] events (`Terminated`
//! and state changes into a terminal state) are never evicted; if a full
//! queue holds nothing droppable, a critical newcomer is appended past the
//! bound and a droppable newcomer is discarded instead.
//!
//! # Dispatch
//!
//! [`EventPublisher::run`] drains the queues in batches of up to
//! [`PublisherConfig::dispatch_batch_size`] events, taking subjects
//! round-robin so one busy subject cannot starve the rest, and offers each
//! batch to every registered [`EventSubscriber`].
//!
//! Delivery is at-least-once.  A subscriber that is still
//! [`SubscriberError::Unavailable`] after a few quick retries causes the
//! whole batch to go back to the front of its subjects' queues, ahead of
//! anything published since, and the dispatcher backs off before trying
//! again.  Subscribers that had already accepted the batch see it again.
//! Only [`SubscriberError::Rejected`] and [`SubscriberError::Closed`] give a
//! batch up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use s8r_types::{DomainEvent, EventPriority, EventSink, SubjectId};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, warn};

use crate::subscriber::{EventSubscriber, SubscriberError};

/// Attempts per subscriber per dispatch before the batch is put back.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Pause between those attempts, and the dispatcher's first backoff step.
const RETRY_DELAY: Duration = Duration::from_millis(25);

/// Ceiling for the dispatcher's backoff while a subscriber is unavailable.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherConfig {
    pub subject_queue_capacity: usize,
    pub dispatch_batch_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            subject_queue_capacity: 128,
            dispatch_batch_size: 64,
        }
    }
}

#[derive(Default)]
struct SubjectQueue {
    events: VecDeque<DomainEvent>,
    /// `true` while the subject sits on the ready list.
    scheduled: bool,
}

/// How one subscriber fared with one batch.
enum Delivery {
    Accepted,
    Deferred,
    Discarded,
}

/// Shared publisher.  Wrap it in an [`Arc`] to hand it to the kernel as its
/// [`EventSink`] and to spawn [`EventPublisher::run`].
///
/// # Example
///
/// ```
/// use s8r_middleware::{EventPublisher, PublisherConfig};
/// use s8r_types::{DomainEvent, EventPayload, EventSink, LifecycleState, SubjectId};
///
/// let publisher = EventPublisher::new(PublisherConfig::default());
/// let subject = SubjectId::new();
/// publisher.publish(DomainEvent::new(
///     subject,
///     EventPayload::StateChanged { from: LifecycleState::Conception, to: LifecycleState::Initializing },
/// ));
/// assert_eq!(publisher.pending(), 1);
/// assert_eq!(publisher.drain().len(), 1);
/// ```
pub struct EventPublisher {
    config: PublisherConfig,
    queues: DashMap<SubjectId, SubjectQueue>,
    ready_tx: mpsc::UnboundedSender<SubjectId>,
    /// Only the draining side locks this.
    ready_rx: Mutex<mpsc::UnboundedReceiver<SubjectId>>,
    pending: AtomicUsize,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl EventPublisher {
    pub fn new(config: PublisherConfig) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            config,
            queues: DashMap::new(),
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            pending: AtomicUsize::new(0),
            subscribers: RwLock::new(Vec::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> PublisherConfig {
        self.config
    }

    /// Register a subscriber.  It receives every batch dispatched after this
    /// call.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        debug!(subscriber = subscriber.name(), "subscriber registered");
        self.subscribers.write().push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Events waiting for dispatch across all subjects.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Events evicted or discarded under overload since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Take up to `max` events, servicing subjects round-robin.  Events of
    /// one subject keep their relative order.
    pub fn drain_batch(&self, max: usize) -> Vec<DomainEvent> {
        let mut ready = self.ready_rx.lock();
        let mut batch = Vec::new();
        while batch.len() < max {
            let Ok(subject) = ready.try_recv() else {
                break;
            };
            let emptied = {
                let Some(mut queue) = self.queues.get_mut(&subject) else {
                    continue;
                };
                let take = queue.events.len().min(max - batch.len());
                batch.extend(queue.events.drain(..take));
                if queue.events.is_empty() {
                    queue.scheduled = false;
                    true
                } else {
                    let _ = self.ready_tx.send(subject);
                    false
                }
            };
            if emptied {
                self.queues
                    .remove_if(&subject, |_, q| q.events.is_empty() && !q.scheduled);
            }
        }
        self.pending.fetch_sub(batch.len(), Ordering::AcqRel);
        batch
    }

    /// Take everything pending.
    pub fn drain(&self) -> Vec<DomainEvent> {
        self.drain_batch(usize::MAX)
    }

    /// Dispatch one batch to every subscriber.
    ///
    /// Returns how many events left the queues for good; zero when nothing
    /// was pending or when the batch was put back because a subscriber stayed
    /// unavailable.
    pub async fn dispatch_once(&self) -> usize {
        let batch = self.drain_batch(self.config.dispatch_batch_size.max(1));
        if batch.is_empty() {
            return 0;
        }
        let subscribers = self.subscribers.read().clone();
        let mut deferred = false;
        for subscriber in subscribers {
            match deliver_with_retry(subscriber.as_ref(), &batch).await {
                Delivery::Accepted | Delivery::Discarded => {}
                Delivery::Deferred => deferred = true,
            }
        }
        if deferred {
            self.requeue(batch);
            return 0;
        }
        batch.len()
    }

    /// Dispatch loop.  Runs until `shutdown` flips to `true` (or its sender
    /// is dropped), then flushes whatever it still can.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("event dispatcher started");
        let mut backoff = RETRY_DELAY;
        loop {
            let stalled = loop {
                if self.dispatch_once().await == 0 {
                    break self.pending() > 0;
                }
                backoff = RETRY_DELAY;
            };
            if *shutdown.borrow() {
                break;
            }
            if stalled {
                debug!(pending = self.pending(), ?backoff, "subscriber unavailable; backing off");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        while self.dispatch_once().await > 0 {}
        let undelivered = self.pending();
        if undelivered > 0 {
            warn!(undelivered, "event dispatcher stopped with events still queued");
        }
        debug!("event dispatcher stopped");
    }

    /// Put `batch` back at the front of its subjects' queues, ahead of
    /// anything published since it was drained.
    fn requeue(&self, batch: Vec<DomainEvent>) {
        let count = batch.len();
        for event in batch.into_iter().rev() {
            let subject = event.subject_id;
            let mut queue = self.queues.entry(subject).or_default();
            queue.events.push_front(event);
            if !queue.scheduled {
                queue.scheduled = true;
                let _ = self.ready_tx.send(subject);
            }
        }
        self.pending.fetch_add(count, Ordering::AcqRel);
        debug!(events = count, "batch put back for redelivery");
    }
}

impl EventSink for EventPublisher {
    fn publish(&self, event: DomainEvent) {
        let capacity = self.config.subject_queue_capacity.max(1);
        let subject = event.subject_id;
        {
            let mut queue = self.queues.entry(subject).or_default();

            let mut evicted = false;
            if queue.events.len() >= capacity {
                match queue
                    .events
                    .iter()
                    .position(|e| e.priority() == EventPriority::Droppable)
                {
                    Some(oldest) => {
                        if let Some(old) = queue.events.remove(oldest) {
                            warn!(
                                %subject,
                                kind = ?old.kind(),
                                "subject queue full; evicted oldest droppable event"
                            );
                        }
                        evicted = true;
                    }
                    None if event.priority() == EventPriority::Droppable => {
                        warn!(
                            %subject,
                            kind = ?event.kind(),
                            "subject queue full of critical events; discarding event"
                        );
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    // Critical events are kept even past the bound.
                    None => {}
                }
            }
            queue.events.push_back(event);

            if evicted {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                self.pending.fetch_add(1, Ordering::AcqRel);
            }
            if !queue.scheduled {
                queue.scheduled = true;
                let _ = self.ready_tx.send(subject);
            }
        }
        self.notify.notify_one();
    }
}

/// Offer `batch` to `subscriber`, retrying a few times while it reports
/// itself unavailable.
async fn deliver_with_retry(subscriber: &dyn EventSubscriber, batch: &[DomainEvent]) -> Delivery {
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match subscriber.deliver(batch).await {
            Ok(()) => return Delivery::Accepted,
            Err(SubscriberError::Unavailable(reason)) => {
                debug!(subscriber = subscriber.name(), attempt, %reason, "subscriber unavailable");
                if attempt < MAX_DELIVERY_ATTEMPTS {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
            Err(e) => {
                warn!(
                    subscriber = subscriber.name(),
                    events = batch.len(),
                    error = %e,
                    "batch not delivered"
                );
                return Delivery::Discarded;
            }
        }
    }
    warn!(
        subscriber = subscriber.name(),
        events = batch.len(),
        "subscriber still unavailable; batch will be redelivered"
    );
    Delivery::Deferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::ChannelSubscriber;
    use async_trait::async_trait;
    use s8r_types::{EventKind, EventPayload, LifecycleState};
    use std::sync::atomic::AtomicU32;

    // ------------------------------------------------------------------ helpers

    fn member_added(subject: SubjectId) -> DomainEvent {
        DomainEvent::new(
            subject,
            EventPayload::MemberAdded {
                member: SubjectId::new(),
            },
        )
    }

    fn terminated(subject: SubjectId) -> DomainEvent {
        DomainEvent::new(
            subject,
            EventPayload::Terminated {
                reason: "test".into(),
                partial_failure: false,
            },
        )
    }

    fn publisher(capacity: usize) -> EventPublisher {
        EventPublisher::new(PublisherConfig {
            subject_queue_capacity: capacity,
            dispatch_batch_size: 64,
        })
    }

    /// Fails with `Unavailable` a fixed number of times, then accepts.
    struct Flaky {
        failures_left: AtomicU32,
        delivered: AtomicU32,
        seen: Mutex<Vec<DomainEvent>>,
    }

    impl Flaky {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicU32::new(times),
                delivered: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EventSubscriber for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn deliver(&self, batch: &[DomainEvent]) -> Result<(), SubscriberError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SubscriberError::Unavailable("warming up".into()));
            }
            self.delivered.fetch_add(batch.len() as u32, Ordering::SeqCst);
            self.seen.lock().extend_from_slice(batch);
            Ok(())
        }
    }

    // ------------------------------------------------------------------ queueing

    #[test]
    fn per_subject_order_is_preserved() {
        let p = publisher(16);
        let a = SubjectId::new();
        let b = SubjectId::new();
        let events = [member_added(a), member_added(b), member_added(a), terminated(a)];
        for e in events.iter().cloned() {
            p.publish(e);
        }

        let drained = p.drain();
        let for_a: Vec<_> = drained
            .iter()
            .filter(|e| e.subject_id == a)
            .map(|e| e.event_id)
            .collect();
        assert_eq!(
            for_a,
            vec![events[0].event_id, events[2].event_id, events[3].event_id]
        );
        assert_eq!(p.pending(), 0);
    }

    #[test]
    fn overload_evicts_oldest_droppable_event() {
        let p = publisher(2);
        let s = SubjectId::new();
        let first = member_added(s);
        let second = member_added(s);
        let third = member_added(s);
        p.publish(first.clone());
        p.publish(second.clone());
        p.publish(third.clone());

        let ids: Vec<_> = p.drain().into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![second.event_id, third.event_id]);
        assert_eq!(p.dropped(), 1);
    }

    #[test]
    fn critical_events_are_never_dropped() {
        let p = publisher(2);
        let s = SubjectId::new();
        p.publish(terminated(s));
        p.publish(DomainEvent::new(
            s,
            EventPayload::StateChanged {
                from: LifecycleState::Terminating,
                to: LifecycleState::Terminated,
            },
        ));
        // Queue is full of critical events: a droppable newcomer is discarded,
        // a critical one goes past the bound.
        p.publish(member_added(s));
        p.publish(terminated(s));

        let kinds: Vec<_> = p.drain().iter().map(DomainEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Terminated,
                EventKind::StateChanged,
                EventKind::Terminated
            ]
        );
        assert_eq!(p.dropped(), 1);
    }

    #[test]
    fn batches_are_bounded_and_round_robin() {
        let p = publisher(16);
        let a = SubjectId::new();
        let b = SubjectId::new();
        for _ in 0..3 {
            p.publish(member_added(a));
        }
        p.publish(member_added(b));

        let batch = p.drain_batch(2);
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.subject_id == a));
        let rest = p.drain_batch(10);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].subject_id, b);
    }

    // ------------------------------------------------------------------ dispatch

    #[tokio::test]
    async fn dispatcher_delivers_to_subscribers() -> Result<(), Box<dyn std::error::Error>> {
        let p = Arc::new(publisher(16));
        let (sub, mut rx) = ChannelSubscriber::new("test", 16);
        p.subscribe(Arc::new(sub));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&p).run(shutdown_rx));

        let s = SubjectId::new();
        let event = member_added(s);
        p.publish(event.clone());

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await?
            .ok_or("channel closed")?;
        assert_eq!(received.event_id, event.event_id);

        shutdown_tx.send(true)?;
        handle.await?;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_events() -> Result<(), Box<dyn std::error::Error>> {
        let p = Arc::new(publisher(16));
        let (sub, mut rx) = ChannelSubscriber::new("test", 16);
        p.subscribe(Arc::new(sub));
        p.publish(member_added(SubjectId::new()));

        let (shutdown_tx, shutdown_rx) = watch::channel(true);
        tokio::spawn(Arc::clone(&p).run(shutdown_rx)).await?;
        drop(shutdown_tx);

        assert!(rx.try_recv().is_ok());
        assert_eq!(p.pending(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_subscriber_is_retried() {
        let p = publisher(16);
        let flaky = Flaky::failing(2);
        p.subscribe(flaky.clone());
        p.publish(member_added(SubjectId::new()));

        assert_eq!(p.dispatch_once().await, 1);
        assert_eq!(flaky.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outage_longer_than_retries_keeps_the_batch() {
        let p = publisher(16);
        let flaky = Flaky::failing(MAX_DELIVERY_ATTEMPTS);
        p.subscribe(flaky.clone());
        let s = SubjectId::new();
        p.publish(terminated(s));

        assert_eq!(p.dispatch_once().await, 0);
        assert_eq!(p.pending(), 1);
        assert_eq!(flaky.delivered.load(Ordering::SeqCst), 0);

        assert_eq!(p.dispatch_once().await, 1);
        assert_eq!(p.pending(), 0);
        let seen = flaky.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind(), EventKind::Terminated);
    }

    #[tokio::test]
    async fn redelivered_events_stay_ahead_of_newer_ones() {
        let p = publisher(16);
        let flaky = Flaky::failing(MAX_DELIVERY_ATTEMPTS);
        p.subscribe(flaky.clone());
        let s = SubjectId::new();
        let first = member_added(s);
        let second = terminated(s);
        p.publish(first.clone());
        assert_eq!(p.dispatch_once().await, 0);

        p.publish(second.clone());
        assert_eq!(p.dispatch_once().await, 2);
        let ids: Vec<_> = flaky.seen.lock().iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![first.event_id, second.event_id]);
    }

    #[tokio::test]
    async fn dispatcher_retries_through_an_outage() -> Result<(), Box<dyn std::error::Error>> {
        let p = Arc::new(publisher(16));
        let flaky = Flaky::failing(MAX_DELIVERY_ATTEMPTS * 2);
        p.subscribe(flaky.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&p).run(shutdown_rx));
        p.publish(terminated(SubjectId::new()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while flaky.delivered.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        assert_eq!(p.pending(), 0);

        shutdown_tx.send(true)?;
        handle.await?;
        Ok(())
    }

    #[test]
    fn concurrent_publishers_keep_per_subject_order() {
        let p = publisher(1024);
        let subjects: Vec<SubjectId> = (0..4).map(|_| SubjectId::new()).collect();
        let sent: Vec<Vec<DomainEvent>> = subjects
            .iter()
            .map(|&s| (0..100).map(|_| member_added(s)).collect())
            .collect();

        std::thread::scope(|scope| {
            for events in &sent {
                let p = &p;
                scope.spawn(move || {
                    for e in events {
                        p.publish(e.clone());
                    }
                });
            }
        });

        assert_eq!(p.pending(), 400);
        let drained = p.drain();
        assert_eq!(drained.len(), 400);
        for (subject, events) in subjects.iter().zip(&sent) {
            let got: Vec<_> = drained
                .iter()
                .filter(|e| e.subject_id == *subject)
                .map(|e| e.event_id)
                .collect();
            let want: Vec<_> = events.iter().map(|e| e.event_id).collect();
            assert_eq!(got, want);
        }
    }

    #[tokio::test]
    async fn dispatch_with_nothing_pending_is_a_no_op() {
        let p = publisher(16);
        assert_eq!(p.dispatch_once().await, 0);
    }
}
