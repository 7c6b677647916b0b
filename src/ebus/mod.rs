//! Typed publish/subscribe event bus.
//!
//! The event set is fixed at build time (`event.rs`): `Event` is a single
//! closed enum covering every internal event kind. `Arc<Event>` gives every
//! subscriber shared, reference-counted access to the same payload without
//! a manual retain/release vtable — Rust's `Arc` already gives
//! refcount-drops-to-zero-runs-destructor-once for free.

mod event;

pub use event::{Event, EventKind};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{MdvError, MdvResult};

pub type HandlerId = u64;

type HandlerFn = Arc<dyn Fn(Arc<Event>) -> MdvResult<()> + Send + Sync + 'static>;

struct Subscription {
    id: HandlerId,
    handler: HandlerFn,
}

type SubscriberTable = Arc<Mutex<HashMap<u32, Vec<Subscription>>>>;

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct EbusConfig {
    pub queues_count: usize,
}

impl Default for EbusConfig {
    fn default() -> Self {
        EbusConfig { queues_count: 4 }
    }
}

/// Flags accepted by [`Ebus::publish`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishFlags {
    pub unique: bool,
}

struct Queue {
    tx: mpsc::UnboundedSender<Arc<Event>>,
    worker: JoinHandle<()>,
    /// Identities of events currently enqueued on this worker's channel,
    /// for `UNIQUE` coalescing. Cleared once the worker dequeues the event.
    pending_identities: Arc<Mutex<std::collections::HashSet<(u32, u64)>>>,
}

fn run_handlers(subscribers: &SubscriberTable, event: &Arc<Event>) -> MdvResult<()> {
    let handlers: Vec<HandlerFn> = {
        let subs = subscribers.lock();
        subs.get(&event.discriminant())
            .map(|v| v.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default()
    };
    let mut first_err = None;
    for handler in handlers {
        if let Err(e) = handler(event.clone()) {
            tracing::warn!(error = %e, kind = ?event.discriminant(), "event handler failed");
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The event bus. Subscribe handlers run either synchronously on the
/// publisher's thread ([`Ebus::publish_sync`]) or on one of `queues_count`
/// worker tasks ([`Ebus::publish`]), selected by `event type modulo
/// queues_count`.
pub struct Ebus {
    subscribers: SubscriberTable,
    next_handler_id: std::sync::atomic::AtomicU64,
    queues: Vec<Queue>,
    stopped: std::sync::atomic::AtomicBool,
}

impl Ebus {
    pub fn new(config: EbusConfig) -> Arc<Self> {
        let subscribers: SubscriberTable = Arc::new(Mutex::new(HashMap::new()));
        let mut queues = Vec::with_capacity(config.queues_count.max(1));
        for _ in 0..config.queues_count.max(1) {
            let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Event>>();
            let pending: Arc<Mutex<std::collections::HashSet<(u32, u64)>>> =
                Arc::new(Mutex::new(std::collections::HashSet::new()));
            let pending_for_worker = pending.clone();
            let subs_for_worker = subscribers.clone();
            let worker = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let key = (event.discriminant(), event.identity());
                    pending_for_worker.lock().remove(&key);
                    let _ = run_handlers(&subs_for_worker, &event);
                }
            });
            queues.push(Queue { tx, worker, pending_identities: pending });
        }
        Arc::new(Ebus {
            subscribers,
            next_handler_id: std::sync::atomic::AtomicU64::new(1),
            queues,
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Register a handler for `kind`. Returns an id usable with
    /// [`Ebus::unsubscribe`].
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(Arc<Event>) -> MdvResult<()> + Send + Sync + 'static,
    {
        let id = self.next_handler_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(kind as u32)
            .or_default()
            .push(Subscription { id, handler: Arc::new(handler) });
        id
    }

    /// Register several handlers atomically.
    pub fn subscribe_all<F>(&self, kinds: &[EventKind], handler: F) -> Vec<HandlerId>
    where
        F: Fn(Arc<Event>) -> MdvResult<()> + Send + Sync + Clone + 'static,
    {
        kinds.iter().map(|k| self.subscribe(*k, handler.clone())).collect()
    }

    /// Remove a previously registered handler. Because dispatch only ever
    /// clones handler `Arc`s out of the table while the table lock is held,
    /// any invocation already in flight finished reading the table before
    /// this call can acquire the lock — so a handler's captured state stays
    /// valid for the duration of any call that started before
    /// `unsubscribe` returns.
    pub fn unsubscribe(&self, kind: EventKind, id: HandlerId) {
        if let Some(v) = self.subscribers.lock().get_mut(&(kind as u32)) {
            v.retain(|s| s.id != id);
        }
    }

    /// Run every subscribed handler on the caller's thread, in subscription
    /// order. Returns the first non-OK result; all handlers still run.
    pub fn publish_sync(&self, event: Event) -> MdvResult<()> {
        run_handlers(&self.subscribers, &Arc::new(event))
    }

    /// Enqueue `event` onto `event type modulo queues_count` for
    /// asynchronous dispatch. With `flags.unique` set, a duplicate
    /// `(type, identity)` pair already enqueued on that same queue returns
    /// [`MdvError::EExist`] instead of enqueuing again.
    pub fn publish(&self, event: Event, flags: PublishFlags) -> MdvResult<()> {
        if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
            return Err(MdvError::Closed);
        }
        let queue_idx = (event.discriminant() as usize) % self.queues.len();
        let queue = &self.queues[queue_idx];

        if flags.unique {
            let key = (event.discriminant(), event.identity());
            let mut pending = queue.pending_identities.lock();
            if pending.contains(&key) {
                return Err(MdvError::EExist);
            }
            pending.insert(key);
        }

        queue.tx.send(Arc::new(event)).map_err(|_| MdvError::NoMem)
    }

    /// Stop accepting new publishes. Handlers already dispatched to a
    /// worker run to completion; workers are aborted on drop.
    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::Release);
    }
}

impl Drop for Ebus {
    fn drop(&mut self) {
        for q in &self.queues {
            q.worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn sync_publish_calls_all_subscribers_in_order() {
        let bus = Ebus::new(EbusConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3u32 {
            let order = order.clone();
            bus.subscribe(EventKind::LinkCheck, move |_| {
                order.lock().push(i);
                Ok(())
            });
        }
        bus.publish_sync(Event::LinkCheck {
            src: crate::ids::NodeId::generate(),
            dst: crate::ids::NodeId::generate(),
            connected: false,
        })
        .unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_others() {
        let bus = Ebus::new(EbusConfig::default());
        let ran = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::LinkCheck, |_| Err(MdvError::Failed("boom".into())));
        let ran2 = ran.clone();
        bus.subscribe(EventKind::LinkCheck, move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let res = bus.publish_sync(Event::LinkCheck {
            src: crate::ids::NodeId::generate(),
            dst: crate::ids::NodeId::generate(),
            connected: false,
        });
        assert!(res.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_publish_is_delivered() {
        let bus = Ebus::new(EbusConfig { queues_count: 2 });
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::TopologyChanged, move |_| {
            let _ = tx.send(());
            Ok(())
        });
        bus.publish(
            Event::TopologyChanged { topology: Arc::new(crate::topology::Topology::empty()) },
            PublishFlags::default(),
        )
        .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("handler should have run")
            .unwrap();
    }

    #[tokio::test]
    async fn unique_flag_coalesces_pending_duplicates() {
        let bus = Ebus::new(EbusConfig { queues_count: 1 });
        let ev = || Event::LinkCheck {
            src: crate::ids::NodeId(uuid::Uuid::nil()),
            dst: crate::ids::NodeId(uuid::Uuid::nil()),
            connected: false,
        };
        // No subscriber drains the queue, so the first publish stays pending.
        bus.publish(ev(), PublishFlags { unique: true }).unwrap();
        let second = bus.publish(ev(), PublishFlags { unique: true });
        assert_eq!(second, Err(MdvError::EExist));
    }
}
