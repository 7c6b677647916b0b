//! Per-channel framing, request/response correlation, handler dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{MdvError, MdvResult};

use super::frame::{Frame, NO_RESPONSE};

pub type HandlerFn = Arc<dyn Fn(Arc<Dispatcher>, u16, Bytes) + Send + Sync>;

/// Owns outbound framing and inbound correlation for one channel. A
/// dispatcher never touches the socket directly — `outbound` is the sending
/// half of the channel's write task, fed by [`Dispatcher::post`],
/// [`Dispatcher::send`], and [`Dispatcher::reply`]; `feed` is how the
/// channel's read loop hands the dispatcher a decoded frame.
pub struct Dispatcher {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u16, oneshot::Sender<Bytes>>>,
    handlers: Mutex<HashMap<u16, HandlerFn>>,
    next_request_number: AtomicU16,
    closed: std::sync::atomic::AtomicBool,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Dispatcher {
    pub fn new(outbound: mpsc::UnboundedSender<Frame>) -> Arc<Self> {
        Arc::new(Dispatcher {
            outbound,
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            next_request_number: AtomicU16::new(1),
            closed: std::sync::atomic::AtomicBool::new(false),
            on_close: Mutex::new(None),
        })
    }

    /// Registers a callback run exactly once, the first time [`Dispatcher::close`]
    /// runs — whether that's the channel's read loop hitting EOF/an error, or
    /// the owning [`super::channel::Channel`] being dropped/closed explicitly.
    /// Lets a caller (the node wiring a peer channel) learn about a
    /// disconnect from whichever side notices it first.
    pub fn set_on_close(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_close.lock() = Some(Box::new(f));
    }

    /// One handler per `message_id` per channel.
    pub fn register(&self, message_id: u16, handler: HandlerFn) {
        self.handlers.lock().insert(message_id, handler);
    }

    /// Send with `request_number = 0`; no response expected.
    pub fn post(&self, message_id: u16, payload: Bytes) -> MdvResult<()> {
        self.write(Frame { message_id, request_number: NO_RESPONSE, payload })
    }

    /// Answer a previously received request, carrying its `request_number`.
    pub fn reply(&self, request_number: u16, message_id: u16, payload: Bytes) -> MdvResult<()> {
        self.write(Frame { message_id, request_number, payload })
    }

    /// Allocate a request number, send, and block until either a matching
    /// response arrives or `timeout` elapses.
    pub async fn send(&self, message_id: u16, payload: Bytes, timeout: std::time::Duration) -> MdvResult<Bytes> {
        let request_number = self.allocate_request_number();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_number, tx);

        if let Err(e) = self.write(Frame { message_id, request_number, payload }) {
            self.pending.lock().remove(&request_number);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(MdvError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_number);
                Err(MdvError::ETimedOut)
            }
        }
    }

    fn allocate_request_number(&self) -> u16 {
        loop {
            let n = self.next_request_number.fetch_add(1, Ordering::Relaxed);
            if n != NO_RESPONSE {
                return n;
            }
        }
    }

    fn write(&self, frame: Frame) -> MdvResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MdvError::Closed);
        }
        self.outbound.send(frame).map_err(|_| MdvError::Closed)
    }

    /// Feed a decoded inbound frame: complete a pending `send` if its
    /// `request_number` matches, otherwise invoke the registered handler for
    /// its `message_id`.
    pub fn feed(self: &Arc<Self>, frame: Frame) {
        if frame.request_number != NO_RESPONSE {
            if let Some(tx) = self.pending.lock().remove(&frame.request_number) {
                let _ = tx.send(frame.payload);
                return;
            }
        }
        let handler = self.handlers.lock().get(&frame.message_id).cloned();
        match handler {
            Some(h) => h(self.clone(), frame.request_number, frame.payload),
            None => tracing::warn!(message_id = frame.message_id, "no handler registered"),
        }
    }

    /// Fail every outstanding `send` with `closed`, then run the `on_close`
    /// callback if one is registered and hasn't fired yet.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for (_, tx) in self.pending.lock().drain() {
            drop(tx);
        }
        if let Some(f) = self.on_close.lock().take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_has_no_pending_slot() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx);
        dispatcher.post(1, Bytes::from_static(b"x")).unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.request_number, NO_RESPONSE);
    }

    #[tokio::test]
    async fn send_completes_on_matching_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx);
        let d2 = dispatcher.clone();
        let handle = tokio::spawn(async move { d2.send(1, Bytes::from_static(b"req"), std::time::Duration::from_secs(1)).await });

        let sent = rx.recv().await.unwrap();
        dispatcher.feed(Frame { message_id: 2, request_number: sent.request_number, payload: Bytes::from_static(b"resp") });

        let result = handle.await.unwrap().unwrap();
        assert_eq!(&result[..], b"resp");
    }

    #[tokio::test]
    async fn send_times_out_without_reply() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx);
        let result = dispatcher.send(1, Bytes::from_static(b"x"), std::time::Duration::from_millis(20)).await;
        assert_eq!(result, Err(MdvError::ETimedOut));
    }

    #[tokio::test]
    async fn close_fails_pending_sends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx);
        let d2 = dispatcher.clone();
        let handle = tokio::spawn(async move { d2.send(1, Bytes::from_static(b"req"), std::time::Duration::from_secs(5)).await });
        rx.recv().await.unwrap();
        dispatcher.close();
        assert_eq!(handle.await.unwrap(), Err(MdvError::Closed));
    }

    #[test]
    fn on_close_fires_exactly_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx);
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = calls.clone();
        dispatcher.set_on_close(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        dispatcher.close();
        dispatcher.close();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unsolicited_frame_calls_registered_handler() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx);
        let (got_tx, got_rx) = oneshot::channel();
        let got_tx = Mutex::new(Some(got_tx));
        dispatcher.register(
            5,
            Arc::new(move |_d, _rn, payload| {
                if let Some(tx) = got_tx.lock().take() {
                    let _ = tx.send(payload);
                }
            }),
        );
        dispatcher.feed(Frame { message_id: 5, request_number: NO_RESPONSE, payload: Bytes::from_static(b"hi") });
        assert_eq!(&got_rx.await.unwrap()[..], b"hi");
    }
}
