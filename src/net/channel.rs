//! A typed, established connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedRead};

use crate::ids::NodeId;

use super::dispatcher::Dispatcher;
use super::frame::{Frame, FrameCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    User = 0,
    Peer = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A connected socket past handshake, wrapping a [`Dispatcher`]. Held behind
/// `Arc`; dropping the last owner runs [`Channel`]'s `Drop`, which closes the
/// dispatcher exactly once.
pub struct Channel {
    pub id: u64,
    pub direction: Direction,
    pub channel_type: ChannelType,
    pub peer: Option<NodeId>,
    /// The remote's advertised listen address, learned from its
    /// `p2p_hello` during the handshake. `None` for user channels, which
    /// never exchange one.
    pub remote_listen: Option<SocketAddr>,
    pub dispatcher: Arc<Dispatcher>,
    write_task: tokio::task::JoinHandle<()>,
}

impl Channel {
    /// Spawns the write task draining the dispatcher's outbound queue into
    /// `sink`. The caller separately drives [`read_loop`] on the other half
    /// of the split stream.
    fn new<S>(sink: S, direction: Direction, channel_type: ChannelType, peer: Option<NodeId>, remote_listen: Option<SocketAddr>) -> Arc<Self>
    where
        S: futures::Sink<Frame, Error = crate::error::MdvError> + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let dispatcher = Dispatcher::new(outbound_tx);
        let write_task = tokio::spawn(write_loop(sink, outbound_rx));

        Arc::new(Channel {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            channel_type,
            peer,
            remote_listen,
            dispatcher,
            write_task,
        })
    }

    pub fn close(&self) {
        self.dispatcher.close();
        self.write_task.abort();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Frame>)
where
    S: futures::Sink<Frame, Error = crate::error::MdvError> + Send + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if sink.send(frame).await.is_err() {
            break;
        }
    }
}

/// Drains complete frames from `stream` and feeds them to `dispatcher` until
/// the socket closes or errors.
pub async fn read_loop<S>(stream: S, dispatcher: Arc<Dispatcher>, max_payload: u32)
where
    S: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(stream, FrameCodec { max_payload });
    while let Some(result) = framed.next().await {
        match result {
            Ok(frame) => dispatcher.feed(frame),
            Err(e) => {
                tracing::debug!(error = %e, "channel read error, closing");
                break;
            }
        }
    }
    dispatcher.close();
}

/// Builds a `Channel` from a fresh `TcpStream`, returning the channel and
/// the future driving its read loop (the caller spawns it).
pub fn from_tcp_stream(
    stream: tokio::net::TcpStream,
    direction: Direction,
    channel_type: ChannelType,
    peer: Option<NodeId>,
    remote_listen: Option<SocketAddr>,
    max_payload: u32,
) -> (Arc<Channel>, impl std::future::Future<Output = ()>) {
    let (read_half, write_half) = stream.into_split();
    let sink = Framed::new(write_half, FrameCodec { max_payload });
    let channel = Channel::new(sink, direction, channel_type, peer, remote_listen);
    let dispatcher = channel.dispatcher.clone();
    let fut = read_loop(read_half, dispatcher, max_payload);
    (channel, fut)
}

/// Encode a payload with `bincode` and `post` it, the common case for
/// fire-and-forget peer messages.
pub fn post_encoded<T: serde::Serialize>(dispatcher: &Dispatcher, message_id: u16, value: &T) -> crate::error::MdvResult<()> {
    let bytes = bincode::serialize(value)?;
    dispatcher.post(message_id, Bytes::from(bytes))
}
