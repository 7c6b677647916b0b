//! Channel manager: listeners, dialers, and the accept/dial/retry lifecycle,
//! realized on the Tokio runtime in place of an epoll-driven
//! ACCEPT/DIALER/SELECTOR/PEER/TIMER task set — a fresh `tokio::spawn`ed
//! task plays each of those roles, and the runtime's own readiness-driven
//! wakeups replace the re-arm cycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionSection;
use crate::ids::NodeId;

use super::channel::{from_tcp_stream, Channel, ChannelType, Direction};
use super::dialer::{DialerKey, DialerState};
use super::handshake::{read_handshake, read_peer_hello, write_handshake, write_peer_hello};

pub type OnChannel = Arc<dyn Fn(Arc<Channel>) + Send + Sync>;

/// Binds/dials sockets, performs the handshake, and hands fully-established
/// channels to `on_channel`. What happens to a channel after that
/// (registering it with a dispatcher table, wiring it to the tracker) is
/// the caller's job.
pub struct ChanMan {
    config: ConnectionSection,
    self_uuid: NodeId,
    self_listen: SocketAddr,
    max_payload: u32,
    dialers: Mutex<HashMap<DialerKey, DialerState>>,
    cancel: CancellationToken,
    on_channel: OnChannel,
}

impl ChanMan {
    pub fn create(
        config: ConnectionSection,
        self_uuid: NodeId,
        self_listen: SocketAddr,
        max_payload: u32,
        cancel: CancellationToken,
        on_channel: OnChannel,
    ) -> Arc<Self> {
        let chaman = Arc::new(ChanMan {
            config,
            self_uuid,
            self_listen,
            max_payload,
            dialers: Mutex::new(HashMap::new()),
            cancel,
            on_channel,
        });
        chaman.clone().spawn_retry_timer();
        chaman
    }

    /// Binds `addr`, applies keepalive/`SO_REUSEADDR`, and installs the
    /// accept loop.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> crate::error::MdvResult<SocketAddr> {
        let listener = bind_listener(addr, &self.config)?;
        let bound = listener.local_addr()?;
        tracing::info!(%bound, "listening");

        let this = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("accept loop cancelled");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                let this = this.clone();
                                tokio::spawn(async move { this.accept_one(stream, peer_addr).await; });
                            }
                            Err(e) => tracing::warn!(error = %e, "accept failed"),
                        }
                    }
                }
            }
        });

        Ok(bound)
    }

    async fn accept_one(self: &Arc<Self>, mut stream: TcpStream, peer_addr: SocketAddr) {
        apply_keepalive(&stream, &self.config);
        let (channel_type, remote_uuid, remote_listen) = match read_handshake(&mut stream).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(%peer_addr, error = %e, "handshake failed");
                return;
            }
        };

        if channel_type == ChannelType::Peer {
            if let Err(e) = write_peer_hello(&mut stream, self.self_uuid, self.self_listen).await {
                tracing::debug!(%peer_addr, error = %e, "peer hello reply failed");
                return;
            }
        }

        let (channel, read_fut) = from_tcp_stream(stream, Direction::In, channel_type, remote_uuid, remote_listen, self.max_payload);
        tokio::spawn(read_fut);
        (self.on_channel)(channel);
    }

    /// Registers a dialer entry for `(address, channel_type)` if none
    /// exists yet, then attempts an immediate connect. A dialer already
    /// present succeeds as a no-op.
    pub fn dial(self: &Arc<Self>, address: SocketAddr, channel_type: ChannelType) {
        let key = DialerKey { address, channel_type };
        {
            let mut dialers = self.dialers.lock();
            if dialers.contains_key(&key) {
                return;
            }
            dialers.insert(key, DialerState { connecting: true, last_attempt: Instant::now() });
        }
        let this = self.clone();
        tokio::spawn(async move { this.attempt_dial(key).await });
    }

    async fn attempt_dial(self: &Arc<Self>, key: DialerKey) {
        match self.try_connect(key).await {
            Ok(channel) => {
                self.dialers.lock().remove(&key);
                (self.on_channel)(channel);
            }
            Err(e) => {
                tracing::debug!(addr = %key.address, error = %e, "dial failed, will retry");
                if let Some(state) = self.dialers.lock().get_mut(&key) {
                    state.connecting = false;
                    state.last_attempt = Instant::now();
                }
            }
        }
    }

    async fn try_connect(self: &Arc<Self>, key: DialerKey) -> crate::error::MdvResult<Arc<Channel>> {
        // Dial collision penalty: a small random sleep before connecting so
        // two nodes dialing each other simultaneously don't both win.
        let jitter = rand::random::<u64>() % self.config.collision_penalty.as_millis().max(1) as u64;
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let mut stream = TcpStream::connect(key.address).await?;
        apply_keepalive(&stream, &self.config);
        write_handshake(&mut stream, key.channel_type, self.self_uuid, self.self_listen).await?;

        let (remote_uuid, remote_listen) = if key.channel_type == ChannelType::Peer {
            let (uuid, addr) = read_peer_hello(&mut stream).await?;
            (Some(uuid), addr)
        } else {
            (None, None)
        };

        let (channel, read_fut) = from_tcp_stream(stream, Direction::Out, key.channel_type, remote_uuid, remote_listen, self.max_payload);
        tokio::spawn(read_fut);
        Ok(channel)
    }

    fn spawn_retry_timer(self: Arc<Self>) {
        let retry_interval = self.config.retry_interval;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retry_interval.max(Duration::from_millis(100)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let due: Vec<DialerKey> = {
                    let mut dialers = self.dialers.lock();
                    let now = Instant::now();
                    dialers
                        .iter_mut()
                        .filter(|(_, state)| !state.connecting && now.duration_since(state.last_attempt) >= retry_interval)
                        .map(|(key, state)| {
                            state.connecting = true;
                            *key
                        })
                        .collect()
                };
                for key in due {
                    let this = self.clone();
                    tokio::spawn(async move { this.attempt_dial(key).await });
                }
            }
        });
    }
}

fn bind_listener(addr: SocketAddr, config: &ConnectionSection) -> crate::error::MdvResult<TcpListener> {
    use socket2::{Domain, Socket, Type};
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    #[cfg(target_os = "linux")]
    {
        // Linux-only; best-effort, not load-bearing — don't wake the accept
        // loop for a connection until the peer has actually sent data.
        if let Err(e) = set_tcp_defer_accept(&socket, Duration::from_secs(60)) {
            tracing::debug!(error = %e, "failed to set TCP_DEFER_ACCEPT");
        }
    }

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// `socket2::Socket` has no dedicated setter for `TCP_DEFER_ACCEPT` (unlike
/// `TCP_USER_TIMEOUT`, which it does expose), so it's set with a raw
/// `setsockopt` call instead. `timeout` becomes the kernel's accept-queue
/// wait, in whole seconds, before it gives up deferring and hands the
/// connection to `accept()` regardless.
#[cfg(target_os = "linux")]
fn set_tcp_defer_accept(socket: &socket2::Socket, timeout: Duration) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let secs = timeout.as_secs().max(1) as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            &secs as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn apply_keepalive(stream: &TcpStream, config: &ConnectionSection) {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(config.keep_idle)
        .with_interval(config.keep_interval);
    #[cfg(not(any(target_os = "windows", target_os = "openbsd")))]
    let keepalive = keepalive.with_retries(config.keep_count);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "failed to set keepalive");
    }
    let _ = sock.set_nodelay(true);
}
