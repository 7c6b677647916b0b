//! Outbound connection bookkeeping: exactly one dialer entry per
//! (address, channel type), behind a single mutex.

use std::net::SocketAddr;
use std::time::Instant;

use super::channel::ChannelType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DialerKey {
    pub address: SocketAddr,
    pub channel_type: ChannelType,
}

#[derive(Debug, Clone, Copy)]
pub struct DialerState {
    pub connecting: bool,
    pub last_attempt: Instant,
}
