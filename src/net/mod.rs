//! Channel mesh: manager, dialer bookkeeping, handshake, framing, dispatch.

pub mod chaman;
pub mod channel;
pub mod dialer;
pub mod dispatcher;
pub mod frame;
pub mod handshake;

pub use chaman::ChanMan;
pub use channel::{post_encoded, Channel, ChannelType, Direction};
pub use dispatcher::Dispatcher;
pub use frame::{Frame, FrameCodec};
