//! The type-tagged handshake performed on every fresh socket before it
//! becomes a [`Channel`](super::channel::Channel). The first byte selects
//! channel type (`0 = user`, `1 = peer`); peer channels follow it with a
//! hello exchange carrying version and uuid.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{MdvError, MdvResult};
use crate::ids::NodeId;

use super::channel::ChannelType;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub uuid: NodeId,
    pub listen_address: String,
}

/// Writes the local side of the handshake: the type byte, and for a peer
/// channel a `p2p_hello`-shaped payload carrying this node's identity. Only
/// the connecting side selects a channel type; an accepting peer channel
/// completes the mutual hello with [`write_peer_hello`] instead.
pub async fn write_handshake(stream: &mut TcpStream, channel_type: ChannelType, self_uuid: NodeId, self_listen: SocketAddr) -> MdvResult<()> {
    stream.write_u8(channel_type as u8).await?;
    if channel_type == ChannelType::Peer {
        write_peer_hello(stream, self_uuid, self_listen).await?;
    }
    Ok(())
}

/// The bare `p2p_hello` payload, with no leading type byte — used by an
/// accepting peer channel to send its own identity back once it has read
/// the connecting side's handshake.
pub async fn write_peer_hello(stream: &mut TcpStream, self_uuid: NodeId, self_listen: SocketAddr) -> MdvResult<()> {
    let hello = Hello { version: PROTOCOL_VERSION, uuid: self_uuid, listen_address: self_listen.to_string() };
    let bytes = bincode::serialize(&hello)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// The bare `p2p_hello` read, counterpart to [`write_peer_hello`] — used by
/// a connecting peer channel to learn who it reached.
pub async fn read_peer_hello(stream: &mut TcpStream) -> MdvResult<(NodeId, Option<SocketAddr>)> {
    let len = stream.read_u32().await?;
    const MAX_HELLO: u32 = 4096;
    if len > MAX_HELLO {
        return Err(MdvError::Failed(format!("oversized hello ({len} bytes)")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    let hello: Hello = bincode::deserialize(&buf)?;
    if hello.version != PROTOCOL_VERSION {
        return Err(MdvError::InvalidProtocolVersion);
    }
    Ok((hello.uuid, hello.listen_address.parse().ok()))
}

/// Reads the remote side of the handshake performed by [`write_handshake`].
/// Returns the selected channel type, plus the remote's identity and
/// advertised listen address for peer channels.
pub async fn read_handshake(stream: &mut TcpStream) -> MdvResult<(ChannelType, Option<NodeId>, Option<SocketAddr>)> {
    let type_byte = stream.read_u8().await?;
    let channel_type = match type_byte {
        0 => ChannelType::User,
        1 => ChannelType::Peer,
        _ => return Err(MdvError::InvalidProtocolVersion),
    };

    if channel_type != ChannelType::Peer {
        return Ok((channel_type, None, None));
    }

    let (uuid, addr) = read_peer_hello(stream).await?;
    Ok((channel_type, Some(uuid), addr))
}
