//! Peer-channel wire protocol: topology gossip, broadcast flood-fill, and
//! trlog replication.

use std::sync::Arc;

use bytes::Bytes;

use crate::ids::{NodeId, StorageId};
use crate::net::{post_encoded, Channel, Dispatcher};
use crate::node::NodeState;
use crate::trlog::{SyncState, DEFAULT_BATCH_RECORDS};

use super::messages::{peer, Broadcast, Toposync, TrlogData, TrlogState, TrlogSync};

pub fn register(state: &Arc<NodeState>, channel: &Arc<Channel>) {
    let dispatcher = channel.dispatcher.clone();
    let Some(remote) = channel.peer else { return };

    reg(&dispatcher, state, remote, peer::TOPOSYNC, handle_toposync);
    reg(&dispatcher, state, remote, peer::BROADCAST, handle_broadcast);
    reg(&dispatcher, state, remote, peer::TRLOG_SYNC, handle_trlog_sync);
    reg(&dispatcher, state, remote, peer::TRLOG_STATE, handle_trlog_state);
    reg(&dispatcher, state, remote, peer::TRLOG_DATA, handle_trlog_data);
}

type Handler = fn(&Arc<NodeState>, &Arc<Dispatcher>, NodeId, Bytes);

fn reg(dispatcher: &Arc<Dispatcher>, state: &Arc<NodeState>, remote: NodeId, message_id: u16, handler: Handler) {
    let state = state.clone();
    dispatcher.register(
        message_id,
        Arc::new(move |dispatcher, _request_number, payload| handler(&state, &dispatcher, remote, payload)),
    );
}

/// Requests a catch-up for every local table/trlog once a peer channel comes
/// up, moving each `(remote, trlog)` slot from `Idle`/`Cancelled` into
/// `Querying`. Also offers the tablespace trlog itself, so a peer that
/// doesn't know about any of these tables yet still learns their schemas.
pub fn kick_off_sync(state: &Arc<NodeState>, remote: NodeId, channel: &Arc<Channel>) {
    for trlog_id in state.sync_trlog_ids() {
        kick_off_sync_one(state, remote, channel, trlog_id);
    }
}

/// Seeds the slot from the trlog's actual on-disk `top()` before announcing
/// reachability, so a slot never starts from a stale `applied_top` of 0 —
/// see `Synchronizer::seed`.
fn kick_off_sync_one(state: &Arc<NodeState>, remote: NodeId, channel: &Arc<Channel>, trlog_id: StorageId) {
    let Some(trlog) = state.trlog_by_id(trlog_id) else { return };
    let applied_top = trlog.top();
    state.synchronizer.seed(remote, trlog_id, applied_top);
    if state.synchronizer.on_peer_reachable(remote, trlog_id) {
        let _ = post_encoded(&channel.dispatcher, peer::TRLOG_SYNC, &TrlogSync { trlog: trlog_id, applied_top });
    }
}

fn handle_toposync(state: &Arc<NodeState>, _dispatcher: &Arc<Dispatcher>, remote: NodeId, payload: Bytes) {
    let Ok(msg) = bincode::deserialize::<Toposync>(&payload) else { return };
    match msg.topology.into_domain() {
        // The local tracker is the node's authoritative topology view,
        // built from handshake-observed `LinkState` transitions — a peer's
        // gossiped snapshot is logged for diagnostics only, not merged in,
        // since merging two independently-built snapshots needs a
        // reconciliation rule this crate doesn't define (see `DESIGN.md`).
        Ok(topology) => tracing::debug!(%remote, nodes = topology.nodes.len(), links = topology.links.len(), "received toposync"),
        Err(e) => tracing::debug!(%remote, error = %e, "malformed toposync"),
    }
}

fn handle_broadcast(state: &Arc<NodeState>, _dispatcher: &Arc<Dispatcher>, _remote: NodeId, payload: Bytes) {
    let Ok(mut msg) = bincode::deserialize::<Broadcast>(&payload) else { return };
    if msg.notified.contains(&state.self_uuid) {
        return;
    }
    msg.notified.insert(state.self_uuid);

    let _ = state.ebus.publish(
        crate::ebus::Event::Broadcast { msg_id: msg.msg_id, data: msg.data.clone().into(), notified: msg.notified.iter().copied().collect::<Vec<_>>().into() },
        crate::ebus::PublishFlags::default(),
    );

    for (peer_uuid, channel) in state.all_peer_channels() {
        if msg.notified.contains(&peer_uuid) {
            continue;
        }
        let forward = Broadcast { msg_id: msg.msg_id, data: msg.data.clone(), notified: msg.notified.clone() };
        let _ = post_encoded(&channel.dispatcher, peer::BROADCAST, &forward);
    }
}

fn handle_trlog_sync(state: &Arc<NodeState>, dispatcher: &Arc<Dispatcher>, _remote: NodeId, payload: Bytes) {
    let Ok(msg) = bincode::deserialize::<TrlogSync>(&payload) else { return };
    let Ok(trlog) = state.trlogs.open(msg.trlog) else { return };
    let top = trlog.top();

    let _ = post_encoded(dispatcher, peer::TRLOG_STATE, &TrlogState { trlog: msg.trlog, top });

    if top > msg.applied_top {
        match trlog.range(msg.applied_top, DEFAULT_BATCH_RECORDS) {
            Ok(rows) if !rows.is_empty() => {
                let count = rows.len() as u32;
                let _ = post_encoded(dispatcher, peer::TRLOG_DATA, &TrlogData { trlog: msg.trlog, count, rows });
            }
            _ => {}
        }
    }
}

fn handle_trlog_state(state: &Arc<NodeState>, _dispatcher: &Arc<Dispatcher>, remote: NodeId, payload: Bytes) {
    let Ok(msg) = bincode::deserialize::<TrlogState>(&payload) else { return };
    state.synchronizer.on_trlog_state(remote, msg.trlog, msg.top);
}

fn handle_trlog_data(state: &Arc<NodeState>, dispatcher: &Arc<Dispatcher>, remote: NodeId, payload: Bytes) {
    let Ok(msg) = bincode::deserialize::<TrlogData>(&payload) else { return };
    let Ok(trlog) = state.trlogs.open(msg.trlog) else { return };

    match state.synchronizer.on_trlog_data(remote, &trlog, &msg.rows) {
        Ok(still_behind) => {
            let learned = state.replay_trlog_data(msg.trlog, &msg.rows);
            if still_behind {
                let _ = post_encoded(dispatcher, peer::TRLOG_SYNC, &TrlogSync { trlog: msg.trlog, applied_top: trlog.top() });
            }
            // A tablespace batch just taught us about a table we didn't have
            // before — ask every connected peer (including this one) for its
            // rows right away instead of waiting for the next channel to come up.
            for (peer_uuid, peer_channel) in state.all_peer_channels() {
                for table_id in &learned {
                    kick_off_sync_one(state, peer_uuid, &peer_channel, *table_id);
                }
            }
        }
        Err(()) => {
            if state.synchronizer.state_of(remote, msg.trlog) != Some(SyncState::Cancelled) {
                let _ = post_encoded(dispatcher, peer::TRLOG_SYNC, &TrlogSync { trlog: msg.trlog, applied_top: trlog.top() });
            }
        }
    }
}
