//! User-channel wire protocol: table DDL, inserts, queries, fetch.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::MdvResult;
use crate::net::{Channel, Dispatcher};
use crate::node::NodeState;

use super::messages::{
    self, user, CreateTable, DeleteFrom, Fetch, GetTable, InsertInto, RowsetMsg, Select, Status, TableDescMsg, TableInfo,
    TopologyMsg, ViewMsg,
};

/// Registers a handler per user message id on `channel`'s dispatcher. Called
/// once per accepted/dialed user channel (`on_channel_ready` in `node.rs`).
pub fn register(state: &Arc<NodeState>, channel: &Arc<Channel>) {
    let dispatcher = channel.dispatcher.clone();

    reg(&dispatcher, state, user::CREATE_TABLE, handle_create_table);
    reg(&dispatcher, state, user::GET_TABLE, handle_get_table);
    reg(&dispatcher, state, user::GET_TOPOLOGY, handle_get_topology);
    reg(&dispatcher, state, user::INSERT_INTO, handle_insert_into);
    reg(&dispatcher, state, user::SELECT, handle_select);
    reg(&dispatcher, state, user::FETCH, handle_fetch);
    reg(&dispatcher, state, user::DELETE_FROM, handle_delete_from);
}

type Handler = fn(&Arc<NodeState>, Bytes) -> MdvResult<(u16, Vec<u8>)>;

fn reg(dispatcher: &Arc<Dispatcher>, state: &Arc<NodeState>, message_id: u16, handler: Handler) {
    let state = state.clone();
    dispatcher.register(
        message_id,
        Arc::new(move |dispatcher, request_number, payload| {
            let reply = match handler(&state, payload) {
                Ok((reply_id, bytes)) => (reply_id, bytes),
                Err(e) => (user::STATUS, bincode::serialize(&Status { err: e.code(), message: e.to_string() }).unwrap_or_default()),
            };
            if let Err(e) = dispatcher.reply(request_number, reply.0, Bytes::from(reply.1)) {
                tracing::debug!(error = %e, message_id, "failed to reply to user request");
            }
        }),
    );
}

fn ok_status() -> MdvResult<(u16, Vec<u8>)> {
    Ok((user::STATUS, bincode::serialize(&Status { err: 0, message: String::new() })?))
}

fn handle_create_table(state: &Arc<NodeState>, payload: Bytes) -> MdvResult<(u16, Vec<u8>)> {
    let msg: CreateTable = bincode::deserialize(&payload)?;
    let uuid = state.create_table(msg.desc);
    Ok((user::TABLE_INFO, bincode::serialize(&TableInfo { id: uuid })?))
}

fn handle_get_table(state: &Arc<NodeState>, payload: Bytes) -> MdvResult<(u16, Vec<u8>)> {
    let msg: GetTable = bincode::deserialize(&payload)?;
    let desc = state.table_desc(msg.id).ok_or(crate::error::MdvError::ENoEnt)?;
    Ok((user::TABLE_DESC, bincode::serialize(&TableDescMsg { desc })?))
}

fn handle_get_topology(state: &Arc<NodeState>, _payload: Bytes) -> MdvResult<(u16, Vec<u8>)> {
    let topology = state.tracker.snapshot();
    let wire = messages::TopologyWire::from(&*topology);
    Ok((user::TOPOLOGY, bincode::serialize(&TopologyMsg { topology: wire })?))
}

fn handle_insert_into(state: &Arc<NodeState>, payload: Bytes) -> MdvResult<(u16, Vec<u8>)> {
    let msg: InsertInto = bincode::deserialize(&payload)?;
    state.insert_into(msg.table, msg.rows)?;
    ok_status()
}

fn handle_select(state: &Arc<NodeState>, payload: Bytes) -> MdvResult<(u16, Vec<u8>)> {
    let msg: Select = bincode::deserialize(&payload)?;
    let id = state.select(msg.table, msg.fields, &msg.filter)?;
    Ok((user::VIEW, bincode::serialize(&ViewMsg { id })?))
}

fn handle_fetch(state: &Arc<NodeState>, payload: Bytes) -> MdvResult<(u16, Vec<u8>)> {
    let msg: Fetch = bincode::deserialize(&payload)?;
    let rows = state.fetch(msg.id, msg.count)?;
    let wire_rows = rows.rows().iter().map(|r| r.cells.clone()).collect();
    Ok((user::ROWSET, bincode::serialize(&RowsetMsg { rows: wire_rows })?))
}

fn handle_delete_from(state: &Arc<NodeState>, payload: Bytes) -> MdvResult<(u16, Vec<u8>)> {
    let msg: DeleteFrom = bincode::deserialize(&payload)?;
    state.delete_from(msg.table, &msg.filter)?;
    ok_status()
}
