//! Wire payload shapes and message ids.
//!
//! Field names mirror the wire's `binn-object` letters directly (`N`, `S`,
//! `B`, `F` for `TableDesc`; `NC`, `LC`, `ES`, `N`, `L` for `Topology`) so
//! the wire shape is visible directly in the struct definition instead of
//! being re-derived from a separate schema file.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, StorageId};
use crate::rowset::table::{Field, Table};
use crate::topology::node::{Link as DomainLink, Node as DomainNode, Topology as DomainTopology};
use crate::trlog::TrlogRecord;

pub mod user {
    pub const STATUS: u16 = 1;
    pub const CREATE_TABLE: u16 = 3;
    pub const GET_TABLE: u16 = 4;
    pub const TABLE_INFO: u16 = 5;
    pub const TABLE_DESC: u16 = 6;
    pub const GET_TOPOLOGY: u16 = 7;
    pub const TOPOLOGY: u16 = 8;
    pub const INSERT_INTO: u16 = 9;
    pub const SELECT: u16 = 10;
    pub const VIEW: u16 = 11;
    pub const FETCH: u16 = 12;
    pub const ROWSET: u16 = 13;
    pub const DELETE_FROM: u16 = 14;
}

pub mod peer {
    pub const HELLO: u16 = 1000;
    pub const TOPOSYNC: u16 = 1001;
    pub const BROADCAST: u16 = 1002;
    pub const TRLOG_SYNC: u16 = 1003;
    pub const TRLOG_STATE: u16 = 1004;
    pub const TRLOG_DATA: u16 = 1005;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub err: i32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldWire {
    #[serde(rename = "T")]
    pub t: u32,
    #[serde(rename = "L")]
    pub l: u32,
    #[serde(rename = "N")]
    pub n: String,
}

/// `{N:str, S:u32, B:u32, F:list<{...}>}`. `S` is the table's schema
/// version, bumped whenever its field list changes; `B` is a storage block
/// size hint passed through to the backing engine, unused by this crate's
/// in-memory path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescWire {
    #[serde(rename = "N")]
    pub n: String,
    #[serde(rename = "S")]
    pub s: u32,
    #[serde(rename = "B")]
    pub b: u32,
    #[serde(rename = "F")]
    pub f: Vec<FieldWire>,
}

impl TableDescWire {
    pub fn from_table(table: &Table, name: &str) -> Self {
        TableDescWire {
            n: name.to_string(),
            s: 1,
            b: 0,
            f: table.fields.iter().map(|field| FieldWire { t: field.field_type, l: field.array_limit, n: field.name.clone() }).collect(),
        }
    }

    pub fn into_table(self, uuid: StorageId) -> Table {
        Table::new(uuid, self.f.into_iter().map(|f| Field { name: f.n, field_type: f.t, array_limit: f.l }).collect())
    }
}

/// One entry of the tablespace trlog (`StorageId::TABLESPACE`): records that
/// table `uuid` was created with `desc`. A node replays these the same way
/// it replays row data, learning tables its peers created without needing a
/// dedicated "propagate schema" message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableCreateRecord {
    pub uuid: StorageId,
    pub desc: TableDescWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeWire {
    #[serde(rename = "U1")]
    pub u1: u64,
    #[serde(rename = "U2")]
    pub u2: u64,
    #[serde(rename = "A")]
    pub a: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkWire {
    #[serde(rename = "U1")]
    pub u1: u32,
    #[serde(rename = "U2")]
    pub u2: u32,
    #[serde(rename = "W")]
    pub w: u32,
}

/// `{NC:u64, LC:u64, ES:u64, N:list<{...}>, L:list<{...}>}`: node count,
/// link count, extra-string length, then the node and link lists
/// themselves. `NC`/`LC`/`ES` are redundant with the list lengths in this
/// representation (serde derives them on encode); they're kept as fields
/// to match the documented wire byte layout, not because anything here
/// reads them back on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyWire {
    #[serde(rename = "NC")]
    pub nc: u64,
    #[serde(rename = "LC")]
    pub lc: u64,
    #[serde(rename = "ES")]
    pub es: u64,
    #[serde(rename = "N")]
    pub n: Vec<NodeWire>,
    #[serde(rename = "L")]
    pub l: Vec<LinkWire>,
}

impl From<&DomainTopology> for TopologyWire {
    fn from(t: &DomainTopology) -> Self {
        let n: Vec<NodeWire> = t
            .nodes
            .iter()
            .map(|node: &DomainNode| {
                let (u1, u2) = node.uuid.0.as_u64_pair();
                NodeWire { u1, u2, a: node.address.to_string() }
            })
            .collect();
        let l: Vec<LinkWire> = t.links.iter().map(|link: &DomainLink| LinkWire { u1: link.n1, u2: link.n2, w: link.weight }).collect();
        TopologyWire { nc: n.len() as u64, lc: l.len() as u64, es: t.extra.len() as u64, n, l }
    }
}

impl TopologyWire {
    pub fn into_domain(self) -> crate::error::MdvResult<DomainTopology> {
        let mut nodes = Vec::with_capacity(self.n.len());
        for (local_id, node) in self.n.into_iter().enumerate() {
            let uuid = NodeId(uuid::Uuid::from_u64_pair(node.u1, node.u2));
            let address: std::net::SocketAddr = node
                .a
                .parse()
                .map_err(|_| crate::error::MdvError::Failed(format!("bad node address '{}'", node.a)))?;
            nodes.push(DomainNode { uuid, address, connected: true, active: true, local_id: local_id as u32 });
        }
        let links = self.l.into_iter().map(|l| DomainLink { n1: l.u1, n2: l.u2, weight: l.w }).collect();
        Ok(DomainTopology { nodes, links, extra: String::new() })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTable {
    pub desc: TableDescWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTable {
    pub id: StorageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: StorageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescMsg {
    pub desc: TableDescWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyMsg {
    pub topology: TopologyWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertInto {
    pub table: StorageId,
    pub rows: Vec<Vec<Vec<u8>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Select {
    pub table: StorageId,
    pub fields: Vec<bool>,
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewMsg {
    pub id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fetch {
    pub id: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsetMsg {
    pub rows: Vec<Vec<Vec<u8>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFrom {
    pub table: StorageId,
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toposync {
    pub topology: TopologyWire,
}

/// `p2p_broadcast{msg_id, size, data, notified:set<uuid>}`, relayed by
/// flood-fill: every peer forwards it once to neighbours not yet in
/// `notified`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub msg_id: u16,
    pub data: Vec<u8>,
    pub notified: HashSet<NodeId>,
}

/// `p2p_trlog_sync{trlog}`, carrying the asker's current `applied_top` so a
/// single request doubles as both "what's your top?" and "send me your
/// next batch past this point" — reusing one message for both instead of
/// needing a fourth (see `DESIGN.md`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrlogSync {
    pub trlog: StorageId,
    pub applied_top: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrlogState {
    pub trlog: StorageId,
    pub top: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrlogData {
    pub trlog: StorageId,
    pub count: u32,
    pub rows: Vec<TrlogRecord>,
}
