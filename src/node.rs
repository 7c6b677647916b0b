//! Top-level node: wires the channel mesh, tracker, trlog registry, and
//! rowdata tables together behind the user/peer wire protocols.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex as PLMutex;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::ebus::{Ebus, EbusConfig, Event, PublishFlags};
use crate::error::{MdvError, MdvResult};
use crate::ids::{NodeId, StorageId};
use crate::net::{ChanMan, Channel, ChannelType};
use crate::rowset::{compile_predicate, Row, RowSet, Table, View};
use crate::topology::Tracker;
use crate::trlog::{Synchronizer, Trlog, TrlogRecord, TrlogRegistry};
use crate::wire::messages::{TableCreateRecord, TableDescWire};

/// Bumped whenever `metainf`/`tablespace` on-disk shapes change incompatibly.
/// A mismatch against what's already on disk is a fatal startup error.
const SCHEMA_VERSION: u32 = 1;

/// A table's schema plus its live in-memory rows and backing trlog. The
/// trlog is the durable, replicated source of truth; the `RowSet` is a
/// materialised read cache rebuilt from it as records are applied, keeping
/// the rowdata model storage-agnostic without an on-disk row format of its
/// own.
struct TableEntry {
    name: String,
    table: Arc<Table>,
    rows: Arc<PLMutex<RowSet>>,
    trlog: Arc<Trlog>,
}

/// Shared state reachable from every registered wire handler. One instance
/// per running node, held behind `Arc` so handlers (themselves `Arc<dyn
/// Fn>`) can close over a clone cheaply.
pub struct NodeState {
    pub self_uuid: NodeId,
    pub config: NodeConfig,
    pub ebus: Arc<Ebus>,
    pub tracker: Arc<Tracker>,
    pub trlogs: Arc<TrlogRegistry>,
    pub synchronizer: Arc<Synchronizer>,
    /// Set exactly once by `Node::start`, after `NodeState` itself exists —
    /// `ChanMan::create` needs an `on_channel` callback that closes over this
    /// state, so the two can't be built in the other order. `ArcSwapOption`
    /// gives every handler a cheap `load_full()` instead of a `Mutex` neither
    /// ever contends on after startup.
    pub chaman: ArcSwapOption<ChanMan>,
    /// The `tablespace` sled tree: one serialized `TableDescWire` per table
    /// uuid, so tables survive a restart instead of existing only in the
    /// in-memory `tables` map.
    tablespace: sled::Tree,
    /// The tablespace's own trlog, keyed by the reserved `StorageId::TABLESPACE`
    /// uuid. `create_table` appends a `TableCreateRecord` to it alongside
    /// writing into `tablespace` above, so table creation replicates to
    /// peers through the same sync machinery row data uses.
    tablespace_trlog: Arc<Trlog>,
    tables: PLMutex<HashMap<StorageId, TableEntry>>,
    peer_channels: PLMutex<HashMap<NodeId, Arc<Channel>>>,
    views: PLMutex<HashMap<u32, Arc<View>>>,
    next_view_id: AtomicU32,
}

impl NodeState {
    pub fn create_table(&self, desc: TableDescWire) -> StorageId {
        let uuid = StorageId::generate();
        let table = Arc::new(desc.clone().into_table(uuid));
        let trlog = self.trlogs.open(uuid).expect("sled tree open for a freshly generated uuid can't fail");
        let rows = Arc::new(PLMutex::new(RowSet::new(table.clone())));
        if let Err(e) = self.persist_table_desc(uuid, &desc) {
            tracing::warn!(error = %e, %uuid, "failed to persist table description");
        }
        self.append_table_create_record(uuid, &desc);
        self.tables.lock().insert(uuid, TableEntry { name: desc.n, table, rows, trlog });
        let _ = self.ebus.publish(Event::TableCreate { uuid }, PublishFlags::default());
        uuid
    }

    /// Logs `uuid`'s creation into the well-known tablespace trlog so peers
    /// learn the schema the same way they learn rows: via `TrlogSync`.
    fn append_table_create_record(&self, uuid: StorageId, desc: &TableDescWire) {
        let Ok(op) = bincode::serialize(&TableCreateRecord { uuid, desc: desc.clone() }) else { return };
        let row_id = self.tablespace_trlog.reserve(1);
        if let Err(e) = self.tablespace_trlog.append(&[TrlogRecord { row_id, op }]) {
            tracing::warn!(error = %e, %uuid, "failed to append tablespace trlog record");
        }
    }

    fn persist_table_desc(&self, uuid: StorageId, desc: &TableDescWire) -> MdvResult<()> {
        let bytes = bincode::serialize(desc)?;
        self.tablespace.insert(uuid.0.as_bytes(), bytes)?;
        self.tablespace.flush()?;
        Ok(())
    }

    pub fn table_desc(&self, id: StorageId) -> Option<TableDescWire> {
        let tables = self.tables.lock();
        let entry = tables.get(&id)?;
        Some(TableDescWire::from_table(&entry.table, &entry.name))
    }

    pub fn insert_into(&self, table_id: StorageId, rows: Vec<Vec<Vec<u8>>>) -> MdvResult<usize> {
        let (trlog, row_store) = {
            let tables = self.tables.lock();
            let entry = tables.get(&table_id).ok_or(MdvError::ENoEnt)?;
            (entry.trlog.clone(), entry.rows.clone())
        };

        let count = rows.len() as u64;
        if count == 0 {
            return Ok(0);
        }
        let first_id = trlog.reserve(count);
        let records: Vec<TrlogRecord> = rows
            .iter()
            .enumerate()
            .map(|(i, cells)| TrlogRecord { row_id: first_id + i as u64, op: bincode::serialize(cells).unwrap_or_default() })
            .collect();
        trlog.append(&records)?;

        let mut store = row_store.lock();
        for cells in rows {
            store.emplace(Row::new(cells));
        }
        drop(store);

        let _ = self.ebus.publish(Event::RowdataInsert { table: table_id, count: count as usize }, PublishFlags::default());
        let _ = self.ebus.publish(Event::TrlogChanged { trlog: table_id }, PublishFlags { unique: true });
        Ok(count as usize)
    }

    pub fn select(&self, table_id: StorageId, fields: Vec<bool>, filter: &str) -> MdvResult<u32> {
        let (table, row_store) = {
            let tables = self.tables.lock();
            let entry = tables.get(&table_id).ok_or(MdvError::ENoEnt)?;
            (entry.table.clone(), entry.rows.clone())
        };

        let predicate = if filter.is_empty() { None } else { Some(compile_predicate(filter, &table)?) };
        let snapshot = {
            let store = row_store.lock();
            let mut copy = RowSet::new(table.clone());
            copy.append(store.rows());
            copy
        };

        let view = Arc::new(View::new(Arc::new(snapshot), fields, predicate));
        let id = self.next_view_id.fetch_add(1, Ordering::Relaxed);
        self.views.lock().insert(id, view);
        let _ = self.ebus.publish(Event::Select { table: table_id }, PublishFlags::default());
        Ok(id)
    }

    pub fn view_desc(&self, id: u32) -> MdvResult<Table> {
        let views = self.views.lock();
        let view = views.get(&id).ok_or(MdvError::ENoEnt)?;
        Ok(view.desc().clone())
    }

    pub fn fetch(&self, id: u32, count: u32) -> MdvResult<RowSet> {
        let view = self.views.lock().get(&id).cloned().ok_or(MdvError::ENoEnt)?;
        let rows = view.fetch(count as usize)?;
        let _ = self.ebus.publish(Event::ViewFetch { id, count: count as usize }, PublishFlags::default());
        Ok(rows)
    }

    pub fn delete_from(&self, table_id: StorageId, filter: &str) -> MdvResult<usize> {
        let (table, row_store) = {
            let tables = self.tables.lock();
            let entry = tables.get(&table_id).ok_or(MdvError::ENoEnt)?;
            (entry.table.clone(), entry.rows.clone())
        };
        let predicate = if filter.is_empty() { None } else { Some(compile_predicate(filter, &table)?) };

        let mut store = row_store.lock();
        let mut kept = Vec::with_capacity(store.len());
        for row in store.rows() {
            let matches = match &predicate {
                Some(p) => p.eval(row)?,
                None => true,
            };
            if !matches {
                kept.push(Row::new(row.cells.clone()));
            }
        }
        let removed = store.len() - kept.len();
        *store = RowSet::new(table);
        store.append(&kept);
        Ok(removed)
    }

    /// Applies a peer's `TrlogData` batch to the matching table's in-memory
    /// rowset after the synchronizer has durably appended it to the trlog.
    /// A redelivered batch re-emplaces rows the rowset already holds — an
    /// accepted simplification over deduplicating by `row_id` in memory, left
    /// for `DESIGN.md` as a known gap rather than an in-scope fix.
    fn replay_into_rowset(&self, trlog_uuid: StorageId, records: &[TrlogRecord]) {
        let tables = self.tables.lock();
        let Some(entry) = tables.get(&trlog_uuid) else { return };
        let mut store = entry.rows.lock();
        for record in records {
            if let Ok(cells) = bincode::deserialize::<Vec<Vec<u8>>>(&record.op) {
                store.emplace(Row::new(cells));
            }
        }
    }

    pub fn peer_channel(&self, remote: NodeId) -> Option<Arc<Channel>> {
        self.peer_channels.lock().get(&remote).cloned()
    }

    pub fn register_peer_channel(&self, remote: NodeId, channel: Arc<Channel>) {
        self.peer_channels.lock().insert(remote, channel);
    }

    pub fn forget_peer_channel(&self, remote: NodeId) {
        self.peer_channels.lock().remove(&remote);
    }

    pub fn all_peer_channels(&self) -> Vec<(NodeId, Arc<Channel>)> {
        self.peer_channels.lock().iter().map(|(n, c)| (*n, c.clone())).collect()
    }

    pub fn table_ids(&self) -> Vec<StorageId> {
        self.tables.lock().keys().copied().collect()
    }

    /// Every trlog id a peer sync round should offer: every local table,
    /// plus the tablespace trlog itself so schema creation replicates even
    /// to a peer that doesn't yet know any of these tables exist.
    pub fn sync_trlog_ids(&self) -> Vec<StorageId> {
        let mut ids = self.table_ids();
        ids.push(StorageId::TABLESPACE);
        ids
    }

    pub fn trlog_for(&self, table_id: StorageId) -> Option<Arc<Trlog>> {
        self.tables.lock().get(&table_id).map(|e| e.trlog.clone())
    }

    /// Like [`NodeState::trlog_for`], but also resolves the well-known
    /// tablespace id.
    pub fn trlog_by_id(&self, id: StorageId) -> Option<Arc<Trlog>> {
        if id == StorageId::TABLESPACE {
            return Some(self.tablespace_trlog.clone());
        }
        self.trlog_for(id)
    }

    /// Applies an incoming `TrlogData` batch. Returns the uuids of any
    /// tables newly learned from a tablespace batch, so the caller can kick
    /// off a row sync for them against every connected peer right away
    /// instead of waiting for the next channel establishment.
    pub fn replay_trlog_data(&self, trlog_uuid: StorageId, records: &[TrlogRecord]) -> Vec<StorageId> {
        if trlog_uuid == StorageId::TABLESPACE {
            self.apply_tablespace_records(records)
        } else {
            self.replay_into_rowset(trlog_uuid, records);
            Vec::new()
        }
    }

    /// Learns tables created by a peer, mirroring what `create_table` does
    /// locally minus re-logging into the tablespace trlog (the record is
    /// already there — that's how we got it).
    fn apply_tablespace_records(&self, records: &[TrlogRecord]) -> Vec<StorageId> {
        let mut learned = Vec::new();
        for record in records {
            let Ok(rec) = bincode::deserialize::<TableCreateRecord>(&record.op) else { continue };
            if self.tables.lock().contains_key(&rec.uuid) {
                continue;
            }
            let table = Arc::new(rec.desc.clone().into_table(rec.uuid));
            let Ok(trlog) = self.trlogs.open(rec.uuid) else { continue };
            if let Err(e) = self.persist_table_desc(rec.uuid, &rec.desc) {
                tracing::warn!(error = %e, uuid = %rec.uuid, "failed to persist replicated table description");
            }
            let rows = Arc::new(PLMutex::new(RowSet::new(table.clone())));
            self.tables.lock().insert(rec.uuid, TableEntry { name: rec.desc.n.clone(), table, rows, trlog });
            let _ = self.ebus.publish(Event::TableCreate { uuid: rec.uuid }, PublishFlags::default());
            tracing::info!(uuid = %rec.uuid, name = %rec.desc.n, "learned table from peer");
            learned.push(rec.uuid);
        }
        learned
    }

    /// Rebuilds the in-memory `tables` map from the `tablespace` tree and
    /// each table's own trlog scan, so a restarted node serves the same
    /// tables (and their already-applied rows) it had before shutdown.
    fn reload_persisted_tables(&self) -> MdvResult<()> {
        let mut loaded = Vec::new();
        for entry in self.tablespace.iter() {
            let (key, value) = entry?;
            let uuid = StorageId(uuid::Uuid::from_bytes(key.as_ref().try_into().map_err(|_| {
                MdvError::Failed("malformed tablespace key".into())
            })?));
            let desc: TableDescWire = bincode::deserialize(&value)?;
            loaded.push((uuid, desc));
        }

        for (uuid, desc) in loaded {
            let table = Arc::new(desc.clone().into_table(uuid));
            let trlog = self.trlogs.open(uuid)?;
            let mut rows = RowSet::new(table.clone());
            for record in trlog.range(0, usize::MAX)? {
                if let Ok(cells) = bincode::deserialize::<Vec<Vec<u8>>>(&record.op) {
                    rows.emplace(Row::new(cells));
                }
            }
            self.tables.lock().insert(uuid, TableEntry { name: desc.n, table, rows: Arc::new(PLMutex::new(rows)), trlog });
        }
        Ok(())
    }
}

/// The running node: owns `NodeState` plus the cancellation token its
/// background tasks watch.
pub struct Node {
    pub state: Arc<NodeState>,
    cancel: CancellationToken,
}

impl Node {
    /// Opens storage, binds the listener, wires the user and peer wire
    /// protocols onto every accepted/dialed channel, and dials the
    /// configured cluster seed nodes. Does not block; callers await
    /// [`Node::run`] to keep the process alive until cancellation.
    pub async fn start(config: NodeConfig, cancel: CancellationToken) -> MdvResult<Self> {
        std::fs::create_dir_all(&config.storage.path)?;
        let db = sled::open(&config.storage.path)?;
        let metainf = db.open_tree("metainf")?;
        check_schema_version(&metainf)?;

        let self_uuid = load_or_assign_uuid(&metainf)?;
        let tablespace = db.open_tree("tablespace")?;
        let ebus = Ebus::new(EbusConfig { queues_count: config.storage.worker_queues });
        let tracker = Tracker::new(self_uuid, config.server.listen, ebus.clone());
        let trlogs = TrlogRegistry::new(db.clone());
        let tablespace_trlog = trlogs.open(StorageId::TABLESPACE)?;
        let synchronizer = Synchronizer::new();

        let state = Arc::new(NodeState {
            self_uuid,
            config: config.clone(),
            ebus,
            tracker,
            trlogs,
            synchronizer,
            chaman: ArcSwapOption::empty(),
            tablespace,
            tablespace_trlog,
            tables: PLMutex::new(HashMap::new()),
            peer_channels: PLMutex::new(HashMap::new()),
            views: PLMutex::new(HashMap::new()),
            next_view_id: AtomicU32::new(1),
        });
        state.reload_persisted_tables()?;

        let on_channel_state = state.clone();
        let chaman = ChanMan::create(
            config.connection.clone(),
            self_uuid,
            config.server.listen,
            16 * 1024 * 1024,
            cancel.clone(),
            Arc::new(move |channel| on_channel_ready(on_channel_state.clone(), channel)),
        );
        state.chaman.store(Some(chaman.clone()));

        chaman.listen(config.server.listen).await?;
        for addr in &config.cluster.nodes {
            chaman.dial(*addr, ChannelType::Peer);
        }

        Ok(Node { state, cancel })
    }

    /// Blocks until the node's cancellation token fires.
    pub async fn run(&self) {
        self.cancel.cancelled().await;
        tracing::info!("node shutting down");
    }
}

fn on_channel_ready(state: Arc<NodeState>, channel: Arc<Channel>) {
    match channel.channel_type {
        ChannelType::User => crate::wire::user_proto::register(&state, &channel),
        ChannelType::Peer => {
            let Some(remote) = channel.peer else {
                tracing::warn!("peer channel established without an identity");
                return;
            };
            state.register_peer_channel(remote, channel.clone());
            crate::wire::peer_proto::register(&state, &channel);
            let remote_addr = channel.remote_listen.unwrap_or_else(|| state.config.server.listen);
            state.tracker.link_state(state.self_uuid, state.config.server.listen, remote, remote_addr, true);

            let disconnect_state = state.clone();
            channel.dispatcher.set_on_close(move || {
                disconnect_state.tracker.link_state(
                    disconnect_state.self_uuid,
                    disconnect_state.config.server.listen,
                    remote,
                    remote_addr,
                    false,
                );
                disconnect_state.synchronizer.on_peer_unreachable(remote);
                disconnect_state.forget_peer_channel(remote);
            });

            crate::wire::peer_proto::kick_off_sync(&state, remote, &channel);
        }
    }
}

fn load_or_assign_uuid(metainf: &sled::Tree) -> MdvResult<NodeId> {
    const KEY: &[u8] = b"self_uuid";
    if let Some(bytes) = metainf.get(KEY)? {
        if bytes.len() == 16 {
            let mut buf = [0u8; 16];
            buf.copy_from_slice(&bytes);
            return Ok(NodeId(uuid::Uuid::from_bytes(buf)));
        }
    }
    let id = NodeId::generate();
    metainf.insert(KEY, id.as_bytes().as_slice())?;
    metainf.flush()?;
    Ok(id)
}

/// Fatal if `metainf` already records a schema version that doesn't match
/// this binary's `SCHEMA_VERSION` — terminates the node with a logged
/// diagnostic and a non-zero exit rather than opening storage it can't
/// safely interpret.
fn check_schema_version(metainf: &sled::Tree) -> MdvResult<()> {
    const KEY: &[u8] = b"schema_version";
    match metainf.get(KEY)? {
        Some(bytes) if bytes.len() == 4 => {
            let on_disk = u32::from_be_bytes(bytes.as_ref().try_into().unwrap());
            if on_disk != SCHEMA_VERSION {
                return Err(MdvError::Failed(format!(
                    "on-disk schema version {on_disk} doesn't match binary schema version {SCHEMA_VERSION}"
                )));
            }
        }
        _ => {
            metainf.insert(KEY, &SCHEMA_VERSION.to_be_bytes())?;
            metainf.flush()?;
        }
    }
    Ok(())
}
