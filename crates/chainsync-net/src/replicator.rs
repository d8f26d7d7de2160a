//! Replication orchestrator: wires identity, transport, schema, stripes and
//! the chain log into a running cluster member.
//!
//! Startup order: resolve self → discover addresses → replay the local log
//! → listen → dial configured peers. After that, every record appended
//! locally streams to connected peers, and records arriving from a peer are
//! applied in exact arrival order. A structurally bad stream stops
//! ingestion from that peer only; the rest of the node keeps running.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

use chainsync_core::chain::replay_and_repair;
use chainsync_core::schema::Definition;
use chainsync_core::{
    ChainLog, ChainRecord, ChainScanner, ClusterConfig, FieldType, FieldWrite, PeerConfig,
    SchemaStore, StripeAllocator,
};

use crate::error::{NetError, Result};
use crate::identity::{discover_ips, Capabilities, IpSet, NetworkNode, NodeDirectory};
use crate::transport::{Client, Hello, OpCode};

/// Cap on one Chain frame body during catch-up streaming.
const MAX_CHAIN_FRAME_BYTES: usize = 64 * 1024;
const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    PeerConnected { server_id: String },
    PeerLost { server_id: String },
    RecordsApplied { from: String, count: usize },
}

struct PeerHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<(OpCode, Vec<u8>)>,
}

pub struct Replicator {
    config: ClusterConfig,
    self_node: RwLock<NetworkNode>,
    ips: IpSet,
    schema: RwLock<SchemaStore>,
    allocator: Mutex<StripeAllocator>,
    directory: RwLock<NodeDirectory>,
    /// The chain itself, in apply order. Streamed to peers on connect.
    history: RwLock<Vec<ChainRecord>>,
    /// Keys of records already applied; forwarding in a mesh must not
    /// re-apply what came back around.
    seen: Mutex<HashSet<u64>>,
    log: Mutex<Option<ChainLog>>,
    peers: RwLock<HashMap<String, PeerHandle>>,
    /// Peers whose stream proved corrupt; no reconnect until an operator
    /// intervenes.
    banned: RwLock<HashSet<String>>,
    listen_addr: SocketAddr,
    events: broadcast::Sender<ReplicationEvent>,
    next_conn_id: AtomicU64,
}

impl Replicator {
    pub async fn start(config: ClusterConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let host_name = if config.host_name.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
        } else {
            config.host_name.clone()
        };

        let mut directory = NodeDirectory::new();
        let mut self_node =
            directory.resolve_self(&config.node_id, &host_name, config.port, config.environment);

        let ips = discover_ips(&host_name).await;
        if ips.is_empty() {
            // Nothing reachable to advertise; stay receive-only until an
            // operator configures addresses.
            self_node.capabilities = Capabilities::default();
        } else {
            self_node.capabilities = Capabilities::ASSEMBLE.with(Capabilities::SUBMIT);
            self_node.local_address = ips.local.first().copied();
            self_node.public_address = ips.public.first().copied();
        }
        directory.update(self_node.clone());

        let mut schema = SchemaStore::new();
        let mut history = Vec::new();
        let mut seen = HashSet::new();
        let mut log = None;
        if config.sync_file_mode {
            let (opened, outcome) =
                replay_and_repair(&config.log_path, config.fsync_every_n_records)?;
            for record in outcome.records {
                schema.apply(&record)?;
                seen.insert(record_key(&record.to_bytes()));
                history.push(record);
            }
            if let Some(detail) = &outcome.corruption {
                error!(
                    offset = outcome.confirmed_bytes,
                    detail,
                    "local chain log is corrupt; file persistence disabled for this run"
                );
            }
            log = opened;
        }

        let listener =
            TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
        let listen_addr = listener.local_addr()?;
        let (events, _) = broadcast::channel(256);

        let allocator = StripeAllocator::new(config.id_offset, config.stripes.clone());
        info!(
            node_id = %config.node_id,
            %listen_addr,
            environment = ?config.environment,
            replayed = history.len(),
            "replicator starting"
        );

        let replicator = Arc::new(Self {
            self_node: RwLock::new(self_node),
            ips,
            schema: RwLock::new(schema),
            allocator: Mutex::new(allocator),
            directory: RwLock::new(directory),
            history: RwLock::new(history),
            seen: Mutex::new(seen),
            log: Mutex::new(log),
            peers: RwLock::new(HashMap::new()),
            banned: RwLock::new(HashSet::new()),
            listen_addr,
            events,
            next_conn_id: AtomicU64::new(1),
            config,
        });

        tokio::spawn(Self::accept_loop(replicator.clone(), listener));
        for peer in replicator.config.peers.clone() {
            tokio::spawn(Self::dial_loop(replicator.clone(), peer));
        }
        Ok(replicator)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn self_node(&self) -> NetworkNode {
        self.self_node.read().clone()
    }

    pub fn ips(&self) -> &IpSet {
        &self.ips
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn directory(&self) -> &RwLock<NodeDirectory> {
        &self.directory
    }

    // -----------------------------------------------------------------
    // Content-layer interface
    // -----------------------------------------------------------------

    /// Primary key for a new row in `scope`, from this node's stripes.
    pub fn next_id(&self, scope: &str) -> Result<u64> {
        Ok(self.allocator.lock().next_id(scope)?)
    }

    /// Ids left before the operator must provision another stripe.
    pub fn ids_remaining(&self, scope: &str) -> Result<u64> {
        Ok(self.allocator.lock().remaining(scope)?)
    }

    /// Append a definition-creation record; returns the new ordinal.
    pub fn create_definition(&self, name: &str, inherited_id: u64) -> Result<u64> {
        let mut schema = self.schema.write();
        let definition_id = schema.definition_count() + 1;
        let record = ChainRecord::CreateDefinition {
            definition_id,
            inherited_id,
            timestamp_ms: now_ms(),
            name: name.to_string(),
        };
        schema.apply(&record)?;
        self.commit_under_lock(&schema, record);
        Ok(definition_id)
    }

    /// Append a field registration; returns the new field id.
    pub fn define_field(
        &self,
        definition_id: u64,
        name: &str,
        data_type: FieldType,
        unsigned: bool,
        private: bool,
    ) -> Result<u64> {
        let mut schema = self.schema.write();
        let field_id = schema.define_field(definition_id, name, data_type, unsigned, private)?;
        let record = ChainRecord::DefineField {
            definition_id,
            name: name.to_string(),
            data_type,
            unsigned,
            private,
        };
        self.commit_under_lock(&schema, record);
        Ok(field_id)
    }

    /// Append field values for an existing definition.
    pub fn set_fields(&self, definition_id: u64, fields: Vec<FieldWrite>) -> Result<()> {
        let mut schema = self.schema.write();
        let record = ChainRecord::SetFields {
            definition_id,
            fields,
        };
        schema.apply(&record)?;
        self.commit_under_lock(&schema, record);
        Ok(())
    }

    /// Map a content-type name to its definition.
    pub fn resolve(&self, name: &str) -> Result<Definition> {
        Ok(self.schema.read().resolve_name(name)?.clone())
    }

    pub fn resolve_id(&self, id: u64) -> Result<Definition> {
        Ok(self.schema.read().resolve(id)?.clone())
    }

    pub fn definition_count(&self) -> u64 {
        self.schema.read().definition_count()
    }

    /// Run a closure against a consistent read view of the schema.
    pub fn with_schema<R>(&self, f: impl FnOnce(&SchemaStore) -> R) -> R {
        f(&self.schema.read())
    }

    /// Run a closure against the applied chain, in apply order.
    pub fn with_history<R>(&self, f: impl FnOnce(&[ChainRecord]) -> R) -> R {
        f(&self.history.read())
    }

    // -----------------------------------------------------------------
    // Chain plumbing
    // -----------------------------------------------------------------

    fn commit_under_lock(&self, schema: &SchemaStore, record: ChainRecord) {
        let bytes = record.to_bytes();
        self.seen.lock().insert(record_key(&bytes));
        let public = public_record_bytes(schema, &record);
        self.append_to_log(&record);
        self.history.write().push(record);
        self.forward(&public, None);
    }

    fn ingest_remote(&self, records: &[ChainRecord], from: &str) -> Result<usize> {
        let mut applied = 0usize;
        for record in records {
            let bytes = record.to_bytes();
            let key = record_key(&bytes);
            if !self.seen.lock().insert(key) {
                continue;
            }
            let public = {
                let mut schema = self.schema.write();
                schema.apply(record)?;
                let public = public_record_bytes(&schema, record);
                self.append_to_log(record);
                self.history.write().push(record.clone());
                public
            };
            self.forward(&public, Some(from));
            applied += 1;
        }
        Ok(applied)
    }

    /// Best-effort file persistence: an append failure surrenders file sync
    /// for the rest of the run rather than stalling replication.
    fn append_to_log(&self, record: &ChainRecord) {
        let mut log_guard = self.log.lock();
        let mut failed = false;
        if let Some(log) = log_guard.as_mut() {
            if let Err(e) = log.append(record) {
                error!(error = %e, "chain log append failed; disabling file sync");
                failed = true;
            }
        }
        if failed {
            *log_guard = None;
        }
    }

    /// Stream record bytes to connected peers, skipping the source.
    /// Receive-only nodes never transmit.
    fn forward(&self, bytes: &[u8], exclude: Option<&str>) {
        if !self.self_node.read().capabilities.can_submit() {
            return;
        }
        let peers = self.peers.read();
        for (server_id, handle) in peers.iter() {
            if exclude == Some(server_id.as_str()) {
                continue;
            }
            let _ = handle.tx.send((OpCode::Chain, bytes.to_vec()));
        }
    }

    /// Full-chain catch-up frames for a freshly connected peer, with
    /// private fields stripped.
    fn history_frames(&self) -> Vec<Vec<u8>> {
        let schema = self.schema.read();
        let history = self.history.read();
        let mut frames = Vec::new();
        let mut current = Vec::new();
        for record in history.iter() {
            let bytes = public_record_bytes(&schema, record);
            if !current.is_empty() && current.len() + bytes.len() > MAX_CHAIN_FRAME_BYTES {
                frames.push(std::mem::take(&mut current));
            }
            current.extend_from_slice(&bytes);
        }
        if !current.is_empty() {
            frames.push(current);
        }
        frames
    }

    fn hello(&self) -> Hello {
        let node = self.self_node.read();
        Hello {
            server_id: node.server_id.clone(),
            capabilities: node.capabilities,
            environment: node.environment,
            version: node.version.clone(),
        }
    }

    fn check_handshake(&self, hello: &Hello, dialed: Option<&PeerConfig>) -> Result<()> {
        if hello.environment != self.config.environment {
            return Err(NetError::Handshake(format!(
                "peer '{}' is in {:?}, we are in {:?}",
                hello.server_id, hello.environment, self.config.environment
            )));
        }
        if hello.server_id == self.config.node_id {
            return Err(NetError::Handshake("connected to self".to_string()));
        }
        if self.banned.read().contains(&hello.server_id) {
            return Err(NetError::Handshake(format!(
                "peer '{}' is banned pending operator action",
                hello.server_id
            )));
        }
        if let Some(expected) = dialed {
            if hello.server_id != expected.server_id {
                return Err(NetError::Handshake(format!(
                    "dialed '{}' but peer identifies as '{}'",
                    expected.server_id, hello.server_id
                )));
            }
        }
        Ok(())
    }

    fn ban(&self, server_id: &str) {
        self.banned.write().insert(server_id.to_string());
    }

    // -----------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------

    async fn accept_loop(this: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let this = Arc::clone(&this);
                    tokio::spawn(async move {
                        if let Err(e) = this.run_connection(stream, None).await {
                            debug!(%addr, error = %e, "inbound connection closed");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept error"),
            }
        }
    }

    async fn dial_loop(this: Arc<Self>, peer: PeerConfig) {
        let mut backoff = this.config.reconnect_backoff_ms;
        loop {
            if this.banned.read().contains(&peer.server_id) {
                warn!(peer = %peer.server_id, "peer banned; dialer stopping");
                return;
            }
            let endpoint = peer.endpoint();
            let connect = timeout(
                Duration::from_millis(this.config.connect_timeout_ms),
                TcpStream::connect(&endpoint),
            )
            .await;
            match connect {
                Ok(Ok(stream)) => {
                    backoff = this.config.reconnect_backoff_ms;
                    info!(peer = %peer.server_id, %endpoint, "connected to peer");
                    match this.run_connection(stream, Some(peer.clone())).await {
                        Ok(()) => debug!(peer = %peer.server_id, "connection closed"),
                        Err(e) => warn!(peer = %peer.server_id, error = %e, "peer connection ended"),
                    }
                }
                Ok(Err(e)) => debug!(%endpoint, error = %e, "connect failed"),
                Err(_) => debug!(%endpoint, "connect timed out"),
            }
            tokio::time::sleep(Duration::from_millis(backoff)).await;
            backoff = (backoff * 2).min(this.config.reconnect_backoff_max_ms);
        }
    }

    async fn run_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        dialed: Option<PeerConfig>,
    ) -> Result<()> {
        stream.set_nodelay(true).ok();
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (mut reader, mut writer) = stream.into_split();
        let mut client = Client::new(conn_id, peer_addr.clone(), self.config.max_send_queue_bytes);
        let (tx, mut rx) = mpsc::unbounded_channel::<(OpCode, Vec<u8>)>();
        let mut scanner = ChainScanner::new();
        let mut registered: Option<String> = None;

        let result = self
            .connection_loop(
                &mut client,
                &mut reader,
                &mut writer,
                &mut rx,
                &tx,
                &mut scanner,
                dialed.as_ref(),
                &mut registered,
            )
            .await;

        client.abort();
        if let Some(server_id) = registered {
            // Another connection may have re-registered this peer already;
            // only drop the handle if it is still ours.
            let mut peers = self.peers.write();
            if peers.get(&server_id).map(|h| h.conn_id) == Some(conn_id) {
                peers.remove(&server_id);
            }
            drop(peers);
            let _ = self.events.send(ReplicationEvent::PeerLost {
                server_id: server_id.clone(),
            });
            info!(peer = %server_id, "peer disconnected");
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn connection_loop(
        self: &Arc<Self>,
        client: &mut Client,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        rx: &mut mpsc::UnboundedReceiver<(OpCode, Vec<u8>)>,
        tx: &mpsc::UnboundedSender<(OpCode, Vec<u8>)>,
        scanner: &mut ChainScanner,
        dialed: Option<&PeerConfig>,
        registered: &mut Option<String>,
    ) -> Result<()> {
        // Identity goes first on every connection, both directions.
        send_now(client, writer, OpCode::Handshake, &self.hello().encode()).await?;

        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        let mut heartbeat = interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        let mut last_recv = Instant::now();

        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) => {
                            return Err(NetError::PeerLost(
                                registered.clone().unwrap_or_else(|| client.peer_addr.clone()),
                            ))
                        }
                        Ok(n) => n,
                        Err(e) => return Err(e.into()),
                    };
                    last_recv = Instant::now();
                    let handles = client.feed(&chunk[..n])?;
                    for handle in handles {
                        let (op, body) = {
                            let msg = client.message(handle)?;
                            (msg.op, msg.body.clone())
                        };
                        client.release(handle)?;
                        match op {
                            Some(OpCode::Handshake) => {
                                self.on_handshake(client, writer, &body, tx, dialed, registered)
                                    .await?;
                            }
                            Some(OpCode::Chain) => {
                                self.on_chain(client, scanner, &body)?;
                            }
                            Some(OpCode::Heartbeat) => {}
                            Some(OpCode::Bye) => {
                                debug!(peer = %client.peer_addr, "peer said goodbye");
                                return Ok(());
                            }
                            None => unreachable!("completed message always has an opcode"),
                        }
                    }
                }
                outbound = rx.recv() => {
                    let (op, body) = outbound.ok_or(NetError::ChannelClosed)?;
                    send_now(client, writer, op, &body).await?;
                }
                _ = heartbeat.tick() => {
                    if last_recv.elapsed()
                        > Duration::from_millis(self.config.heartbeat_timeout_ms)
                    {
                        return Err(NetError::Timeout(format!(
                            "peer {} silent past heartbeat timeout",
                            client.peer_addr
                        )));
                    }
                    send_now(client, writer, OpCode::Heartbeat, &[]).await?;
                }
            }
        }
    }

    async fn on_handshake(
        self: &Arc<Self>,
        client: &mut Client,
        writer: &mut OwnedWriteHalf,
        body: &[u8],
        tx: &mpsc::UnboundedSender<(OpCode, Vec<u8>)>,
        dialed: Option<&PeerConfig>,
        registered: &mut Option<String>,
    ) -> Result<()> {
        if client.is_authenticated() {
            return Err(NetError::Handshake("duplicate handshake".to_string()));
        }
        let hello = Hello::decode(body)?;
        self.check_handshake(&hello, dialed)?;
        client.complete_handshake(&hello);
        self.peers.write().insert(
            hello.server_id.clone(),
            PeerHandle {
                conn_id: client.id,
                tx: tx.clone(),
            },
        );
        *registered = Some(hello.server_id.clone());
        let _ = self.events.send(ReplicationEvent::PeerConnected {
            server_id: hello.server_id.clone(),
        });
        info!(
            peer = %hello.server_id,
            capabilities = ?hello.capabilities,
            version = %hello.version,
            "handshake complete"
        );

        // Bring the peer up to date before live traffic reaches it.
        if self.self_node.read().capabilities.can_submit() {
            for frame in self.history_frames() {
                send_now(client, writer, OpCode::Chain, &frame).await?;
            }
        }
        Ok(())
    }

    fn on_chain(&self, client: &mut Client, scanner: &mut ChainScanner, body: &[u8]) -> Result<()> {
        let from = match client.server_id.clone() {
            Some(id) => id,
            None => return Err(NetError::Handshake("chain bytes before handshake".to_string())),
        };
        let records = match scanner.feed(body) {
            Ok(records) => records,
            Err(e) => {
                error!(peer = %from, error = %e, "corrupt chain stream; banning peer");
                self.ban(&from);
                return Err(e.into());
            }
        };
        if records.is_empty() {
            return Ok(());
        }
        match self.ingest_remote(&records, &from) {
            Ok(applied) => {
                if applied > 0 {
                    let _ = self.events.send(ReplicationEvent::RecordsApplied {
                        from: from.clone(),
                        count: applied,
                    });
                }
                Ok(())
            }
            Err(e) => {
                error!(
                    peer = %from,
                    offset = scanner.confirmed_bytes(),
                    error = %e,
                    "structural error applying remote records; banning peer"
                );
                self.ban(&from);
                Err(e)
            }
        }
    }
}

/// Write a frame and drain the queue behind it. All sends for a connection
/// happen on its own task, so the queue's single-flight discipline maps to
/// this sequential loop.
async fn send_now(
    client: &mut Client,
    writer: &mut OwnedWriteHalf,
    op: OpCode,
    body: &[u8],
) -> Result<()> {
    let mut next = client.enqueue(op, body)?;
    while let Some(buf) = next {
        writer.write_all(&buf).await?;
        next = client.send.on_completed();
    }
    writer.flush().await?;
    Ok(())
}

/// Dedup key: the envelope CRC plus length. The chain is append-only, so
/// one small key per record is acceptable for the process lifetime.
fn record_key(bytes: &[u8]) -> u64 {
    let crc = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    (crc as u64) << 32 | (bytes.len() as u64 & 0xffff_ffff)
}

/// Encoding of `record` fit for external replication: private field values
/// never leave the node.
fn public_record_bytes(schema: &SchemaStore, record: &ChainRecord) -> Vec<u8> {
    if let ChainRecord::SetFields { definition_id, .. } = record {
        if let Ok(private) = schema.private_field_ids(*definition_id) {
            if !private.is_empty() {
                let private: HashSet<u64> = private.into_iter().collect();
                return record.retain_public(|id| private.contains(&id)).to_bytes();
            }
        }
    }
    record.to_bytes()
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
