//! Delegator server: composition of all per-node modules plus the main
//! event loop.
//!
//! One delegator process runs per node. It owns the client-facing API hub,
//! the peer transport, the local metadata shard (on metadata-server
//! ranks), the app registry, the service manager, and one request manager
//! per mounted client. All cross-task coordination goes through channels;
//! the event loop below is the only place that mutates the composition
//! state.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::common::{errcode, AppId, ClientId, ServerRank, ThreadId};
use crate::server::appconfig::AppRegistry;
use crate::server::external::{
    conn_id, ApiReply, ApiRequest, ClientApi, ConnId,
};
use crate::server::fsyncer::process_fsync;
use crate::server::index::{meta_indexes, AttrIndex, ExtentIndex, MetaCtx};
use crate::server::reqmgr::{
    spawn_reqmgr, ReadOutcome, ReplyMsg, ReqMgrHandle, WorkUnit,
};
use crate::server::resolver::{resolve_read, SendDesc};
use crate::server::slice::SliceRouter;
use crate::server::store::{ShardClient, ShardHub};
use crate::server::svcmgr::{
    spawn_svcmgr, FetchBatch, SvcEvent, SvcOrigin,
};
use crate::server::transport::{TransportHub, TransportSender};
use crate::server::PeerMsg;
use crate::utils::StagefsError;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegatorConfig {
    /// Base directory for the metadata KV backing files.
    pub meta_db_path: String,

    /// Filename prefix of the metadata KV backing files.
    pub meta_db_name: String,

    /// Number of delegator ranks per metadata server (>= 1).
    pub meta_server_ratio: u32,

    /// Slice width of the key-range partitioning.
    pub meta_range_size: u64,

    /// Directory holding client spill files.
    pub external_spill_dir: String,

    /// Log verbosity: FATAL, ERR, WARN, INFO, or DBG.
    pub log_level: String,

    /// Whether to remove the KV backing files on shutdown.
    pub meta_db_sanitize: bool,

    /// Max serialized bytes per outgoing fetch batch.
    pub req_buf_len: usize,

    /// Reply ring capacity of each request manager.
    pub recv_buf_cnt: usize,

    /// Max payload bytes requested per fetch batch.
    pub sendrecv_buf_len: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for DelegatorConfig {
    fn default() -> Self {
        DelegatorConfig {
            meta_db_path: "/tmp/stagefs-meta".into(),
            meta_db_name: "metakv".into(),
            meta_server_ratio: 1,
            meta_range_size: 1 << 20,
            external_spill_dir: "/tmp/stagefs-spill".into(),
            log_level: "INFO".into(),
            meta_db_sanitize: false,
            req_buf_len: 64 << 10,
            recv_buf_cnt: 64,
            sendrecv_buf_len: 1 << 20,
        }
    }
}

/// Maps a configured log level name onto the `log` facade's filter.
pub fn log_level_filter(
    level: &str,
) -> Result<log::LevelFilter, StagefsError> {
    match level {
        "FATAL" | "ERR" => Ok(log::LevelFilter::Error),
        "WARN" => Ok(log::LevelFilter::Warn),
        "INFO" => Ok(log::LevelFilter::Info),
        "DBG" => Ok(log::LevelFilter::Debug),
        _ => Err(StagefsError(format!("invalid log level '{}'", level))),
    }
}

/// Events fed back into the event loop by spawned handler tasks.
enum LoopEvent {
    /// A finished handler wants this reply sent to this connection.
    Reply { conn: ConnId, reply: ApiReply },

    /// A read resolution completed.
    Resolved {
        app_id: AppId,
        client_id: ClientId,
        conn: ConnId,
        descs: Vec<SendDesc>,
        errcode: i32,
    },
}

/// Delegator server node.
pub struct Delegator {
    /// My delegator rank.
    me: ServerRank,

    /// Total number of delegators in the job.
    population: u32,

    /// Configuration parameters struct.
    config: DelegatorConfig,

    /// ClientApi module.
    client_api: ClientApi,

    /// TransportHub module (idle but present in single-node jobs).
    transport: TransportHub<PeerMsg>,

    /// Sending half of the transport, cloned into spawned tasks.
    peers: TransportSender<PeerMsg>,

    /// Local metadata shard (only on metadata-server ranks).
    shard: Option<ShardHub>,
    shard_client: Option<ShardClient>,

    /// Shared index context (routing + remote call matching).
    ctx: Arc<MetaCtx>,

    /// Typed handle over the distributed extent index.
    extents: ExtentIndex,

    /// Typed handle over the distributed attribute index.
    attrs: AttrIndex,

    /// Registry of mounted apps and clients.
    registry: Arc<AppRegistry>,

    /// Service manager queue and join handle.
    tx_svc: mpsc::UnboundedSender<SvcEvent>,
    svc_handle: Option<JoinHandle<()>>,

    /// Feedback channel from spawned handler tasks.
    tx_evt: mpsc::UnboundedSender<LoopEvent>,
    rx_evt: mpsc::UnboundedReceiver<LoopEvent>,

    /// Completion channel from request managers.
    tx_done: mpsc::UnboundedSender<ReadOutcome>,
    rx_done: mpsc::UnboundedReceiver<ReadOutcome>,

    /// One request manager per mounted client, created lazily on its
    /// first read.
    reqmgrs: HashMap<(AppId, ClientId), ReqMgrHandle>,
    thrd_of: HashMap<ThreadId, (AppId, ClientId)>,
    next_thrd: ThreadId,

    /// Join handles of request managers retired at unmount, joined at
    /// shutdown.
    retired: Vec<JoinHandle<()>>,

    /// Read RPCs whose replies await their request manager's completion.
    pending_reads: HashMap<(AppId, ClientId), VecDeque<ConnId>>,
}

impl Delegator {
    /// Creates a delegator node and sets up all modules: binds the client
    /// API, connects the peer transport (lower ranks are dialed, higher
    /// ranks dial us), and opens the local shard when this rank serves
    /// metadata.
    pub async fn new_and_setup(
        me: ServerRank,
        api_addr: SocketAddr,
        p2p_addrs: Vec<SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, StagefsError> {
        let population = p2p_addrs.len() as u32;
        if me >= population {
            return logged_err!(me; "invalid rank {} of {}", me, population);
        }

        let config = parsed_config!(config_str => DelegatorConfig;
                                    meta_db_path, meta_db_name,
                                    meta_server_ratio, meta_range_size,
                                    external_spill_dir, log_level,
                                    meta_db_sanitize, req_buf_len,
                                    recv_buf_cnt, sendrecv_buf_len)?;
        if config.meta_server_ratio == 0 {
            return logged_err!(me; "invalid config.meta_server_ratio 0");
        }
        if config.meta_range_size == 0 {
            return logged_err!(me; "invalid config.meta_range_size 0");
        }
        log_level_filter(&config.log_level)?;

        let num_meta_servers = (population / config.meta_server_ratio).max(1);
        let router =
            SliceRouter::new(config.meta_range_size, num_meta_servers);

        // only the first num_meta_servers ranks host a shard
        let shard = if me < num_meta_servers {
            Some(
                ShardHub::new_and_setup(
                    me,
                    Path::new(&config.meta_db_path),
                    &config.meta_db_name,
                )
                .await?,
            )
        } else {
            None
        };
        let shard_client = shard.as_ref().map(|hub| hub.client());

        // peer transport; lower ranks are dialed proactively
        let mut transport = TransportHub::new_and_setup(
            me,
            population,
            p2p_addrs[me as usize],
        )
        .await?;
        for rank in 0..me {
            transport
                .connect_to_peer(rank, p2p_addrs[rank as usize])
                .await?;
        }
        transport.wait_for_group().await?;
        let peers = transport.sender();

        let ctx = MetaCtx::new(
            me,
            router,
            shard_client.clone(),
            Some(peers.clone()),
        );
        let (extents, attrs) = meta_indexes(ctx.clone());

        let registry = Arc::new(AppRegistry::new(me));

        let (tx_svc, rx_svc) = mpsc::unbounded_channel();
        let svc_handle =
            spawn_svcmgr(me, registry.clone(), Some(peers.clone()), rx_svc);

        let client_api = ClientApi::new_and_setup(me, api_addr).await?;

        let (tx_evt, rx_evt) = mpsc::unbounded_channel();
        let (tx_done, rx_done) = mpsc::unbounded_channel();

        pf_info!(me; "delegator setup done: {} ranks, {} metadata servers",
                 population, num_meta_servers);
        Ok(Delegator {
            me,
            population,
            config,
            client_api,
            transport,
            peers,
            shard,
            shard_client,
            ctx,
            extents,
            attrs,
            registry,
            tx_svc,
            svc_handle: Some(svc_handle),
            tx_evt,
            rx_evt,
            tx_done,
            rx_done,
            reqmgrs: HashMap::new(),
            thrd_of: HashMap::new(),
            next_thrd: 0,
            retired: vec![],
            pending_reads: HashMap::new(),
        })
    }

    /// My delegator rank.
    pub fn id(&self) -> ServerRank {
        self.me
    }

    /// Main event loop logic of running this delegator.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), StagefsError> {
        loop {
            tokio::select! {
                // client RPC request
                req = self.client_api.get_req() => {
                    match req {
                        Ok((conn, req)) => self.handle_api_req(conn, req),
                        Err(e) => {
                            pf_error!(self.me; "error getting client req: {}",
                                      e);
                            continue;
                        }
                    }
                },

                // message from a peer delegator
                msg = self.transport.recv_msg() => {
                    match msg {
                        Ok((peer, msg)) => self.handle_peer_msg(peer, msg),
                        Err(e) => {
                            pf_error!(self.me; "error getting peer msg: {}",
                                      e);
                            continue;
                        }
                    }
                },

                // feedback from a spawned handler task
                evt = self.rx_evt.recv() => {
                    let Some(evt) = evt else { continue };
                    self.handle_loop_event(evt);
                },

                // read completion from a request manager
                done = self.rx_done.recv() => {
                    let Some(done) = done else { continue };
                    self.handle_read_done(done);
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.me; "delegator caught termination signal");
                    self.shutdown().await?;
                    return Ok(());
                },
            }
        }
    }

    /// Handles one inbound client request.
    fn handle_api_req(&mut self, conn: ConnId, req: ApiRequest) {
        match req {
            ApiRequest::Mount { info } => {
                if !info
                    .spill_data_path
                    .starts_with(&self.config.external_spill_dir)
                {
                    pf_warn!(self.me;
                             "client spill path '{}' outside spill dir '{}'",
                             info.spill_data_path,
                             self.config.external_spill_dir);
                }
                let code = match self.registry.mount(&info, conn) {
                    Ok(()) => errcode::OK,
                    Err(_) => errcode::BAD_REQUEST,
                };
                self.reply(
                    conn,
                    ApiReply::MountAck {
                        errcode: code,
                        rank: self.me,
                        num_delegators: self.population,
                    },
                );
            }

            ApiRequest::Fsync { app_id, client_id } => {
                if conn != conn_id(app_id, client_id) {
                    self.reply(
                        conn,
                        ApiReply::Fsync {
                            errcode: errcode::BAD_REQUEST,
                        },
                    );
                    return;
                }
                let me = self.me;
                let registry = self.registry.clone();
                let extents = self.extents.clone();
                let attrs = self.attrs.clone();
                let tx_evt = self.tx_evt.clone();
                tokio::spawn(async move {
                    let code = process_fsync(
                        me, &registry, &extents, &attrs, app_id, client_id,
                    )
                    .await;
                    let _ = tx_evt.send(LoopEvent::Reply {
                        conn,
                        reply: ApiReply::Fsync { errcode: code },
                    });
                });
            }

            ApiRequest::Read {
                app_id,
                client_id,
                req_cnt,
            } => {
                if conn != conn_id(app_id, client_id)
                    || self.registry.client(app_id, client_id).is_none()
                {
                    self.reply(
                        conn,
                        ApiReply::ReadDone {
                            errcode: errcode::BAD_REQUEST,
                            bytes_ok: 0,
                        },
                    );
                    return;
                }
                let thrd_id = match self.ensure_reqmgr(app_id, client_id) {
                    Ok(thrd_id) => thrd_id,
                    Err(e) => {
                        pf_error!(self.me;
                                  "error creating request manager: {}", e);
                        self.reply(
                            conn,
                            ApiReply::ReadDone {
                                errcode: errcode::NO_MEM,
                                bytes_ok: 0,
                            },
                        );
                        return;
                    }
                };

                let me = self.me;
                let registry = self.registry.clone();
                let extents = self.extents.clone();
                let tx_evt = self.tx_evt.clone();
                tokio::spawn(async move {
                    let (descs, code) = match resolve_read(
                        me, &registry, &extents, app_id, client_id, req_cnt,
                        thrd_id,
                    )
                    .await
                    {
                        Ok(res) => (res.descs, res.errcode),
                        Err(_) => (vec![], errcode::BAD_REQUEST),
                    };
                    let _ = tx_evt.send(LoopEvent::Resolved {
                        app_id,
                        client_id,
                        conn,
                        descs,
                        errcode: code,
                    });
                });
            }

            ApiRequest::GetAttr { gfid } => {
                let attrs = self.attrs.clone();
                let tx_evt = self.tx_evt.clone();
                tokio::spawn(async move {
                    let reply = match attrs.get(gfid).await {
                        Ok(Some(attr)) => ApiReply::Attr {
                            errcode: errcode::OK,
                            attr: Some(attr),
                        },
                        Ok(None) => ApiReply::Attr {
                            errcode: errcode::NOT_FOUND,
                            attr: None,
                        },
                        Err(_) => ApiReply::Attr {
                            errcode: errcode::KV,
                            attr: None,
                        },
                    };
                    let _ = tx_evt.send(LoopEvent::Reply { conn, reply });
                });
            }

            ApiRequest::Unmount { app_id, client_id } => {
                if conn != conn_id(app_id, client_id) {
                    self.reply(
                        conn,
                        ApiReply::UnmountAck {
                            errcode: errcode::BAD_REQUEST,
                        },
                    );
                    return;
                }
                // retire the client's request manager, if it ever read
                if let Some(handle) =
                    self.reqmgrs.remove(&(app_id, client_id))
                {
                    self.thrd_of.remove(&handle.thrd_id);
                    // dropping tx_work closes the work channel
                    self.retired.push(handle.handle);
                }
                let code = match self.registry.unmount(app_id, client_id) {
                    Ok(_) => errcode::OK,
                    Err(_) => errcode::BAD_REQUEST,
                };
                self.reply(conn, ApiReply::UnmountAck { errcode: code });
            }
        }
    }

    /// Handles one inbound peer message.
    fn handle_peer_msg(&mut self, from: ServerRank, msg: PeerMsg) {
        match msg {
            PeerMsg::Kv { seq, call } => {
                // serve against the local shard, reply to the asking rank
                let me = self.me;
                let shard = self.shard_client.clone();
                let peers = self.peers.clone();
                tokio::spawn(async move {
                    let done = match &shard {
                        Some(shard) => match shard.call(call.clone()).await {
                            Ok(done) => done,
                            Err(_) => call.error_done(errcode::KV),
                        },
                        None => {
                            pf_error!(me;
                                      "kv request but no shard hosted here");
                            call.error_done(errcode::BAD_REQUEST)
                        }
                    };
                    if let Err(e) =
                        peers.send_msg(PeerMsg::KvReply { seq, done }, from)
                    {
                        pf_error!(me; "error sending kv reply: {}", e);
                    }
                });
            }

            PeerMsg::KvReply { seq, done } => {
                self.ctx.complete(seq, done);
            }

            PeerMsg::Fetch { descs } => {
                if self
                    .tx_svc
                    .send(SvcEvent::Batch(FetchBatch {
                        descs,
                        origin: SvcOrigin::Remote { rank: from },
                        arrival: Instant::now(),
                    }))
                    .is_err()
                {
                    pf_error!(self.me; "service manager queue closed");
                }
            }

            PeerMsg::FetchReply { thrd, hdr, data } => {
                let handle = self
                    .thrd_of
                    .get(&thrd)
                    .and_then(|key| self.reqmgrs.get(key));
                match handle {
                    Some(handle) => {
                        let tx_reply = handle.tx_reply.clone();
                        // the ring is bounded; never block the event loop
                        tokio::spawn(async move {
                            let _ =
                                tx_reply.send(ReplyMsg { hdr, data }).await;
                        });
                    }
                    None => {
                        pf_warn!(self.me;
                                 "reply for unknown thread {}", thrd);
                    }
                }
            }
        }
    }

    /// Handles one feedback event from a spawned handler task.
    fn handle_loop_event(&mut self, evt: LoopEvent) {
        match evt {
            LoopEvent::Reply { conn, reply } => self.reply(conn, reply),

            LoopEvent::Resolved {
                app_id,
                client_id,
                conn,
                descs,
                errcode: code,
            } => {
                if descs.is_empty() {
                    // nothing to fetch: empty coverage or resolution error
                    self.reply(
                        conn,
                        ApiReply::ReadDone {
                            errcode: code,
                            bytes_ok: 0,
                        },
                    );
                    return;
                }
                match self.reqmgrs.get(&(app_id, client_id)) {
                    Some(handle) => {
                        self.pending_reads
                            .entry((app_id, client_id))
                            .or_default()
                            .push_back(conn);
                        if handle.tx_work.send(WorkUnit { descs }).is_err() {
                            pf_error!(self.me;
                                      "request manager work channel closed");
                        }
                    }
                    None => {
                        self.reply(
                            conn,
                            ApiReply::ReadDone {
                                errcode: errcode::SHUTDOWN,
                                bytes_ok: 0,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Handles one read completion from a request manager.
    fn handle_read_done(&mut self, done: ReadOutcome) {
        let key = (done.app_id, done.client_id);
        let conn = self
            .pending_reads
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        match conn {
            Some(conn) => {
                self.reply(
                    conn,
                    ApiReply::ReadDone {
                        errcode: done.errcode,
                        bytes_ok: done.bytes_ok,
                    },
                );
            }
            None => {
                pf_warn!(self.me;
                         "read completion with no pending conn for {}/{}",
                         done.app_id, done.client_id);
            }
        }
    }

    /// Returns the client's request-manager thread id, spawning the task
    /// on its first read.
    fn ensure_reqmgr(
        &mut self,
        app_id: AppId,
        client_id: ClientId,
    ) -> Result<ThreadId, StagefsError> {
        if let Some(handle) = self.reqmgrs.get(&(app_id, client_id)) {
            return Ok(handle.thrd_id);
        }

        let Some((app, slot)) = self.registry.client(app_id, client_id)
        else {
            return logged_err!(self.me; "client {}/{} not mounted", app_id,
                               client_id);
        };
        let thrd_id = self.next_thrd;
        self.next_thrd += 1;

        let handle = spawn_reqmgr(
            self.me,
            thrd_id,
            app,
            slot,
            Some(self.peers.clone()),
            self.tx_svc.clone(),
            self.tx_done.clone(),
            self.config.req_buf_len,
            self.config.recv_buf_cnt,
            self.config.sendrecv_buf_len,
        );
        self.thrd_of.insert(thrd_id, (app_id, client_id));
        self.reqmgrs.insert((app_id, client_id), handle);
        pf_debug!(self.me; "request manager {} created for app {} client {}",
                  thrd_id, app_id, client_id);
        Ok(thrd_id)
    }

    /// Sends a reply, logging (but tolerating) a gone connection.
    fn reply(&self, conn: ConnId, reply: ApiReply) {
        if let Err(e) = self.client_api.send_reply(reply, conn) {
            pf_warn!(self.me; "error replying to {:#x}: {}", conn, e);
        }
    }

    /// Graceful shutdown: closes every request manager's work channel and
    /// joins them in creation order, drains the service manager, then
    /// flushes and closes the local shard.
    pub async fn shutdown(&mut self) -> Result<(), StagefsError> {
        pf_info!(self.me; "delegator shutting down");

        let mut managers: Vec<((AppId, ClientId), ReqMgrHandle)> =
            self.reqmgrs.drain().collect();
        managers.sort_by_key(|(_, handle)| handle.thrd_id);
        for (_, handle) in managers {
            let ReqMgrHandle {
                thrd_id,
                tx_work,
                tx_reply: _,
                handle,
            } = handle;
            drop(tx_work); // exit signal
            handle.await?;
            pf_debug!(self.me; "request manager {} joined", thrd_id);
        }
        for handle in self.retired.drain(..) {
            handle.await?;
        }

        // answer reads cut short by the shutdown
        while let Ok(done) = self.rx_done.try_recv() {
            self.handle_read_done(done);
        }

        let _ = self.tx_svc.send(SvcEvent::Exit);
        if let Some(handle) = self.svc_handle.take() {
            handle.await?;
        }

        if let Some(shard) = &mut self.shard {
            shard.close(self.config.meta_db_sanitize).await?;
        }

        pf_info!(self.me; "delegator shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod delegator_tests {
    use super::*;

    #[test]
    fn config_log_levels() {
        assert_eq!(
            log_level_filter("FATAL").unwrap(),
            log::LevelFilter::Error
        );
        assert_eq!(log_level_filter("ERR").unwrap(), log::LevelFilter::Error);
        assert_eq!(log_level_filter("WARN").unwrap(), log::LevelFilter::Warn);
        assert_eq!(log_level_filter("INFO").unwrap(), log::LevelFilter::Info);
        assert_eq!(log_level_filter("DBG").unwrap(), log::LevelFilter::Debug);
        assert!(log_level_filter("LOUD").is_err());
    }

    #[test]
    fn config_parsing() -> Result<(), StagefsError> {
        let config_str = Some(
            "meta_range_size = 4096\nmeta_server_ratio = 2\n\
             meta_db_sanitize = true",
        );
        let config = parsed_config!(config_str => DelegatorConfig;
                                    meta_db_path, meta_db_name,
                                    meta_server_ratio, meta_range_size,
                                    external_spill_dir, log_level,
                                    meta_db_sanitize, req_buf_len,
                                    recv_buf_cnt, sendrecv_buf_len)?;
        assert_eq!(config.meta_range_size, 4096);
        assert_eq!(config.meta_server_ratio, 2);
        assert!(config.meta_db_sanitize);
        assert_eq!(config.meta_db_name, "metakv");
        Ok(())
    }

    #[test]
    fn config_rejects_unknown_field() {
        let config_str = Some("metadata_range = 10");
        assert!(parsed_config!(config_str => DelegatorConfig;
                               meta_range_size)
            .is_err());
    }
}
