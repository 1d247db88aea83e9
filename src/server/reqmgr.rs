//! Request manager: one task per mounted client, owning that client's
//! outstanding reads.
//!
//! Work units (resolved descriptor sets) arrive on an SPSC work channel;
//! closing the channel is the exit signal. For each work unit the manager
//! precomputes every descriptor's slot in the client's reply region, groups
//! descriptors per destination delegator, ships capped fetch batches
//! (locally into the service manager queue, remotely as peer messages), and
//! then deposits replies from its bounded reply ring until every
//! descriptor is accounted for, success or error. Completion is reported
//! back to the delegator event loop, which answers the client's read RPC.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::{
    errcode, AppId, ClientId, ReplyHeader, ServerRank, ThreadId,
    layout::REPLY_HDR_LEN,
};
use crate::server::appconfig::{AppConfig, ClientSlot};
use crate::server::resolver::SendDesc;
use crate::server::svcmgr::{FetchBatch, SvcEvent, SvcOrigin};
use crate::server::transport::TransportSender;
use crate::server::PeerMsg;
use crate::utils::StagefsError;

/// One resolved read: the descriptors to fetch, in reply-region order.
#[derive(Debug)]
pub(crate) struct WorkUnit {
    pub descs: Vec<SendDesc>,
}

/// One reply flowing into the reply ring, locally or from a peer.
#[derive(Debug)]
pub(crate) struct ReplyMsg {
    pub hdr: ReplyHeader,
    pub data: Vec<u8>,
}

/// Completion of one work unit, reported to the delegator event loop.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ReadOutcome {
    pub app_id: AppId,
    pub client_id: ClientId,
    pub errcode: i32,
    pub bytes_ok: u64,
}

/// Handle to a running request manager task.
pub(crate) struct ReqMgrHandle {
    pub thrd_id: ThreadId,
    pub tx_work: mpsc::UnboundedSender<WorkUnit>,
    pub tx_reply: mpsc::Sender<ReplyMsg>,
    pub handle: JoinHandle<()>,
}

/// Observable task state, for logging and tests.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum RmState {
    Idle,
    Dispatching,
    AwaitingReplies,
    Exiting,
}

/// Everything one request manager task needs.
struct ReqMgr {
    me: ServerRank,
    thrd_id: ThreadId,
    app_id: AppId,
    client_id: ClientId,

    app: Arc<AppConfig>,
    slot: Arc<ClientSlot>,

    peers: Option<TransportSender<PeerMsg>>,
    tx_svc: mpsc::UnboundedSender<SvcEvent>,
    tx_done: mpsc::UnboundedSender<ReadOutcome>,

    rx_work: mpsc::UnboundedReceiver<WorkUnit>,
    rx_reply: mpsc::Receiver<ReplyMsg>,
    /// Sender side of the reply ring, handed to the service manager for
    /// local fetches.
    tx_reply: mpsc::Sender<ReplyMsg>,

    /// Max serialized bytes per outgoing fetch batch; oversize buckets are
    /// split into sequential messages.
    req_buf_len: usize,

    /// Max payload bytes requested per fetch batch, bounding the size of
    /// any one reply burst.
    sendrecv_buf_len: usize,

    state: RmState,
    /// Work units that arrived while one was in flight.
    backlog: VecDeque<WorkUnit>,
}

/// Rough serialized footprint of one descriptor in a fetch message, used
/// to cap batch sizes.
const DESC_WIRE_LEN: usize = 96;

/// Spawns a request manager task for one client; called lazily on the
/// first read from that client.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_reqmgr(
    me: ServerRank,
    thrd_id: ThreadId,
    app: Arc<AppConfig>,
    slot: Arc<ClientSlot>,
    peers: Option<TransportSender<PeerMsg>>,
    tx_svc: mpsc::UnboundedSender<SvcEvent>,
    tx_done: mpsc::UnboundedSender<ReadOutcome>,
    req_buf_len: usize,
    recv_buf_cnt: usize,
    sendrecv_buf_len: usize,
) -> ReqMgrHandle {
    let (tx_work, rx_work) = mpsc::unbounded_channel();
    let (tx_reply, rx_reply) = mpsc::channel(recv_buf_cnt.max(1));

    let mgr = ReqMgr {
        me,
        thrd_id,
        app_id: app.app_id,
        client_id: slot.client_id,
        app,
        slot,
        peers,
        tx_svc,
        tx_done,
        rx_work,
        rx_reply,
        tx_reply: tx_reply.clone(),
        req_buf_len,
        sendrecv_buf_len,
        state: RmState::Idle,
        backlog: VecDeque::new(),
    };
    let handle = tokio::spawn(async move { mgr.run().await });

    ReqMgrHandle {
        thrd_id,
        tx_work,
        tx_reply,
        handle,
    }
}

impl ReqMgr {
    /// Request manager task loop.
    async fn run(mut self) {
        pf_debug!(self.me; "request manager {} for app {} client {} spawned",
                  self.thrd_id, self.app_id, self.client_id);

        loop {
            let unit = match self.backlog.pop_front() {
                Some(unit) => unit,
                None => match self.rx_work.recv().await {
                    Some(unit) => unit,
                    None => break, // exit signal: work channel closed
                },
            };
            if !self.process_unit(unit).await {
                break;
            }
            self.state = RmState::Idle;
        }

        self.state = RmState::Exiting;
        pf_debug!(self.me; "request manager {} exited", self.thrd_id);
    }

    /// Dispatches one work unit and awaits all of its replies. Returns
    /// false when the exit signal arrived mid-flight.
    async fn process_unit(&mut self, unit: WorkUnit) -> bool {
        self.state = RmState::Dispatching;
        pf_trace!(self.me; "reqmgr {} state -> {:?}", self.thrd_id,
                  self.state);
        let mut descs = unit.descs;
        for desc in descs.iter_mut() {
            desc.src_thrd = self.thrd_id;
        }

        // slot offsets in the reply region: count word, then one
        // (header + data) slot per descriptor in descriptor order
        let mut slots = Vec::with_capacity(descs.len());
        let mut cursor = 8usize;
        for desc in &descs {
            slots.push(cursor);
            cursor += REPLY_HDR_LEN + desc.length as usize;
        }
        if cursor > self.app.recv_buf_sz {
            pf_error!(self.me; "work unit needs {} reply bytes, region {}",
                      cursor, self.app.recv_buf_sz);
            let _ = self.slot.reply_buf.write_u64(0, 0);
            let _ = self.tx_done.send(ReadOutcome {
                app_id: self.app_id,
                client_id: self.client_id,
                errcode: errcode::NO_MEM,
                bytes_ok: 0,
            });
            return true;
        }

        // replies are matched back by (fid, logical offset); duplicates
        // queue up in arrival order
        let mut by_key: HashMap<(u64, u64), VecDeque<usize>> = HashMap::new();
        for (i, desc) in descs.iter().enumerate() {
            by_key
                .entry((desc.src_fid, desc.src_offset))
                .or_default()
                .push_back(i);
        }

        // group per destination delegator, preserving descriptor order
        let mut buckets: BTreeMap<ServerRank, Vec<SendDesc>> = BTreeMap::new();
        for desc in &descs {
            buckets
                .entry(desc.dest_delegator)
                .or_default()
                .push(desc.clone());
        }

        let mut outcome = ReadOutcome {
            app_id: self.app_id,
            client_id: self.client_id,
            errcode: errcode::OK,
            bytes_ok: 0,
        };
        let mut deposited = vec![false; descs.len()];
        let mut completed = 0usize;

        let max_per_batch = (self.req_buf_len / DESC_WIRE_LEN).max(1);
        for (dest, bucket) in buckets {
            pf_trace!(self.me; "dispatching {} descs -> delegator {}",
                      bucket.len(), dest);
            for chunk in
                split_batches(bucket, max_per_batch, self.sendrecv_buf_len)
            {
                let sent = if dest == self.me {
                    self.tx_svc
                        .send(SvcEvent::Batch(FetchBatch {
                            descs: chunk.clone(),
                            origin: SvcOrigin::Local {
                                tx_reply: self.tx_reply_clone(),
                            },
                            arrival: Instant::now(),
                        }))
                        .map_err(StagefsError::from)
                } else {
                    match &self.peers {
                        Some(peers) => peers.send_msg(
                            PeerMsg::Fetch {
                                descs: chunk.clone(),
                            },
                            dest,
                        ),
                        None => Err(StagefsError::msg("no transport")),
                    }
                };

                if let Err(e) = sent {
                    // a transport error shortens the read but does not
                    // abort the rest of the batch
                    pf_error!(self.me;
                              "error dispatching to delegator {}: {}",
                              dest, e);
                    for desc in &chunk {
                        let hdr = ReplyHeader {
                            fid: desc.src_fid,
                            offset: desc.src_offset,
                            length: desc.length,
                            errcode: errcode::TRANSPORT,
                        };
                        self.deposit(
                            &hdr,
                            &[],
                            &mut by_key,
                            &slots,
                            &mut deposited,
                            &mut completed,
                            &mut outcome,
                        );
                    }
                }
            }
        }

        self.state = RmState::AwaitingReplies;
        pf_trace!(self.me; "reqmgr {} state -> {:?}", self.thrd_id,
                  self.state);
        while completed < descs.len() {
            tokio::select! {
                reply = self.rx_reply.recv() => {
                    let Some(ReplyMsg { hdr, data }) = reply else {
                        break;
                    };
                    self.deposit(
                        &hdr,
                        &data,
                        &mut by_key,
                        &slots,
                        &mut deposited,
                        &mut completed,
                        &mut outcome,
                    );
                },

                work = self.rx_work.recv() => {
                    match work {
                        Some(unit) => {
                            // lockstep clients make this rare; keep it for
                            // after the in-flight unit completes
                            self.backlog.push_back(unit);
                        },
                        None => {
                            // exit observed mid-flight: drain replies
                            // already received, then report Shutdown
                            while let Ok(ReplyMsg { hdr, data }) =
                                self.rx_reply.try_recv()
                            {
                                self.deposit(
                                    &hdr,
                                    &data,
                                    &mut by_key,
                                    &slots,
                                    &mut deposited,
                                    &mut completed,
                                    &mut outcome,
                                );
                            }
                            let _ = self.slot.reply_buf
                                .write_u64(0, completed as u64);
                            outcome.errcode = errcode::SHUTDOWN;
                            let _ = self.tx_done.send(outcome);
                            return false;
                        },
                    }
                },
            }
        }

        // publish the reply count; every descriptor got exactly one reply
        if let Err(e) = self.slot.reply_buf.write_u64(0, completed as u64) {
            pf_error!(self.me; "error writing reply count: {}", e);
            if outcome.errcode == errcode::OK {
                outcome.errcode = errcode::NO_MEM;
            }
        }
        if let Err(e) = self.tx_done.send(outcome) {
            pf_error!(self.me; "error sending read outcome: {}", e);
        }
        true
    }

    fn tx_reply_clone(&self) -> mpsc::Sender<ReplyMsg> {
        // the bounded ring sender; the receive side lives in this task
        self.tx_reply.clone()
    }

    /// Writes one reply into its slot of the client's reply region.
    #[allow(clippy::too_many_arguments)]
    fn deposit(
        &self,
        hdr: &ReplyHeader,
        data: &[u8],
        by_key: &mut HashMap<(u64, u64), VecDeque<usize>>,
        slots: &[usize],
        deposited: &mut [bool],
        completed: &mut usize,
        outcome: &mut ReadOutcome,
    ) {
        let Some(queue) = by_key.get_mut(&(hdr.fid, hdr.offset)) else {
            pf_warn!(self.me; "unmatched reply fid {} offset {}", hdr.fid,
                     hdr.offset);
            return;
        };
        let Some(idx) = queue.pop_front() else {
            pf_warn!(self.me; "surplus reply fid {} offset {}", hdr.fid,
                     hdr.offset);
            return;
        };
        debug_assert!(!deposited[idx]);

        let slot_off = slots[idx];
        let mut hdr_bytes = [0u8; REPLY_HDR_LEN];
        hdr.encode(&mut hdr_bytes);
        if let Err(e) = self.slot.reply_buf.write_at(slot_off, &hdr_bytes) {
            pf_error!(self.me; "error writing reply header: {}", e);
        } else if hdr.errcode == errcode::OK
            && data.len() == hdr.length as usize
        {
            if let Err(e) = self
                .slot
                .reply_buf
                .write_at(slot_off + REPLY_HDR_LEN, data)
            {
                pf_error!(self.me; "error writing reply data: {}", e);
            } else {
                outcome.bytes_ok += hdr.length;
            }
        }
        if hdr.errcode != errcode::OK && outcome.errcode == errcode::OK {
            outcome.errcode = hdr.errcode;
        }

        deposited[idx] = true;
        *completed += 1;
    }
}

/// Splits one destination's descriptors into batches bounded both by
/// descriptor count (serialized request size) and by total payload bytes
/// (reply burst size). A single oversized descriptor still travels alone.
fn split_batches(
    bucket: Vec<SendDesc>,
    max_descs: usize,
    max_bytes: usize,
) -> Vec<Vec<SendDesc>> {
    let mut batches = vec![];
    let mut batch: Vec<SendDesc> = vec![];
    let mut batch_bytes = 0u64;
    for desc in bucket {
        if !batch.is_empty()
            && (batch.len() >= max_descs
                || batch_bytes + desc.length > max_bytes as u64)
        {
            batches.push(std::mem::take(&mut batch));
            batch_bytes = 0;
        }
        batch_bytes += desc.length;
        batch.push(desc);
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

#[cfg(test)]
mod reqmgr_tests {
    use super::*;

    fn desc(length: u64) -> SendDesc {
        SendDesc {
            dest_app_id: 1,
            dest_client_id: 0,
            dest_delegator: 0,
            dest_offset: 0,
            length,
            src_delegator: 0,
            src_app_id: 1,
            src_client_id: 0,
            src_thrd: 0,
            src_dbg_rank: 0,
            src_fid: 7,
            src_offset: 0,
        }
    }

    #[test]
    fn batches_split_by_count() {
        let bucket: Vec<SendDesc> = (0..7).map(|_| desc(10)).collect();
        let batches = split_batches(bucket, 3, usize::MAX);
        assert_eq!(
            batches.iter().map(|b| b.len()).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
    }

    #[test]
    fn batches_split_by_payload() {
        let bucket = vec![desc(600), desc(600), desc(600)];
        let batches = split_batches(bucket, 100, 1000);
        assert_eq!(batches.len(), 3);
    }

    #[test]
    fn oversized_descriptor_travels_alone() {
        let bucket = vec![desc(5000), desc(10)];
        let batches = split_batches(bucket, 100, 1000);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].length, 5000);
    }

    #[test]
    fn empty_bucket_yields_no_batches() {
        assert!(split_batches(vec![], 4, 1000).is_empty());
    }

    use crate::common::SuperblockLayout;
    use crate::utils::{page_size, ShmRegion};

    /// Builds a mounted-looking app/client pair over real shm regions and
    /// temp spill files, without a delegator.
    fn fake_client(
        tag: &str,
    ) -> Result<(Arc<AppConfig>, Arc<ClientSlot>), crate::utils::StagefsError>
    {
        let page = page_size();
        let layout = SuperblockLayout::compute(page, page, page, page);
        let super_name =
            format!("stagefs-rm-test-super-{}-{}", tag, std::process::id());
        let req_name =
            format!("stagefs-rm-test-req-{}-{}", tag, std::process::id());
        let reply_name =
            format!("stagefs-rm-test-reply-{}-{}", tag, std::process::id());
        let spill_path = std::env::temp_dir()
            .join(format!("stagefs-rm-test-{}-{}", tag, std::process::id()));
        let spill = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&spill_path)?;

        let app = Arc::new(AppConfig::new(9, layout, 1 << 16, 1 << 16));
        let slot = Arc::new(ClientSlot {
            client_id: 0,
            dbg_rank: 0,
            conn: 0,
            superblock: ShmRegion::create(&super_name, layout.superblock_sz)?,
            req_buf: ShmRegion::create(&req_name, 1 << 16)?,
            reply_buf: ShmRegion::create(&reply_name, 1 << 16)?,
            spill_data: spill.try_clone()?,
            spill_index: spill,
            super_name,
            spill_data_path: spill_path.to_string_lossy().into_owned(),
        });
        app.register(slot.clone());
        Ok((app, slot))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_with_outstanding_descriptors(
    ) -> Result<(), crate::utils::StagefsError> {
        let (app, slot) = fake_client("exit")?;
        let (tx_svc, mut rx_svc) = mpsc::unbounded_channel();
        let (tx_done, mut rx_done) = mpsc::unbounded_channel();

        let handle = spawn_reqmgr(
            0,
            3,
            app,
            slot,
            None,
            tx_svc,
            tx_done,
            64 << 10,
            8,
            1 << 20,
        );

        // five descriptors go out to the (never-serviced) local queue
        let descs: Vec<SendDesc> = (0..5)
            .map(|i| {
                let mut d = desc(16);
                d.src_offset = i * 16;
                d
            })
            .collect();
        handle
            .tx_work
            .send(WorkUnit { descs })
            .map_err(crate::utils::StagefsError::msg)?;

        // the batch reaches the service queue; we deliver exactly one
        // reply and withhold the rest
        let Some(SvcEvent::Batch(batch)) = rx_svc.recv().await else {
            panic!("expected a fetch batch");
        };
        assert_eq!(batch.descs.len(), 5);
        handle
            .tx_reply
            .send(ReplyMsg {
                hdr: ReplyHeader {
                    fid: 7,
                    offset: 0,
                    length: 16,
                    errcode: errcode::OK,
                },
                data: vec![0xabu8; 16],
            })
            .await
            .map_err(crate::utils::StagefsError::msg)?;

        // exit signal with four descriptors still outstanding: the task
        // must drain what it received, report Shutdown, and terminate
        drop(handle.tx_work);
        let done = rx_done.recv().await.unwrap();
        assert_eq!(done.errcode, errcode::SHUTDOWN);
        assert_eq!(done.bytes_ok, 16);
        handle.handle.await.map_err(crate::utils::StagefsError::msg)?;
        Ok(())
    }
}
