//! Service manager: serves inbound fetch batches against this node's logs.
//!
//! One task per delegator. Batches arrive from remote delegators (via the
//! event loop) and from local request managers; each is stamped with its
//! arrival time on ingress and queued oldest-first, so backlogged reads
//! from slow peers are not starved by a fresh burst. For every descriptor
//! the data comes either from the owning client's in-memory data log
//! (superblock region) or, past its end, from the client's spill file.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::os::unix::fs::FileExt;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::{errcode, ReplyHeader, ServerRank};
use crate::server::appconfig::AppRegistry;
use crate::server::reqmgr::ReplyMsg;
use crate::server::resolver::SendDesc;
use crate::server::transport::TransportSender;
use crate::server::PeerMsg;
use crate::utils::StagefsError;
use std::sync::Arc;

/// Where the replies of a fetch batch go.
pub(crate) enum SvcOrigin {
    /// A request manager on this delegator; replies go straight into its
    /// reply ring.
    Local {
        tx_reply: mpsc::Sender<ReplyMsg>,
    },

    /// A remote delegator; replies travel back as peer messages.
    Remote { rank: ServerRank },
}

/// One inbound fetch batch.
pub(crate) struct FetchBatch {
    pub descs: Vec<SendDesc>,
    pub origin: SvcOrigin,
    /// Stamped on ingress; older batches are serviced first.
    pub arrival: Instant,
}

/// Events consumed by the service manager task.
pub(crate) enum SvcEvent {
    Batch(FetchBatch),
    /// Drain whatever is queued, then exit cleanly.
    Exit,
}

/// Heap entry ordering batches oldest-first (ties broken by ingress
/// sequence).
struct QueuedBatch {
    arrival: Instant,
    seq: u64,
    batch: FetchBatch,
}

impl PartialEq for QueuedBatch {
    fn eq(&self, other: &Self) -> bool {
        self.arrival == other.arrival && self.seq == other.seq
    }
}
impl Eq for QueuedBatch {}
impl PartialOrd for QueuedBatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedBatch {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap pops the maximum, we want the oldest
        (other.arrival, other.seq).cmp(&(self.arrival, self.seq))
    }
}

/// Spawns the service manager task.
pub(crate) fn spawn_svcmgr(
    me: ServerRank,
    registry: Arc<AppRegistry>,
    peers: Option<TransportSender<PeerMsg>>,
    rx_svc: mpsc::UnboundedReceiver<SvcEvent>,
) -> JoinHandle<()> {
    tokio::spawn(svcmgr_task(me, registry, peers, rx_svc))
}

/// Service manager task function.
async fn svcmgr_task(
    me: ServerRank,
    registry: Arc<AppRegistry>,
    peers: Option<TransportSender<PeerMsg>>,
    mut rx_svc: mpsc::UnboundedReceiver<SvcEvent>,
) {
    pf_debug!(me; "service manager task spawned");

    let mut queue: BinaryHeap<QueuedBatch> = BinaryHeap::new();
    let mut next_seq = 0u64;
    let mut exiting = false;

    'outer: loop {
        // block for work only when the queue ran dry
        if queue.is_empty() {
            if exiting {
                break;
            }
            match rx_svc.recv().await {
                Some(SvcEvent::Batch(batch)) => {
                    let arrival = batch.arrival;
                    queue.push(QueuedBatch {
                        arrival,
                        seq: next_seq,
                        batch,
                    });
                    next_seq += 1;
                }
                Some(SvcEvent::Exit) | None => break,
            }
        }

        // opportunistically drain new arrivals so older batches win
        loop {
            match rx_svc.try_recv() {
                Ok(SvcEvent::Batch(batch)) => {
                    let arrival = batch.arrival;
                    queue.push(QueuedBatch {
                        arrival,
                        seq: next_seq,
                        batch,
                    });
                    next_seq += 1;
                }
                Ok(SvcEvent::Exit) => {
                    exiting = true;
                    break;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    exiting = true;
                    break;
                }
            }
        }

        let Some(queued) = queue.pop() else {
            if exiting {
                break 'outer;
            }
            continue;
        };
        serve_batch(me, &registry, &peers, queued.batch).await;
    }

    pf_debug!(me; "service manager task exited");
}

/// Serves all descriptors of one batch, sending one reply each.
async fn serve_batch(
    me: ServerRank,
    registry: &AppRegistry,
    peers: &Option<TransportSender<PeerMsg>>,
    batch: FetchBatch,
) {
    for desc in batch.descs {
        let (hdr, data) = match read_piece(registry, &desc) {
            Ok(data) => (
                ReplyHeader {
                    fid: desc.src_fid,
                    offset: desc.src_offset,
                    length: desc.length,
                    errcode: errcode::OK,
                },
                data,
            ),
            Err((code, e)) => {
                pf_warn!(me; "fetch of app {} client {} offset {} failed: {}",
                         desc.dest_app_id, desc.dest_client_id,
                         desc.dest_offset, e);
                (
                    ReplyHeader {
                        fid: desc.src_fid,
                        offset: desc.src_offset,
                        length: desc.length,
                        errcode: code,
                    },
                    vec![],
                )
            }
        };

        match &batch.origin {
            SvcOrigin::Local { tx_reply } => {
                if tx_reply.send(ReplyMsg { hdr, data }).await.is_err() {
                    pf_warn!(me; "local reply ring closed, dropping reply");
                }
            }
            SvcOrigin::Remote { rank } => {
                let msg = PeerMsg::FetchReply {
                    thrd: desc.src_thrd,
                    hdr,
                    data,
                };
                let sent = match peers {
                    Some(peers) => peers.send_msg(msg, *rank),
                    None => Err(StagefsError::msg("no transport")),
                };
                if let Err(e) = sent {
                    pf_error!(me; "error replying to delegator {}: {}",
                              rank, e);
                }
            }
        }
    }
}

/// Reads the bytes of one descriptor from the data log or the spill file.
fn read_piece(
    registry: &AppRegistry,
    desc: &SendDesc,
) -> Result<Vec<u8>, (i32, StagefsError)> {
    let Some((app, slot)) =
        registry.client(desc.dest_app_id, desc.dest_client_id)
    else {
        return Err((
            errcode::BAD_REQUEST,
            StagefsError::msg("unknown app/client"),
        ));
    };

    let data_size = app.layout.data_size as u64;
    let mut data = vec![0u8; desc.length as usize];
    if desc.dest_offset + desc.length <= data_size {
        // in-memory portion of the log lives in the superblock region
        slot.superblock
            .read_at(
                app.layout.data_offset + desc.dest_offset as usize,
                &mut data,
            )
            .map_err(|e| (errcode::KV, e))?;
    } else if desc.dest_offset >= data_size {
        // log offsets past the in-memory size address the spill file
        slot.spill_data
            .read_exact_at(&mut data, desc.dest_offset - data_size)
            .map_err(|e| (errcode::KV, e.into()))?;
    } else {
        // writers never let one extent straddle the log/spill boundary
        return Err((
            errcode::BAD_REQUEST,
            StagefsError::msg("extent straddles log/spill boundary"),
        ));
    }
    Ok(data)
}
